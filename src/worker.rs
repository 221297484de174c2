//! Worker invocation: argument construction, spawning, synchronous queries.

use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{Error, Result};
use crate::job::JobKind;
use crate::target::Target;

/// How workers are located and flavored. Built once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker executable.
    pub binary: PathBuf,
    /// Where the notify socket lives; exported as NOTIFY_SOCKET to workers.
    pub notify_socket: PathBuf,
    /// Pass --verify=no to the worker (testing knob).
    pub no_verify: bool,
}

impl WorkerConfig {
    /// Build the config from defaults plus the two environment knobs:
    /// SYSUPDATE_WORKER overrides the binary path, SYSUPDATE_NO_VERIFY
    /// disables signature verification.
    pub fn from_env(default_binary: PathBuf, notify_socket: PathBuf) -> Self {
        let binary = std::env::var_os("SYSUPDATE_WORKER")
            .map(PathBuf::from)
            .unwrap_or(default_binary);
        let no_verify = std::env::var("SYSUPDATE_NO_VERIFY")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        Self {
            binary,
            notify_socket,
            no_verify,
        }
    }
}

/// Build the worker argument vector for one job.
pub fn build_args(
    cfg: &WorkerConfig,
    target: &Target,
    kind: JobKind,
    version: Option<&str>,
    offline: bool,
) -> Result<Vec<String>> {
    let mut args = vec!["--json=short".to_string()];

    if cfg.no_verify {
        args.push("--verify=no".to_string());
    }

    if let Some(selector) = target.selector_arg()? {
        args.push(selector);
    }

    if offline {
        args.push("--offline".to_string());
    }

    match kind {
        JobKind::List => args.push("list".to_string()),
        JobKind::Describe => {
            args.push("list".to_string());
            let version = version.filter(|v| !v.is_empty()).ok_or_else(|| {
                Error::InvalidArgs("Version must be specified".to_string())
            })?;
            args.push(version.to_string());
        }
        JobKind::CheckNew => args.push("check-new".to_string()),
        JobKind::Update => {
            args.push("update".to_string());
            if let Some(version) = version.filter(|v| !v.is_empty()) {
                args.push(version.to_string());
            }
        }
        JobKind::Vacuum => args.push("vacuum".to_string()),
    }

    Ok(args)
}

/// A spawned worker: the child handle plus the seekable stdout capture.
pub struct SpawnedWorker {
    pub child: Child,
    pub stdout: File,
    pub pid: u32,
}

/// Spawn the worker for a job. Stdout goes to an anonymous memfd so the
/// final JSON document can be re-read after exit; the notify socket path is
/// exported so the worker can stream progress back.
pub fn spawn(
    cfg: &WorkerConfig,
    target: &Target,
    kind: JobKind,
    version: Option<&str>,
    offline: bool,
) -> Result<SpawnedWorker> {
    let args = build_args(cfg, target, kind, version, offline)?;

    let memfd =
        memfd_create(c"sysupdate-stdout", MemFdCreateFlag::MFD_CLOEXEC).map_err(io_error)?;
    let stdout = File::from(memfd);

    debug!(binary = %cfg.binary.display(), args = ?args, "spawning worker");

    let mut cmd = Command::new(&cfg.binary);
    cmd.args(&args)
        .env("NOTIFY_SOCKET", &cfg.notify_socket)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout.try_clone().map_err(Error::Io)?))
        .stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(Error::Io)?;
    let pid = child
        .id()
        .ok_or_else(|| Error::Internal("worker exited before its pid could be read".to_string()))?;

    Ok(SpawnedWorker { child, stdout, pid })
}

/// Run the worker for a short synchronous query (piped stdout, no notify
/// handling) and parse its JSON document. Used for version and appstream
/// reads and for component listing.
pub async fn run_simple(
    cfg: &WorkerConfig,
    target: Option<&Target>,
    extra: &[&str],
    verb: &'static str,
) -> Result<Value> {
    let mut args = vec!["--json=short".to_string()];
    if cfg.no_verify {
        args.push("--verify=no".to_string());
    }
    if let Some(target) = target
        && let Some(selector) = target.selector_arg()?
    {
        args.push(selector);
    }
    args.extend(extra.iter().map(|s| s.to_string()));

    debug!(binary = %cfg.binary.display(), args = ?args, "running worker query");

    let output = Command::new(&cfg.binary)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(Error::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Protocol {
            verb,
            message: format!("worker query failed: {}", stderr.trim()),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(Error::Json)
}

fn io_error(e: nix::errno::Errno) -> Error {
    Error::Io(e.into())
}
