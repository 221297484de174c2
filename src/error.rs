//! Error types for sysupdated.

use std::fmt;
use std::io;

/// Errors surfaced by manager operations and worker jobs.
#[derive(Debug)]
pub enum Error {
    /// Caller passed invalid arguments (unknown flag bits, empty version, ...).
    InvalidArgs(String),
    /// The policy service denied the operation.
    AccessDenied(String),
    /// The policy service requires interactive authentication for this
    /// operation; the client has to retry interactively.
    InteractionRequired,
    /// A mutating job is already running on the target.
    TargetBusy(String),
    UnknownTarget(String),
    UnknownJob(u64),
    /// An update worker exited successfully before doing any work, meaning
    /// the target is already up to date.
    NoUpdateCandidate,
    /// The worker produced JSON we cannot interpret.
    Protocol {
        verb: &'static str,
        message: String,
    },
    /// The worker was terminated by a signal.
    WorkerSignaled(i32),
    /// The worker exited non-zero without reporting an errno.
    WorkerFailed(i32),
    /// The worker reported an errno over the notify channel before failing.
    WorkerErrno(i32),
    /// The policy service could not be consulted.
    Policy(String),
    Internal(String),
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgs(msg) => write!(f, "{msg}"),
            Error::AccessDenied(action) => write!(f, "Access denied by policy for {action}"),
            Error::InteractionRequired => {
                write!(f, "Interactive authentication required")
            }
            Error::TargetBusy(id) => write!(f, "Target {id} is busy"),
            Error::UnknownTarget(id) => write!(f, "Target {id} not found"),
            Error::UnknownJob(id) => write!(f, "Job {id} not found"),
            Error::NoUpdateCandidate => write!(
                f,
                "Job exited successfully with no work to do, assume already updated"
            ),
            Error::Protocol { verb, message } => {
                write!(f, "Invalid response from worker '{verb}': {message}")
            }
            Error::WorkerSignaled(sig) => {
                write!(f, "Job terminated abnormally with signal {}", signal_name(*sig))
            }
            Error::WorkerFailed(code) => write!(f, "Job failed with exit code {code}"),
            Error::WorkerErrno(errno) => {
                write!(f, "Job failed: {}", nix::errno::Errno::from_raw(*errno).desc())
            }
            Error::Policy(msg) => write!(f, "Policy check failed: {msg}"),
            Error::Internal(msg) => write!(f, "{msg}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

fn signal_name(sig: i32) -> String {
    match nix::sys::signal::Signal::try_from(sig) {
        Ok(s) => s.as_str().to_string(),
        Err(_) => sig.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(4096), "4096");
    }
}
