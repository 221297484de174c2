//! The manager: job lifecycle, target registry, idle gate.
//!
//! All coordination state lives in one locked structure owned by the
//! manager. Jobs and targets are plain records in id-keyed maps; the exit
//! handler is the single point of job destruction.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::discovery;
use crate::error::{Error, Result};
use crate::job::{self, JobKind, JobReply};
use crate::notify;
use crate::policy::{PolicyAction, PolicyClient, one_zero};
use crate::target::{Target, TargetClass};
use crate::worker::{self, SpawnedWorker, WorkerConfig};

const IDLE_POLL: Duration = Duration::from_secs(1);

/// Signals emitted on the manager's event stream.
#[derive(Debug, Clone)]
pub enum JobSignal {
    Progress {
        id: u64,
        object_path: String,
        percent: u32,
    },
    /// A detached job finished. Status is the negated errno reported over
    /// the notify channel if any, else the exit code, else 128 plus the
    /// fatal signal.
    Removed {
        id: u64,
        object_path: String,
        status: i32,
    },
}

/// Snapshot of one job for the RMI surface.
#[derive(Debug, Clone)]
pub struct JobView {
    pub id: u64,
    pub kind: JobKind,
    pub offline: bool,
    pub progress: u32,
    pub object_path: String,
}

struct JobEntry {
    id: u64,
    kind: JobKind,
    target_id: String,
    object_path: String,
    offline: bool,
    version: Option<String>,
    progress: u32,
    /// Last errno the worker reported over the notify channel, 0 if none.
    status_errno: i32,
    n_cancelled: u32,
    /// Worker pid; 0 until the worker has been spawned.
    pid: u32,
    /// True once an update job answered its caller on READY=1.
    detached: bool,
    reply_tx: Option<oneshot::Sender<JobReply>>,
}

struct State {
    /// Lazily discovered target registry; None means flushed.
    targets: Option<HashMap<String, Target>>,
    jobs: HashMap<u64, JobEntry>,
    last_job_id: u64,
}

pub struct Manager {
    worker: WorkerConfig,
    policy: PolicyClient,
    image_root: PathBuf,
    state: Mutex<State>,
    events: broadcast::Sender<JobSignal>,
    last_activity: Mutex<Instant>,
    /// Back-reference handed to per-job reaper tasks.
    weak: Weak<Manager>,
}

impl Manager {
    pub fn new(worker: WorkerConfig, policy: PolicyClient, image_root: PathBuf) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak| Self {
            worker,
            policy,
            image_root,
            state: Mutex::new(State {
                targets: None,
                jobs: HashMap::new(),
                last_job_id: 0,
            }),
            events,
            last_activity: Mutex::new(Instant::now()),
            weak: weak.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobSignal> {
        self.events.subscribe()
    }

    /// Record RMI activity for the idle gate.
    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Resolve once the daemon has been idle (no jobs, no RMI activity) for
    /// `window`. Never resolves when `window` is zero.
    pub async fn wait_idle(self: Arc<Self>, window: Duration) {
        if window.is_zero() {
            std::future::pending::<()>().await;
        }
        loop {
            tokio::time::sleep(IDLE_POLL).await;
            let jobs_empty = self.state.lock().await.jobs.is_empty();
            if jobs_empty && self.last_activity.lock().await.elapsed() >= window {
                info!("idle for {}s, exiting", window.as_secs());
                return;
            }
        }
    }

    // === Target registry ===

    /// Populate the target registry if it is currently flushed.
    async fn ensure_targets(&self, state: &mut State) -> Result<()> {
        if state.targets.is_some() {
            return Ok(());
        }
        state.targets = Some(self.enumerate_targets().await?);
        Ok(())
    }

    async fn enumerate_targets(&self) -> Result<HashMap<String, Target>> {
        let mut targets = HashMap::new();

        for class in TargetClass::IMAGE_CLASSES {
            if let Err(e) = self.enumerate_image_class(&mut targets, class).await {
                warn!(class = class.as_str(), error = %e, "failed to enumerate image class, ignoring");
            }
        }

        let listing = discovery::list_components(&self.worker, None).await?;
        if listing.have_default {
            let t = Target::new(TargetClass::Host, "host", "sysupdate.d");
            targets.insert(t.id.clone(), t);
        }
        for name in listing.components {
            let t = Target::new(TargetClass::Component, &name, &format!("sysupdate.{name}.d"));
            targets.insert(t.id.clone(), t);
        }

        debug!(count = targets.len(), "target registry populated");
        Ok(targets)
    }

    async fn enumerate_image_class(
        &self,
        targets: &mut HashMap<String, Target>,
        class: TargetClass,
    ) -> Result<()> {
        for image in discovery::discover_images(&self.image_root, class).await? {
            let mut t = Target::new(class, &image.name, &image.path.to_string_lossy());
            t.image_kind = image.kind;

            let listing = discovery::list_components(&self.worker, Some(&t)).await?;
            if !listing.have_default {
                debug!(path = %image.path.display(), "skipping image without default component");
                continue;
            }

            targets.insert(t.id.clone(), t);
        }
        Ok(())
    }

    pub async fn targets_snapshot(&self) -> Result<Vec<Target>> {
        let mut state = self.state.lock().await;
        self.ensure_targets(&mut state).await?;
        let mut targets: Vec<Target> = state.targets.as_ref().unwrap().values().cloned().collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(targets)
    }

    pub async fn target_view(&self, target_id: &str) -> Result<Target> {
        let mut state = self.state.lock().await;
        self.ensure_targets(&mut state).await?;
        state
            .targets
            .as_ref()
            .unwrap()
            .get(target_id)
            .cloned()
            .ok_or_else(|| Error::UnknownTarget(target_id.to_string()))
    }

    // === Job bookkeeping ===

    pub async fn jobs_snapshot(&self) -> Vec<JobView> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobView> = state.jobs.values().map(job_view).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub async fn job_view(&self, id: u64) -> Result<JobView> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .map(job_view)
            .ok_or(Error::UnknownJob(id))
    }

    /// Worker pid of a running job, if it has been spawned already.
    pub async fn job_worker_pid(&self, id: u64) -> Option<u32> {
        let state = self.state.lock().await;
        state.jobs.get(&id).map(|j| j.pid).filter(|pid| *pid != 0)
    }

    /// Create a job and spawn its worker. Returns the channel on which the
    /// job answers, either at detach time or on exit.
    async fn start_job(
        &self,
        target_id: &str,
        kind: JobKind,
        version: Option<String>,
        offline: bool,
    ) -> Result<oneshot::Receiver<JobReply>> {
        let mut state = self.state.lock().await;
        self.ensure_targets(&mut state).await?;
        let target = state
            .targets
            .as_ref()
            .unwrap()
            .get(target_id)
            .cloned()
            .ok_or_else(|| Error::UnknownTarget(target_id.to_string()))?;

        if kind.is_mutating() && target.busy {
            return Err(Error::TargetBusy(target.id));
        }

        let id = state.last_job_id + 1;
        let object_path = job::object_path(id);
        let (reply_tx, reply_rx) = oneshot::channel();

        // Register before spawning so a same-pid notification cannot race
        // the registry.
        state.jobs.insert(
            id,
            JobEntry {
                id,
                kind,
                target_id: target.id.clone(),
                object_path,
                offline,
                version: version.clone(),
                progress: 0,
                status_errno: 0,
                n_cancelled: 0,
                pid: 0,
                detached: false,
                reply_tx: Some(reply_tx),
            },
        );
        state.last_job_id = id;

        let Some(manager) = self.weak.upgrade() else {
            state.jobs.remove(&id);
            return Err(Error::Internal("manager is shutting down".to_string()));
        };

        let spawned = match worker::spawn(&self.worker, &target, kind, version.as_deref(), offline)
        {
            Ok(spawned) => spawned,
            Err(e) => {
                state.jobs.remove(&id);
                return Err(e);
            }
        };

        info!(
            job = id,
            pid = spawned.pid,
            kind = kind.as_str(),
            target = %target.id,
            "started job"
        );

        if let Some(entry) = state.jobs.get_mut(&id) {
            entry.pid = spawned.pid;
        }
        if kind.is_mutating()
            && let Some(targets) = state.targets.as_mut()
            && let Some(t) = targets.get_mut(&target.id)
        {
            t.busy = true;
        }
        drop(state);

        let SpawnedWorker { mut child, stdout, .. } = spawned;
        tokio::spawn(async move {
            let status = child.wait().await;
            manager.finish_job(id, status, stdout).await;
        });

        Ok(reply_rx)
    }

    /// Sole job teardown point: translate the worker exit into a reply or a
    /// removal signal, release target exclusion, run the idle check.
    async fn finish_job(&self, id: u64, status: std::io::Result<ExitStatus>, stdout: File) {
        let mut state = self.state.lock().await;
        let Some(mut entry) = state.jobs.remove(&id) else {
            warn!(job = id, "exited worker had no job record, ignoring");
            return;
        };

        if entry.kind.is_mutating()
            && let Some(targets) = state.targets.as_mut()
            && let Some(t) = targets.get_mut(&entry.target_id)
        {
            t.busy = false;
        }

        let (raw_status, result) = match status {
            Err(e) => (-1, Err(Error::Io(e))),
            Ok(st) => match st.signal() {
                Some(sig) => (128 + sig, Err(Error::WorkerSignaled(sig))),
                None => {
                    let code = st.code().unwrap_or(-1);
                    if code != 0 {
                        let err = if entry.status_errno > 0 {
                            Error::WorkerErrno(entry.status_errno)
                        } else {
                            Error::WorkerFailed(code)
                        };
                        (code, Err(err))
                    } else {
                        (0, parse_worker_output(stdout))
                    }
                }
            },
        };

        let status_code = if entry.status_errno > 0 {
            -entry.status_errno
        } else {
            raw_status
        };

        match &result {
            Ok(_) => info!(job = id, "job finished"),
            Err(e) => info!(job = id, status = status_code, error = %e, "job finished"),
        }

        if entry.detached {
            let signal = JobSignal::Removed {
                id,
                object_path: entry.object_path.clone(),
                status: status_code,
            };
            if self.events.send(signal).is_err() {
                debug!(job = id, "no watcher for job removal signal");
            }
        } else if let Some(tx) = entry.reply_tx.take() {
            let _ = tx.send(JobReply::Finished(result));
        }

        if state.jobs.is_empty() {
            state.targets = None;
            debug!("cleared target cache");
        }
        drop(state);

        self.touch().await;
    }

    /// Route one notification datagram to the job owning the sender pid.
    pub async fn dispatch_notify(&self, pid: u32, text: &str) {
        let n = notify::parse(text);

        let mut state = self.state.lock().await;
        let Some(entry) = state.jobs.values_mut().find(|j| j.pid == pid) else {
            warn!(pid, "got notification datagram from unexpected peer, ignoring");
            return;
        };

        if let Some(version) = n.version {
            debug!(job = entry.id, version = %version, "got version from job");
            entry.version = Some(version);
        }

        if let Some(percent) = n.progress {
            entry.progress = percent;
            debug!(job = entry.id, percent, "got progress from job");
            let _ = self.events.send(JobSignal::Progress {
                id: entry.id,
                object_path: entry.object_path.clone(),
                percent,
            });
        }

        if let Some(errno) = n.errno {
            debug!(job = entry.id, errno, "got errno from job");
            entry.status_errno = errno;
        }

        // Handled last so same-datagram metadata is visible when the caller
        // is answered.
        if n.ready
            && entry.kind == JobKind::Update
            && !entry.detached
            && let Some(tx) = entry.reply_tx.take()
        {
            debug!(job = entry.id, "got READY=1 from job, detaching");
            entry.detached = true;
            let _ = tx.send(JobReply::Detached {
                version: entry.version.clone().unwrap_or_default(),
                id: entry.id,
                object_path: entry.object_path.clone(),
            });
        }
    }

    // === RMI operations ===

    pub async fn target_list(
        &self,
        target_id: &str,
        offline: bool,
    ) -> Result<Vec<String>> {
        let target = self.target_view(target_id).await?;
        self.policy
            .require(
                PolicyAction::Check,
                &[
                    ("class", target.class.as_str()),
                    ("name", &target.name),
                    ("offline", one_zero(offline)),
                ],
            )
            .await?;

        let rx = self.start_job(target_id, JobKind::List, None, offline).await?;
        job::list_versions_from(&finished(rx).await?)
    }

    pub async fn target_describe(
        &self,
        target_id: &str,
        version: &str,
        offline: bool,
    ) -> Result<String> {
        if version.is_empty() {
            return Err(Error::InvalidArgs("Version must be specified".to_string()));
        }

        let target = self.target_view(target_id).await?;
        self.policy
            .require(
                PolicyAction::Check,
                &[
                    ("class", target.class.as_str()),
                    ("name", &target.name),
                    ("version", version),
                    ("offline", one_zero(offline)),
                ],
            )
            .await?;

        let rx = self
            .start_job(target_id, JobKind::Describe, Some(version.to_string()), offline)
            .await?;
        job::describe_text(&finished(rx).await?)
    }

    pub async fn target_check_new(&self, target_id: &str) -> Result<String> {
        let target = self.target_view(target_id).await?;
        self.policy
            .require(
                PolicyAction::Check,
                &[
                    ("class", target.class.as_str()),
                    ("name", &target.name),
                    ("offline", "0"),
                ],
            )
            .await?;

        let rx = self
            .start_job(target_id, JobKind::CheckNew, None, false)
            .await?;
        job::check_new_from(&finished(rx).await?)
    }

    /// Update runs detached: the caller is answered as soon as the worker
    /// signals readiness, terminal status arrives later as a `Removed`
    /// signal.
    pub async fn target_update(
        &self,
        target_id: &str,
        version: &str,
    ) -> Result<(String, u64, String)> {
        let action = if version.is_empty() {
            PolicyAction::Update
        } else {
            PolicyAction::UpdateToVersion
        };

        let target = self.target_view(target_id).await?;
        self.policy
            .require(
                action,
                &[
                    ("class", target.class.as_str()),
                    ("name", &target.name),
                    ("version", version),
                ],
            )
            .await?;

        let version = (!version.is_empty()).then(|| version.to_string());
        let rx = self
            .start_job(target_id, JobKind::Update, version, false)
            .await?;

        match rx.await {
            Ok(JobReply::Detached {
                version,
                id,
                object_path,
            }) => Ok((version, id, object_path)),
            // The worker exited successfully before doing any work: nothing
            // to update.
            Ok(JobReply::Finished(Ok(_))) => Err(Error::NoUpdateCandidate),
            Ok(JobReply::Finished(Err(e))) => Err(e),
            Err(_) => Err(Error::Internal("job reply channel closed".to_string())),
        }
    }

    pub async fn target_vacuum(&self, target_id: &str) -> Result<u32> {
        let target = self.target_view(target_id).await?;
        self.policy
            .require(
                PolicyAction::Vacuum,
                &[("class", target.class.as_str()), ("name", &target.name)],
            )
            .await?;

        let rx = self
            .start_job(target_id, JobKind::Vacuum, None, false)
            .await?;
        Ok(job::vacuum_count_from(&finished(rx).await?))
    }

    pub async fn target_get_version(&self, target_id: &str) -> Result<String> {
        let target = self.target_view(target_id).await?;
        let json =
            worker::run_simple(&self.worker, Some(&target), &["--offline", "list"], "list").await?;

        match json.get("current") {
            None => Err(Error::Protocol {
                verb: "list",
                message: "missing key 'current'".to_string(),
            }),
            Some(Value::Null) => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(Error::Protocol {
                verb: "list",
                message: "expected string value for key 'current'".to_string(),
            }),
        }
    }

    pub async fn target_get_appstream(&self, target_id: &str) -> Result<Vec<String>> {
        let target = self.target_view(target_id).await?;
        target_appstream(&self.worker, &target).await
    }

    /// AppStream URLs across all targets, deduplicated.
    pub async fn list_appstream(&self) -> Result<Vec<String>> {
        let targets = self.targets_snapshot().await?;
        let mut urls: Vec<String> = Vec::new();
        for target in &targets {
            for url in target_appstream(&self.worker, target).await? {
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
        Ok(urls)
    }

    /// Cancel a running job: SIGTERM for the first three attempts, SIGKILL
    /// from the fourth on. The job itself is only removed by the exit
    /// handler.
    pub async fn cancel_job(&self, id: u64) -> Result<()> {
        let (kind, versioned) = {
            let state = self.state.lock().await;
            let entry = state.jobs.get(&id).ok_or(Error::UnknownJob(id))?;
            (
                entry.kind,
                entry.version.as_deref().is_some_and(|v| !v.is_empty()),
            )
        };

        let action = match kind {
            JobKind::List | JobKind::Describe | JobKind::CheckNew => PolicyAction::Check,
            JobKind::Update if versioned => PolicyAction::UpdateToVersion,
            JobKind::Update => PolicyAction::Update,
            JobKind::Vacuum => PolicyAction::Vacuum,
        };
        self.policy.require(action, &[]).await?;

        let mut state = self.state.lock().await;
        let entry = state.jobs.get_mut(&id).ok_or(Error::UnknownJob(id))?;
        let sig = if entry.n_cancelled < 3 {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };
        signal::kill(Pid::from_raw(entry.pid as i32), sig).map_err(|e| Error::Io(e.into()))?;
        entry.n_cancelled += 1;

        info!(job = id, signal = %sig, attempt = entry.n_cancelled, "cancelling job");
        Ok(())
    }
}

fn job_view(entry: &JobEntry) -> JobView {
    JobView {
        id: entry.id,
        kind: entry.kind,
        offline: entry.offline,
        progress: entry.progress,
        object_path: entry.object_path.clone(),
    }
}

/// Await a job's exit reply. Detach replies cannot happen here: only update
/// jobs detach, and they use their own receive path.
async fn finished(rx: oneshot::Receiver<JobReply>) -> Result<Value> {
    match rx.await {
        Ok(JobReply::Finished(result)) => result,
        Ok(JobReply::Detached { .. }) => {
            Err(Error::Internal("unexpected detach reply".to_string()))
        }
        Err(_) => Err(Error::Internal("job reply channel closed".to_string())),
    }
}

/// Re-read the worker's captured stdout and parse the final JSON document.
/// No output at all is tolerated and treated as an empty document.
fn parse_worker_output(mut stdout: File) -> Result<Value> {
    let mut text = String::new();
    stdout.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
    stdout.read_to_string(&mut text).map_err(Error::Io)?;

    if text.trim().is_empty() {
        warn!("no output from worker, ignoring");
        return Ok(Value::Object(serde_json::Map::new()));
    }

    serde_json::from_str(&text).map_err(Error::Json)
}

async fn target_appstream(cfg: &WorkerConfig, target: &Target) -> Result<Vec<String>> {
    let json = worker::run_simple(cfg, Some(target), &["--offline", "list"], "list").await?;
    let urls = json.get("appstream_urls").ok_or_else(|| Error::Protocol {
        verb: "list",
        message: "missing key 'appstream_urls'".to_string(),
    })?;
    job::string_array(urls, "list", "appstream_urls")
}
