//! Integration tests for the job lifecycle engine.
//!
//! Every test drives a manager against a stub worker script, so no real
//! update work happens. Notify-channel input is injected through the
//! manager's dispatch entry point, exactly as the socket listener would
//! deliver it.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use sysupdated::error::Error;
use sysupdated::manager::{JobSignal, Manager};
use sysupdated::policy::PolicyClient;
use sysupdated::worker::WorkerConfig;

const STUB_TEMPLATE: &str = r#"#!/bin/sh
verb=""
for arg in "$@"; do
  case "$arg" in
    --*) ;;
    *) if [ -z "$verb" ]; then verb="$arg"; fi ;;
  esac
done
case "$verb" in
  components) printf '%s' 'COMPONENTS_BODY' ;;
  list) printf '%s' '{"all":["1.0","2.0"],"current":"1.0","appstream_urls":["https://example.com/catalog.xml"]}' ;;
  check-new) printf '%s' '{"available":null}' ;;
  vacuum) printf '%s' '{"removed":3}' ;;
  update) UPDATE_BODY ;;
esac
"#;

const DEFAULT_COMPONENTS: &str = r#"{"default":true,"components":["kernel"]}"#;

struct Harness {
    _dir: tempfile::TempDir,
    stub: PathBuf,
    manager: Arc<Manager>,
}

impl Harness {
    fn new(update_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("sysupdate-stub");
        write_stub(&stub, update_body, DEFAULT_COMPONENTS);

        let worker = WorkerConfig {
            binary: stub.clone(),
            notify_socket: dir.path().join("notify"),
            no_verify: false,
        };
        let manager = Manager::new(
            worker,
            PolicyClient::allow_all(),
            dir.path().to_path_buf(),
        );

        Self {
            _dir: dir,
            stub,
            manager,
        }
    }
}

fn write_stub(path: &Path, update_body: &str, components_body: &str) {
    let script = STUB_TEMPLATE
        .replace("UPDATE_BODY", update_body)
        .replace("COMPONENTS_BODY", components_body);
    std::fs::write(path, script).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

/// Wait until a job with id >= `min_id` shows up in the registry with a
/// spawned worker.
async fn wait_for_worker(manager: &Arc<Manager>, min_id: u64) -> (u64, u32) {
    for _ in 0..250 {
        let jobs = manager.jobs_snapshot().await;
        if let Some(job) = jobs.iter().find(|j| j.id >= min_id)
            && let Some(pid) = manager.job_worker_pid(job.id).await
        {
            return (job.id, pid);
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("no job with a spawned worker appeared");
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<JobSignal>,
) -> JobSignal {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for job signal")
        .expect("event stream closed")
}

#[tokio::test]
async fn test_discovery_builds_host_and_component_targets() {
    let h = Harness::new("printf '%s' '{}'");

    let targets = h.manager.targets_snapshot().await.unwrap();
    let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["component:kernel", "host"]);

    let host = h.manager.target_view("host").await.unwrap();
    assert_eq!(host.path, "sysupdate.d");
    assert_eq!(host.object_path(), "/sysupdate1/target/host");

    let component = h.manager.target_view("component:kernel").await.unwrap();
    assert_eq!(component.path, "sysupdate.kernel.d");
}

#[tokio::test]
async fn test_list_versions() {
    let h = Harness::new("printf '%s' '{}'");

    let versions = h.manager.target_list("host", false).await.unwrap();
    assert_eq!(versions, vec!["1.0", "2.0"]);

    // Offline listing takes the same path.
    let versions = h
        .manager
        .target_list("component:kernel", true)
        .await
        .unwrap();
    assert_eq!(versions, vec!["1.0", "2.0"]);
}

#[tokio::test]
async fn test_check_new_without_candidate() {
    let h = Harness::new("printf '%s' '{}'");

    let new_version = h.manager.target_check_new("host").await.unwrap();
    assert_eq!(new_version, "");
}

#[tokio::test]
async fn test_describe_returns_document() {
    let h = Harness::new("printf '%s' '{}'");

    let json = h.manager.target_describe("host", "2.0", false).await.unwrap();
    let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(doc["current"], "1.0");

    let err = h.manager.target_describe("host", "", false).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgs(_)));
}

#[tokio::test]
async fn test_vacuum_counts_removed_instances() {
    let h = Harness::new("printf '%s' '{}'");

    let removed = h.manager.target_vacuum("host").await.unwrap();
    assert_eq!(removed, 3);
}

#[tokio::test]
async fn test_unknown_target() {
    let h = Harness::new("printf '%s' '{}'");

    let err = h.manager.target_list("machine:nope", false).await.unwrap_err();
    assert!(matches!(err, Error::UnknownTarget(_)));
}

#[tokio::test]
async fn test_update_detach_flow() {
    let h = Harness::new("sleep 2; printf '%s' '{}'");
    let mut events = h.manager.subscribe();

    let manager = Arc::clone(&h.manager);
    let update = tokio::spawn(async move { manager.target_update("host", "").await });

    let (job_id, pid) = wait_for_worker(&h.manager, 1).await;
    h.manager
        .dispatch_notify(pid, "X_SYSUPDATE_VERSION=2.0\nX_SYSUPDATE_PROGRESS=10\nREADY=1\n")
        .await;

    // The caller is answered before the worker exits.
    let (version, id, path) = update.await.unwrap().unwrap();
    assert_eq!(version, "2.0");
    assert_eq!(id, job_id);
    assert_eq!(path, format!("/sysupdate1/job/_{job_id}"));

    // Progress change first, removal with the exit status after.
    match next_event(&mut events).await {
        JobSignal::Progress { id, percent, .. } => {
            assert_eq!(id, job_id);
            assert_eq!(percent, 10);
        }
        other => panic!("expected progress signal, got {other:?}"),
    }
    match next_event(&mut events).await {
        JobSignal::Removed { id, status, .. } => {
            assert_eq!(id, job_id);
            assert_eq!(status, 0);
        }
        other => panic!("expected removal signal, got {other:?}"),
    }

    assert!(h.manager.jobs_snapshot().await.is_empty());
}

#[tokio::test]
async fn test_update_early_finish() {
    let h = Harness::new("printf '%s' '{}'");
    let mut events = h.manager.subscribe();

    let err = h.manager.target_update("host", "9.9").await.unwrap_err();
    assert!(matches!(err, Error::NoUpdateCandidate));

    // Jobs that never detached must not emit a removal signal.
    sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_update_failure_reports_notify_errno() {
    let h = Harness::new("sleep 2; exit 7");

    let manager = Arc::clone(&h.manager);
    let update = tokio::spawn(async move { manager.target_update("host", "").await });

    let (_, pid) = wait_for_worker(&h.manager, 1).await;
    h.manager.dispatch_notify(pid, "ERRNO=5\n").await;

    let err = update.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::WorkerErrno(5)));
}

#[tokio::test]
async fn test_update_failure_without_errno() {
    let h = Harness::new("exit 7");

    let err = h.manager.target_update("host", "").await.unwrap_err();
    assert!(matches!(err, Error::WorkerFailed(7)));
}

#[tokio::test]
async fn test_busy_rejection() {
    let h = Harness::new("sleep 2; printf '%s' '{}'");
    let mut events = h.manager.subscribe();

    let manager = Arc::clone(&h.manager);
    let first = tokio::spawn(async move { manager.target_update("host", "").await });

    let (job_id, pid) = wait_for_worker(&h.manager, 1).await;
    h.manager.dispatch_notify(pid, "READY=1\n").await;
    first.await.unwrap().unwrap();

    // The target stays exclusive until the detached worker exits.
    let err = h.manager.target_update("host", "").await.unwrap_err();
    assert!(matches!(err, Error::TargetBusy(_)));

    // Non-mutating jobs are not excluded.
    let versions = h.manager.target_list("host", false).await.unwrap();
    assert_eq!(versions, vec!["1.0", "2.0"]);

    loop {
        if let JobSignal::Removed { id, .. } = next_event(&mut events).await
            && id == job_id
        {
            break;
        }
    }
}

#[tokio::test]
async fn test_cancel_escalates_to_sigkill() {
    let h = Harness::new("trap '' TERM; sleep 10; printf '%s' '{}'");
    let mut events = h.manager.subscribe();

    let manager = Arc::clone(&h.manager);
    let update = tokio::spawn(async move { manager.target_update("host", "").await });

    let (job_id, pid) = wait_for_worker(&h.manager, 1).await;
    h.manager.dispatch_notify(pid, "READY=1\n").await;
    update.await.unwrap().unwrap();

    // Three SIGTERMs the worker ignores.
    for _ in 0..3 {
        h.manager.cancel_job(job_id).await.unwrap();
    }
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.manager.jobs_snapshot().await.len(), 1);

    // The fourth attempt escalates to SIGKILL.
    h.manager.cancel_job(job_id).await.unwrap();

    match next_event(&mut events).await {
        JobSignal::Removed { id, status, .. } => {
            assert_eq!(id, job_id);
            assert_eq!(status, 128 + 9);
        }
        other => panic!("expected removal signal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_job_ids_increase_across_jobs() {
    let h = Harness::new("sleep 2; printf '%s' '{}'");

    let manager = Arc::clone(&h.manager);
    let update = tokio::spawn(async move { manager.target_update("host", "").await });
    let (first_id, pid) = wait_for_worker(&h.manager, 1).await;
    h.manager.dispatch_notify(pid, "READY=1\n").await;
    update.await.unwrap().unwrap();

    // A list job consumes the next id even though it never detaches.
    h.manager.target_list("host", false).await.unwrap();

    let manager = Arc::clone(&h.manager);
    let update = tokio::spawn(async move { manager.target_update("component:kernel", "").await });
    let (third_id, pid) = wait_for_worker(&h.manager, first_id + 2).await;
    h.manager.dispatch_notify(pid, "READY=1\n").await;
    update.await.unwrap().unwrap();

    assert_eq!(third_id, first_id + 2);
}

#[tokio::test]
async fn test_registry_flush_when_jobs_drain() {
    let h = Harness::new("printf '%s' '{}'");

    let targets = h.manager.targets_snapshot().await.unwrap();
    assert_eq!(targets.len(), 2);

    // Run one job to completion; the registry flushes once the job map is
    // empty, so the next enumeration sees the changed component listing.
    h.manager.target_list("host", false).await.unwrap();
    write_stub(
        &h.stub,
        "printf '%s' '{}'",
        r#"{"default":true,"components":["kernel","firmware"]}"#,
    );

    let targets = h.manager.targets_snapshot().await.unwrap();
    let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["component:firmware", "component:kernel", "host"]
    );
}

#[tokio::test]
async fn test_get_version_and_appstream() {
    let h = Harness::new("printf '%s' '{}'");

    let version = h.manager.target_get_version("host").await.unwrap();
    assert_eq!(version, "1.0");

    let urls = h.manager.target_get_appstream("host").await.unwrap();
    assert_eq!(urls, vec!["https://example.com/catalog.xml"]);

    // The manager-level aggregate deduplicates across targets.
    let urls = h.manager.list_appstream().await.unwrap();
    assert_eq!(urls, vec!["https://example.com/catalog.xml"]);
}
