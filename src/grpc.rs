//! gRPC surface of the daemon.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::warn;

use crate::error::Error;
use crate::manager::{JobSignal, Manager};
use crate::proto::update_service_server::UpdateService;
use crate::proto::*;

/// The only flag bit defined for ListVersions/Describe: run the worker
/// offline.
pub const FLAG_OFFLINE: u64 = 1 << 0;
const FLAGS_ALL: u64 = FLAG_OFFLINE;

pub struct UpdateServiceImpl {
    manager: Arc<Manager>,
}

impl UpdateServiceImpl {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

fn status_from(e: Error) -> Status {
    match e {
        Error::InvalidArgs(_) | Error::Protocol { .. } => Status::invalid_argument(e.to_string()),
        Error::AccessDenied(_) | Error::InteractionRequired => {
            Status::permission_denied(e.to_string())
        }
        Error::TargetBusy(_) | Error::NoUpdateCandidate => {
            Status::failed_precondition(e.to_string())
        }
        Error::UnknownTarget(_) | Error::UnknownJob(_) => Status::not_found(e.to_string()),
        _ => Status::internal(e.to_string()),
    }
}

/// Validate the flags word and extract the offline bit.
fn parse_flags(flags: u64) -> Result<bool, Status> {
    if flags & !FLAGS_ALL != 0 {
        return Err(Status::invalid_argument("Invalid flags specified"));
    }
    Ok(flags & FLAG_OFFLINE != 0)
}

#[tonic::async_trait]
impl UpdateService for UpdateServiceImpl {
    // Manager

    async fn list_targets(
        &self,
        _request: Request<ListTargetsRequest>,
    ) -> Result<Response<ListTargetsResponse>, Status> {
        self.manager.touch().await;
        let targets = self.manager.targets_snapshot().await.map_err(status_from)?;

        Ok(Response::new(ListTargetsResponse {
            targets: targets
                .iter()
                .map(|t| TargetSummary {
                    class: t.class.as_str().to_string(),
                    name: t.name.clone(),
                    object_path: t.object_path(),
                })
                .collect(),
        }))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        self.manager.touch().await;
        let jobs = self.manager.jobs_snapshot().await;

        Ok(Response::new(ListJobsResponse {
            jobs: jobs
                .iter()
                .map(|j| JobSummary {
                    id: j.id,
                    kind: j.kind.as_str().to_string(),
                    progress: j.progress,
                    object_path: j.object_path.clone(),
                })
                .collect(),
        }))
    }

    async fn list_app_stream(
        &self,
        _request: Request<ListAppStreamRequest>,
    ) -> Result<Response<ListAppStreamResponse>, Status> {
        self.manager.touch().await;
        let urls = self.manager.list_appstream().await.map_err(status_from)?;
        Ok(Response::new(ListAppStreamResponse { urls }))
    }

    type WatchJobsStream = ReceiverStream<Result<JobEvent, Status>>;

    async fn watch_jobs(
        &self,
        _request: Request<WatchJobsRequest>,
    ) -> Result<Response<Self::WatchJobsStream>, Status> {
        let mut events = self.manager.subscribe();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(signal) => {
                        let event = match signal {
                            JobSignal::Progress {
                                id,
                                object_path,
                                percent,
                            } => job_event::Event::Progress(JobProgress {
                                id,
                                object_path,
                                percent,
                            }),
                            JobSignal::Removed {
                                id,
                                object_path,
                                status,
                            } => job_event::Event::Removed(JobRemoved {
                                id,
                                object_path,
                                status,
                            }),
                        };
                        if tx.send(Ok(JobEvent { event: Some(event) })).await.is_err() {
                            break; // watcher went away
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "job watcher lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    // Targets

    async fn get_target(
        &self,
        request: Request<GetTargetRequest>,
    ) -> Result<Response<TargetInfo>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();
        let target = self
            .manager
            .target_view(&req.target_id)
            .await
            .map_err(status_from)?;

        Ok(Response::new(TargetInfo {
            id: target.id.clone(),
            class: target.class.as_str().to_string(),
            name: target.name.clone(),
            path: target.path.clone(),
            object_path: target.object_path(),
            busy: target.busy,
        }))
    }

    async fn list_versions(
        &self,
        request: Request<ListVersionsRequest>,
    ) -> Result<Response<ListVersionsResponse>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();
        let offline = parse_flags(req.flags)?;

        let versions = self
            .manager
            .target_list(&req.target_id, offline)
            .await
            .map_err(status_from)?;
        Ok(Response::new(ListVersionsResponse { versions }))
    }

    async fn describe(
        &self,
        request: Request<DescribeRequest>,
    ) -> Result<Response<DescribeResponse>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();
        let offline = parse_flags(req.flags)?;

        let json = self
            .manager
            .target_describe(&req.target_id, &req.version, offline)
            .await
            .map_err(status_from)?;
        Ok(Response::new(DescribeResponse { json }))
    }

    async fn check_new(
        &self,
        request: Request<CheckNewRequest>,
    ) -> Result<Response<CheckNewResponse>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();

        let new_version = self
            .manager
            .target_check_new(&req.target_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(CheckNewResponse { new_version }))
    }

    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> Result<Response<UpdateResponse>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();
        if req.flags != 0 {
            return Err(Status::invalid_argument("Flags must be 0"));
        }

        let (new_version, job_id, job_path) = self
            .manager
            .target_update(&req.target_id, &req.new_version)
            .await
            .map_err(status_from)?;
        Ok(Response::new(UpdateResponse {
            new_version,
            job_id,
            job_path,
        }))
    }

    async fn vacuum(
        &self,
        request: Request<VacuumRequest>,
    ) -> Result<Response<VacuumResponse>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();

        let removed = self
            .manager
            .target_vacuum(&req.target_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(VacuumResponse { removed }))
    }

    async fn get_app_stream(
        &self,
        request: Request<GetAppStreamRequest>,
    ) -> Result<Response<GetAppStreamResponse>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();

        let urls = self
            .manager
            .target_get_appstream(&req.target_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(GetAppStreamResponse { urls }))
    }

    async fn get_version(
        &self,
        request: Request<GetVersionRequest>,
    ) -> Result<Response<GetVersionResponse>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();

        let version = self
            .manager
            .target_get_version(&req.target_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(GetVersionResponse { version }))
    }

    // Jobs

    async fn get_job(&self, request: Request<GetJobRequest>) -> Result<Response<JobInfo>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();
        let job = self
            .manager
            .job_view(req.job_id)
            .await
            .map_err(status_from)?;

        Ok(Response::new(JobInfo {
            id: job.id,
            kind: job.kind.as_str().to_string(),
            offline: job.offline,
            progress: job.progress,
            object_path: job.object_path,
        }))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        self.manager.touch().await;
        let req = request.into_inner();

        self.manager
            .cancel_job(req.job_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(CancelJobResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        assert!(!parse_flags(0).unwrap());
        assert!(parse_flags(FLAG_OFFLINE).unwrap());
        assert!(parse_flags(1 << 1).is_err());
        assert!(parse_flags(u64::MAX).is_err());
    }

    #[test]
    fn test_status_mapping() {
        use tonic::Code;

        let cases = [
            (Error::InvalidArgs("x".into()), Code::InvalidArgument),
            (Error::AccessDenied("a".into()), Code::PermissionDenied),
            (Error::InteractionRequired, Code::PermissionDenied),
            (Error::TargetBusy("host".into()), Code::FailedPrecondition),
            (Error::NoUpdateCandidate, Code::FailedPrecondition),
            (Error::UnknownTarget("x".into()), Code::NotFound),
            (Error::UnknownJob(7), Code::NotFound),
            (Error::WorkerFailed(3), Code::Internal),
            (Error::WorkerSignaled(9), Code::Internal),
        ];
        for (error, code) in cases {
            assert_eq!(status_from(error).code(), code);
        }
    }
}
