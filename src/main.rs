use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sysupdated::grpc::UpdateServiceImpl;
use sysupdated::manager::Manager;
use sysupdated::notify::NotifyListener;
use sysupdated::policy::PolicyClient;
use sysupdated::proto::update_service_server::UpdateServiceServer;
use sysupdated::worker::WorkerConfig;

#[derive(Parser)]
#[command(name = "sysupdated")]
#[command(about = "System update coordination daemon")]
struct Args {
    /// gRPC listen address
    #[arg(short, long, default_value = "[::1]:50061")]
    listen: String,

    /// Runtime directory holding the worker notify socket
    #[arg(long, default_value = "/run/sysupdated")]
    runtime_dir: PathBuf,

    /// Update worker binary invoked for every operation
    #[arg(long, default_value = "/usr/lib/sysupdate/sysupdate")]
    worker: PathBuf,

    /// Root below which image directories are discovered
    #[arg(long, default_value = "/")]
    image_root: PathBuf,

    /// Policy service socket; every operation is allowed when unset
    #[arg(long)]
    policy_socket: Option<PathBuf>,

    /// Exit after this many seconds of idleness (0 disables)
    #[arg(long, default_value_t = 30)]
    exit_idle_time: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sysupdated=info".parse()?))
        .init();

    let args = Args::parse();

    tokio::fs::create_dir_all(&args.runtime_dir).await?;

    let notify_path = args.runtime_dir.join("notify");
    let listener = NotifyListener::bind(&notify_path)?;
    info!(path = %notify_path.display(), "notify socket bound");

    let worker = WorkerConfig::from_env(args.worker, notify_path);
    let policy = PolicyClient::new(args.policy_socket);
    let manager = Manager::new(worker, policy, args.image_root);

    tokio::spawn(listener.run(Arc::clone(&manager)));

    let addr = args.listen.parse()?;
    info!(addr = %addr, "starting gRPC server");

    let service = UpdateServiceImpl::new(Arc::clone(&manager));
    let shutdown = {
        let manager = Arc::clone(&manager);
        let idle = Duration::from_secs(args.exit_idle_time);
        async move {
            tokio::select! {
                _ = manager.wait_idle(idle) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                }
            }
        }
    };

    Server::builder()
        .add_service(UpdateServiceServer::new(service))
        .serve_with_shutdown(addr, shutdown)
        .await?;

    Ok(())
}
