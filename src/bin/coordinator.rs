use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use strandcast::config::CoordinatorConfig;
use strandcast::coordinator::Coordinator;

#[tokio::main]
async fn main() -> ExitCode {
    strandcast::init_logging();
    let config = CoordinatorConfig::parse();

    let coordinator = Coordinator::new(config.batch_size);
    let cancel = CancellationToken::new();

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_cancel.cancel();
    });

    match coordinator.run(config.bind, config.port, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "coordinator exited with error");
            ExitCode::FAILURE
        }
    }
}
