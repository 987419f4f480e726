use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use strandcast::config::SubcoordinatorConfig;
use strandcast::subcoordinator::{operator, Subcoordinator};

#[tokio::main]
async fn main() -> ExitCode {
    let config = SubcoordinatorConfig::parse();
    let _log_guard = strandcast::init_logging_with_file(&config.output_dir, &format!("subcoordinator_{}", config.port));

    let subco = match Subcoordinator::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "failed to start subcoordinator");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_cancel.cancel();
    });

    let operator_subco = subco.clone();
    let operator_cancel = cancel.clone();
    tokio::spawn(async move { operator::run(operator_subco, operator_cancel).await });

    match subco.run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "subcoordinator exited with error");
            ExitCode::FAILURE
        }
    }
}
