use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use strandcast::config::PeerConfig;
use strandcast::peer::Peer;
use strandcast::renderer::ConsoleRenderer;

#[tokio::main]
async fn main() -> ExitCode {
    let config = PeerConfig::parse();
    let _log_guard = strandcast::init_logging_with_file(&config.output_dir, &format!("peer_{}", config.name));

    let coordinator_addr = match config.coordinator_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(%e, "bad coordinator address");
            return ExitCode::FAILURE;
        }
    };

    let peer = match Peer::new(config).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, "failed to bind peer sockets");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = peer.register_with_coordinator(coordinator_addr).await {
        error!(%e, "failed to register with coordinator");
        return ExitCode::FAILURE;
    }

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_cancel.cancel();
    });

    match peer.run(Box::new(ConsoleRenderer), cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "peer exited with error");
            ExitCode::FAILURE
        }
    }
}
