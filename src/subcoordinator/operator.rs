//! Interactive operator CLI: `drop <peer>`, `switch <peer> <new_coord_port>`,
//! `list`, `quit` (`spec.md` §6). The command *parsing and effect* are in
//! scope; a richer TUI is the external collaborator `spec.md` calls out.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Subcoordinator;

pub async fn run(subco: Arc<Subcoordinator>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        let Ok(Some(line)) = line else {
            return;
        };
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("drop") => {
                let Some(name) = parts.next() else {
                    println!("usage: drop <peer>");
                    continue;
                };
                match subco.drop_peer(name).await {
                    Ok(_) => info!(peer = name, "peer dropped"),
                    Err(e) => warn!(%e, peer = name, "drop failed"),
                }
            }
            Some("switch") => {
                let (Some(name), Some(new_port)) = (parts.next(), parts.next()) else {
                    println!("usage: switch <peer> <new_coord_port>");
                    continue;
                };
                let Ok(new_port) = new_port.parse::<u16>() else {
                    println!("invalid port: {new_port}");
                    continue;
                };
                match subco.switch_peer(name, new_port).await {
                    Ok(()) => info!(peer = name, new_port, "peer switched to new subcoordinator"),
                    Err(e) => warn!(%e, peer = name, "switch failed"),
                }
            }
            Some("list") => {
                for p in subco.peers_snapshot().await {
                    println!("{} {}:{}", p.name, p.ip, p.data_port);
                }
            }
            Some("quit") => {
                cancel.cancel();
                return;
            }
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }
}
