//! Topology / `UPDATE_NEXT` fan-out integration tests (`spec.md` §8 scenario
//! 2): a Subcoordinator registering peers tells each of the (up to three)
//! most recently registered prior peers about the newcomer, and a peer's
//! view of its own fallback chain accumulates append-only.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use strandcast::config::{PeerConfig, SubcoordinatorConfig};
use strandcast::peer::Peer;
use strandcast::renderer::NullRenderer;
use strandcast::subcoordinator::Subcoordinator;

async fn tcp_send(addr: SocketAddr, payload: &Value) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(&serde_json::to_vec(payload).unwrap())
        .await
        .expect("write");
    stream.shutdown().await.expect("shutdown");
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
}

/// A coordinator stand-in that accepts and acknowledges every connection so
/// the Subcoordinator's startup registration round trip succeeds.
async fn spawn_fake_coordinator(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf).await;
                let _ = stream.write_all(b"{}").await;
            });
        }
    });
}

#[tokio::test]
async fn update_next_fans_out_to_up_to_three_recent_prior_peers() {
    spawn_fake_coordinator(19_500).await;

    let subco_config = SubcoordinatorConfig {
        port: 19_501,
        bind: "127.0.0.1".parse().unwrap(),
        coordinator_addr: "127.0.0.1:19500".into(),
        video_dirs: Vec::new(),
        synthetic_videos: None,
        synthetic_frame_count: 0,
        inter_chunk_delay_micros: 10,
        jpeg_quality: 40,
        output_dir: std::env::temp_dir().join("strandcast-test-strand"),
    };
    let subco = Subcoordinator::new(subco_config).await.unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn({
        let subco = subco.clone();
        let cancel = cancel.clone();
        async move {
            let _ = subco.run(cancel).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let subco_addr: SocketAddr = "127.0.0.1:19501".parse().unwrap();

    let mut peers = Vec::new();
    for i in 0..5u16 {
        let data_port = 19_600 + i;
        let config = PeerConfig {
            name: format!("peer{i}"),
            data_port,
            bind: "127.0.0.1".parse().unwrap(),
            coordinator_addr: "127.0.0.1:19500".into(),
            output_dir: std::env::temp_dir().join(format!("strandcast-test-strand-peer{i}")),
            playback_fps: 30.0,
        };
        let peer = Peer::new(config).await.unwrap();
        tokio::spawn({
            let peer = peer.clone();
            let cancel = cancel.clone();
            async move {
                let _ = peer.run(Box::new(NullRenderer), cancel).await;
            }
        });
        peers.push(peer);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let register = json!({
            "type": "register",
            "name": format!("peer{i}"),
            "port": data_port,
            "ctrl_port": data_port + 10_000,
            "ip": "127.0.0.1",
        });
        tcp_send(subco_addr, &register).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    tokio::time::sleep(Duration::from_millis(150)).await;

    let names = |records: Vec<strandcast::wire::PeerRecord>| {
        records.into_iter().map(|p| p.name).collect::<Vec<_>>()
    };

    // peer0 existed before peers 1-3 (within the cap of 3) but is outside
    // the window by the time peer4 registers, so its fallback list stops
    // growing at three entries.
    assert_eq!(names(peers[0].next_peers_snapshot().await), vec!["peer1", "peer2", "peer3"]);
    assert_eq!(names(peers[1].next_peers_snapshot().await), vec!["peer2", "peer3", "peer4"]);
    assert_eq!(names(peers[2].next_peers_snapshot().await), vec!["peer3", "peer4"]);
    assert_eq!(names(peers[3].next_peers_snapshot().await), vec!["peer4"]);
    assert!(peers[4].next_peers_snapshot().await.is_empty());

    let snapshot = subco.peers_snapshot().await;
    assert_eq!(snapshot.len(), 5);
}
