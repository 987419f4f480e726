//! End-to-end chunking/reassembly/playback integration tests (`spec.md` §8
//! scenarios 3, 5, 6): a Subcoordinator streaming synthetic frames through a
//! real UDP/TCP strand, checking that a peer reassembles every frame, that a
//! peer which joins mid-video closes its gap via `requestMissingFrames`
//! replay, and that two videos flush to `all_frames` in strand order.

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

fn register_payload(name: &str, data_port: u16) -> Value {
    json!({
        "type": "register",
        "name": name,
        "port": data_port,
        "ctrl_port": data_port + 10_000,
        "ip": "127.0.0.1",
    })
}

async fn wait_until<F>(mut cond: F, timeout: Duration) -> bool
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn peer_config(name: &str, data_port: u16, coordinator_port: u16) -> PeerConfig {
    PeerConfig {
        name: name.to_string(),
        data_port,
        bind: "127.0.0.1".parse().unwrap(),
        coordinator_addr: format!("127.0.0.1:{coordinator_port}"),
        output_dir: std::env::temp_dir().join(format!("strandcast-test-streaming-{name}")),
        playback_fps: 1000.0,
    }
}

#[tokio::test]
async fn single_peer_reassembles_every_frame_of_two_videos_in_order() {
    spawn_fake_coordinator(19_900).await;

    let subco_config = SubcoordinatorConfig {
        port: 19_901,
        bind: "127.0.0.1".parse().unwrap(),
        coordinator_addr: "127.0.0.1:19900".into(),
        video_dirs: Vec::new(),
        synthetic_videos: Some(2),
        synthetic_frame_count: 4,
        inter_chunk_delay_micros: 10,
        jpeg_quality: 20,
        output_dir: std::env::temp_dir().join("strandcast-test-streaming-subco-a"),
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

    let peer = Peer::new(peer_config("solo", 19_950, 19_900)).await.unwrap();
    tokio::spawn({
        let peer = peer.clone();
        let cancel = cancel.clone();
        async move {
            let _ = peer.run(Box::new(NullRenderer), cancel).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tcp_send(
        "127.0.0.1:19901".parse().unwrap(),
        &register_payload("solo", 19_950),
    )
    .await;

    let done = wait_until(
        || {
            let peer = peer.clone();
            Box::pin(async move { peer.all_frames_len().await == 8 })
        },
        Duration::from_secs(10),
    )
    .await;

    assert!(done, "expected both 4-frame videos to flush into all_frames");
    assert!(peer.is_video_complete(0).await);
    assert!(peer.is_video_complete(1).await);
}

#[tokio::test]
async fn peer_joining_mid_video_closes_its_gap_via_replay() {
    spawn_fake_coordinator(19_910).await;

    let subco_config = SubcoordinatorConfig {
        port: 19_911,
        bind: "127.0.0.1".parse().unwrap(),
        coordinator_addr: "127.0.0.1:19910".into(),
        video_dirs: Vec::new(),
        synthetic_videos: Some(1),
        synthetic_frame_count: 20,
        inter_chunk_delay_micros: 2_000,
        jpeg_quality: 20,
        output_dir: std::env::temp_dir().join("strandcast-test-streaming-subco-b"),
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

    let head = Peer::new(peer_config("head", 19_960, 19_910)).await.unwrap();
    tokio::spawn({
        let head = head.clone();
        let cancel = cancel.clone();
        async move {
            let _ = head.run(Box::new(NullRenderer), cancel).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tcp_send(
        "127.0.0.1:19911".parse().unwrap(),
        &register_payload("head", 19_960),
    )
    .await;

    // Let the stream get partway through the 20-frame video before a second
    // peer joins the strand and starts receiving forwarded chunks.
    tokio::time::sleep(Duration::from_millis(60)).await;

    let tail = Peer::new(peer_config("tail", 19_961, 19_910)).await.unwrap();
    tokio::spawn({
        let tail = tail.clone();
        let cancel = cancel.clone();
        async move {
            let _ = tail.run(Box::new(NullRenderer), cancel).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tcp_send(
        "127.0.0.1:19911".parse().unwrap(),
        &register_payload("tail", 19_961),
    )
    .await;

    let done = wait_until(
        || {
            let tail = tail.clone();
            Box::pin(async move { tail.is_video_complete(0).await })
        },
        Duration::from_secs(10),
    )
    .await;

    assert!(
        done,
        "late-joining peer should close its gap via requestMissingFrames replay"
    );
    assert_eq!(tail.all_frames_len().await, 20);
}
