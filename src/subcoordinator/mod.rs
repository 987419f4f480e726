//! Owns one strand: admits peers, wires `UPDATE_NEXT` fan-out, streams one
//! video at a time, and serves chunk replay (`spec.md` §4.2).

pub mod operator;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec;
use crate::config::SubcoordinatorConfig;
use crate::error::{Result, StrandError};
use crate::frame_source::{DirectoryFrameSource, FrameSource, SyntheticFrameSource};
use crate::wire::control::{PeerNameAndPort, RegisterReply, SubcoordinatorRequest};
use crate::wire::data::DataMessage;
use crate::wire::PeerRecord;

const TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-`(video_number, frame_num)` chunk store, retained for the life of the
/// video so the replay worker can serve it.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub total_chunks: u16,
    pub total_frames_incoming: u32,
    pub chunks: Vec<Option<Vec<u8>>>,
}

impl FrameBuffer {
    fn is_complete(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }
}

#[derive(Default)]
pub struct SubcoordinatorState {
    pub peers: Vec<PeerRecord>,
    pub frame_buffers: HashMap<(u32, u32), FrameBuffer>,
    pub file_count: usize,
    pub video_streaming: bool,
    /// Set by the `deliveryDone` handshake when the Coordinator reports
    /// `buffer > 0`: how many more peer registrations to wait for before the
    /// next video may start.
    pub expected_new_peers: usize,
    pub peers_at_handshake: usize,
    /// Total frame count per video, recorded when streaming starts so the
    /// replay worker's closing `video_end` can report the real total
    /// instead of however many frames happened to need replay.
    pub video_frame_counts: HashMap<u32, u32>,
}

pub struct Subcoordinator {
    pub state: Mutex<SubcoordinatorState>,
    pub config: SubcoordinatorConfig,
    pub own_port: u16,
    pub coordinator_addr: SocketAddr,
    next_video_ready: Notify,
    data_socket: UdpSocket,
}

impl Subcoordinator {
    pub async fn new(config: SubcoordinatorConfig) -> Result<Arc<Self>> {
        let coordinator_addr = resolve_addr(&config.coordinator_addr)?;
        let data_socket = UdpSocket::bind((config.bind, 0)).await?;
        Ok(Arc::new(Self {
            state: Mutex::new(SubcoordinatorState::default()),
            own_port: config.port,
            coordinator_addr,
            next_video_ready: Notify::new(),
            data_socket,
            config,
        }))
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.register_with_coordinator().await?;

        let listener = TcpListener::bind((self.config.bind, self.config.port)).await?;
        info!(port = self.config.port, "subcoordinator listening");

        let streaming = self.clone();
        let streaming_cancel = cancel.clone();
        tokio::spawn(async move { streaming.streaming_loop(streaming_cancel).await });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("subcoordinator shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, peer_addr).await {
                            warn!(%e, "subcoordinator connection error");
                        }
                    });
                }
            }
        }
    }

    async fn register_with_coordinator(&self) -> Result<()> {
        let payload = json!({
            "action": "register",
            "type": "subcoordinator",
            "port": self.own_port,
        });
        let reply = tcp_roundtrip(self.coordinator_addr, &payload).await?;
        info!(?reply, "registered with coordinator");
        Ok(())
    }

    async fn handle_connection(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let mut buf = Vec::new();
        tokio::time::timeout(TCP_TIMEOUT, stream.read_to_end(&mut buf))
            .await
            .map_err(|_| StrandError::Protocol("read timeout".into()))??;

        let raw: Value = match serde_json::from_slice(&buf) {
            Ok(v) => v,
            Err(e) => {
                write_reply(&mut stream, &StrandError::Json(e).to_json_reply()).await?;
                return Ok(());
            }
        };

        let req = match SubcoordinatorRequest::parse(&raw) {
            Ok(req) => req,
            Err(e) => {
                write_reply(&mut stream, &e.to_json_reply()).await?;
                return Ok(());
            }
        };

        // `deliveryDone` replies immediately, then continues the Coordinator
        // handshake asynchronously — the reply must not wait on that round
        // trip.
        if matches!(req, SubcoordinatorRequest::DeliveryDone) {
            write_reply(&mut stream, &json!({ "status": "acknowledged" })).await?;
            let this = self.clone();
            tokio::spawn(async move { this.on_delivery_done().await });
            return Ok(());
        }

        let reply = self.handle_request(req, peer_addr.ip()).await;
        write_reply(&mut stream, &reply).await
    }

    async fn handle_request(self: &Arc<Self>, req: SubcoordinatorRequest, from_ip: IpAddr) -> Value {
        match req {
            SubcoordinatorRequest::Register(mut record) => {
                if record.ip.is_unspecified() {
                    record.ip = from_ip;
                }
                self.register_peer(record).await
            }
            SubcoordinatorRequest::DeliveryDone => unreachable!("handled in handle_connection"),
            SubcoordinatorRequest::Lookup { name, requester } => self.lookup(&name, &requester).await,
            SubcoordinatorRequest::List { requester } => self.list(&requester).await,
            SubcoordinatorRequest::RequestMissingFrames {
                peer_name,
                peer_port,
                video_number,
                missing_frames,
            } => {
                self.request_missing_frames(peer_name, SocketAddr::new(from_ip, peer_port), video_number, missing_frames)
                    .await
            }
        }
    }

    /// `register`: append, reply the previous peer in the strand, fan
    /// `UPDATE_NEXT` out to the up-to-three most recent prior peers.
    async fn register_peer(self: &Arc<Self>, record: PeerRecord) -> Value {
        let (prev, fanout_targets) = {
            let mut state = self.state.lock().await;
            let prev = state.peers.last().cloned();
            state.peers.push(record.clone());
            let n = state.peers.len();
            let start = n.saturating_sub(4);
            let targets: Vec<PeerRecord> = state.peers[start..n - 1].to_vec();

            if state.expected_new_peers > 0 && n - state.peers_at_handshake >= state.expected_new_peers {
                state.expected_new_peers = 0;
            }
            (prev, targets)
        };

        info!(peer = %record.name, "peer registered");

        for target in fanout_targets {
            let this = self.clone();
            let new_peer = record.clone();
            tokio::spawn(async move {
                if let Err(e) = this.send_update_next(&target, &new_peer).await {
                    warn!(%e, target = %target.name, "UPDATE_NEXT delivery failed");
                }
            });
        }

        self.maybe_unblock_next_video().await;

        let reply = RegisterReply { prev };
        serde_json::to_value(reply).unwrap_or_else(|_| json!({}))
    }

    async fn maybe_unblock_next_video(&self) {
        let should_notify = {
            let mut state = self.state.lock().await;
            let ready = state.expected_new_peers == 0 && state.peers_at_handshake > 0;
            if ready {
                // One-shot: don't re-fire on every later registration.
                state.peers_at_handshake = 0;
            }
            ready
        };
        if should_notify {
            self.next_video_ready.notify_one();
        }
    }

    async fn send_update_next(&self, target: &PeerRecord, new_peer: &PeerRecord) -> Result<()> {
        let payload = json!({
            "cmd": "UPDATE_NEXT",
            "name": new_peer.name,
            "port": new_peer.data_port,
            "ctrl_port": new_peer.ctrl_port,
            "ip": new_peer.ip.to_string(),
        });
        tcp_roundtrip(target.ctrl_addr(), &payload).await?;
        Ok(())
    }

    async fn lookup(&self, name: &str, requester: &str) -> Value {
        let state = self.state.lock().await;
        if !state.peers.iter().any(|p| p.name == requester) {
            return json!({ "error": "unauthorized" });
        }
        match state.peers.iter().find(|p| p.name == name) {
            Some(p) => serde_json::to_value(p).unwrap_or_else(|_| json!({})),
            None => json!({ "error": "not found" }),
        }
    }

    async fn list(&self, requester: &str) -> Value {
        let state = self.state.lock().await;
        if !state.peers.iter().any(|p| p.name == requester) {
            return json!({ "error": "unauthorized" });
        }
        json!({ "peers": state.peers })
    }

    /// Spawn the replay worker: re-emit any complete requested frames
    /// directly to the requesting peer, bypassing the chain.
    async fn request_missing_frames(
        self: &Arc<Self>,
        peer_name: String,
        requester_addr: SocketAddr,
        video_number: u32,
        missing_frames: Vec<u32>,
    ) -> Value {
        let this = self.clone();
        tokio::spawn(async move {
            this.replay_worker(peer_name, requester_addr, video_number, missing_frames)
                .await;
        });
        json!({ "status": "ok" })
    }

    async fn replay_worker(
        &self,
        peer_name: String,
        requester_addr: SocketAddr,
        video_number: u32,
        missing_frames: Vec<u32>,
    ) {
        for frame_num in &missing_frames {
            let buffer = {
                let state = self.state.lock().await;
                state.frame_buffers.get(&(video_number, *frame_num)).cloned()
            };
            let Some(buffer) = buffer else {
                warn!(peer = %peer_name, video_number, frame_num, "replay requested for unknown frame");
                continue;
            };
            if !buffer.is_complete() {
                warn!(peer = %peer_name, video_number, frame_num, "replay requested for incomplete frame");
                continue;
            }
            for (chunk_id, chunk) in buffer.chunks.iter().enumerate() {
                let chunk = chunk.as_ref().expect("checked complete above");
                let msg = DataMessage::VideoFrame(crate::wire::data::VideoFrameChunk {
                    origin: "subcoordinator".into(),
                    video_number,
                    frame_num: *frame_num,
                    chunk_id: chunk_id as u16,
                    total_chunks: buffer.total_chunks,
                    total_frames_incoming: buffer.total_frames_incoming,
                    data: chunk.clone(),
                });
                if let Err(e) = self.send_datagram(requester_addr, &msg).await {
                    warn!(%e, "replay chunk send failed");
                }
            }
        }

        let total_frames = {
            let state = self.state.lock().await;
            state.video_frame_counts.get(&video_number).copied()
        };
        let total_frames = total_frames.unwrap_or_else(|| {
            warn!(video_number, "replay worker has no recorded frame count, falling back to missing-frame count");
            missing_frames.len() as u32
        });

        let end = DataMessage::VideoEnd {
            origin: "subcoordinator".into(),
            video_number,
            frame_num: total_frames,
        };
        if let Err(e) = self.send_datagram(requester_addr, &end).await {
            warn!(%e, "replay video_end send failed");
        }
    }

    async fn send_datagram(&self, addr: SocketAddr, msg: &DataMessage) -> Result<()> {
        let bytes = serde_json::to_vec(msg)?;
        self.data_socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    async fn on_delivery_done(self: Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.video_streaming = false;
        }

        let payload = json!({
            "action": "status",
            "status": "done",
            "port": self.own_port,
        });
        let reply = match tcp_roundtrip(self.coordinator_addr, &payload).await {
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes).unwrap_or_default(),
            Err(e) => {
                warn!(%e, "status-done round trip to coordinator failed");
                // Proceed anyway rather than stall forever.
                self.next_video_ready.notify_one();
                return;
            }
        };

        let buffer = reply.get("buffer").and_then(Value::as_u64).unwrap_or(0) as usize;
        if buffer == 0 {
            self.next_video_ready.notify_one();
        } else {
            let mut state = self.state.lock().await;
            state.expected_new_peers = buffer;
            state.peers_at_handshake = state.peers.len();
        }
    }

    /// Starts the first video automatically once registration has happened
    /// at all, then blocks between videos on `deliveryDone` + the
    /// Coordinator's `buffer=0` handshake.
    async fn streaming_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let has_peers = { !self.state.lock().await.peers.is_empty() };
            if !has_peers {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                }
            }

            let video_number = { self.state.lock().await.file_count };
            let Some(source) = self.build_frame_source(video_number) else {
                info!("no more videos configured, subcoordinator idling");
                return;
            };

            {
                let mut state = self.state.lock().await;
                state.video_streaming = true;
            }

            if let Err(e) = self.stream_video(video_number as u32, source).await {
                warn!(%e, video_number, "streaming aborted for this video, continuing to next");
            }

            {
                let mut state = self.state.lock().await;
                state.file_count += 1;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.next_video_ready.notified() => {}
            }
        }
    }

    fn build_frame_source(&self, video_number: usize) -> Option<Box<dyn FrameSource>> {
        if let Some(dir) = self.config.video_dirs.get(video_number) {
            return Some(Box::new(DirectoryFrameSource::new(dir.clone(), 30.0)));
        }
        if let Some(count) = self.config.synthetic_videos {
            if video_number < count {
                return Some(Box::new(SyntheticFrameSource::new(
                    self.config.synthetic_frame_count,
                    64,
                    48,
                    30.0,
                )));
            }
        }
        None
    }

    /// The streaming algorithm: scan, encode, compress, chunk, emit
    /// (`spec.md` §4.2).
    async fn stream_video(&self, video_number: u32, mut source: Box<dyn FrameSource>) -> Result<()> {
        let total_frames = source.frame_count()?;
        info!(video_number, total_frames, "starting video stream");

        {
            let mut state = self.state.lock().await;
            state.video_frame_counts.insert(video_number, total_frames as u32);
        }

        let head = {
            let state = self.state.lock().await;
            state.peers.first().cloned()
        };
        let Some(head) = head else {
            return Err(StrandError::NoRoom);
        };

        for frame_num in 0..total_frames {
            let raw = source.read_frame(frame_num)?;
            let jpeg = codec::encode_jpeg(raw.width, raw.height, &raw.rgb, self.config.jpeg_quality)?;
            let compressed = codec::compress(&jpeg);
            let chunks = codec::split_into_chunks(&compressed);
            let total_chunks = chunks.len() as u16;

            let buffer = FrameBuffer {
                total_chunks,
                total_frames_incoming: total_frames as u32,
                chunks: chunks.iter().map(|c| Some(c.to_vec())).collect(),
            };
            {
                let mut state = self.state.lock().await;
                state
                    .frame_buffers
                    .insert((video_number, frame_num as u32), buffer);
            }

            for (chunk_id, chunk) in chunks.iter().enumerate() {
                let msg = DataMessage::VideoFrame(crate::wire::data::VideoFrameChunk {
                    origin: "subcoordinator".into(),
                    video_number,
                    frame_num: frame_num as u32,
                    chunk_id: chunk_id as u16,
                    total_chunks,
                    total_frames_incoming: total_frames as u32,
                    data: chunk.to_vec(),
                });
                self.send_datagram(head.data_addr(), &msg).await?;
                tokio::time::sleep(Duration::from_micros(self.config.inter_chunk_delay_micros)).await;
            }
        }

        let end = DataMessage::VideoEnd {
            origin: "subcoordinator".into(),
            video_number,
            frame_num: total_frames as u32,
        };
        self.send_datagram(head.data_addr(), &end).await?;
        info!(video_number, "finished streaming video");
        Ok(())
    }

    /// Remove a peer and repair the strand (`drop <peer>` CLI command).
    /// Returns the removed peer's record so callers that need to hand it off
    /// elsewhere (`switch_peer`) don't have to look it up again.
    pub async fn drop_peer(&self, name: &str) -> Result<PeerRecord> {
        let (removed, repair_targets, successor) = {
            let mut state = self.state.lock().await;
            let Some(index) = state.peers.iter().position(|p| p.name == name) else {
                return Err(StrandError::UnknownPeer(name.to_string()));
            };
            let removed = state.peers.remove(index);
            let successor = state.peers.get(index).cloned();
            let start = index.saturating_sub(3);
            let end = index.min(state.peers.len());
            let repair_targets: Vec<PeerRecord> = state.peers[start..end].to_vec();
            (removed, repair_targets, successor)
        };

        if let Some(successor) = successor {
            for target in repair_targets {
                self.send_update_next(&target, &successor).await?;
            }
        }
        Ok(removed)
    }

    /// Drop a peer from this strand and reassign it to the subcoordinator
    /// listening on `new_coordinator_port` (`switch <peer> <new_coord_port>`
    /// CLI command): registers it there, then tells the peer's control port
    /// about its new subcoordinator and predecessor, the same way a
    /// Coordinator batch dispatch wires up a freshly admitted peer.
    pub async fn switch_peer(&self, name: &str, new_coordinator_port: u16) -> Result<()> {
        let removed = self.drop_peer(name).await?;
        let new_coordinator_addr = SocketAddr::new(self.config.bind, new_coordinator_port);

        let register_payload = json!({
            "type": "register",
            "name": removed.name,
            "port": removed.data_port,
            "ctrl_port": removed.ctrl_port,
            "ip": removed.ip.to_string(),
        });
        let reply = tcp_roundtrip(new_coordinator_addr, &register_payload).await?;
        let reply: Value = serde_json::from_slice(&reply).unwrap_or_default();
        let prev_peer = reply
            .get("prev")
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value::<PeerRecord>(v.clone()).ok())
            .map(|p| PeerNameAndPort { name: p.name, port: p.data_port });

        let info_payload = json!({
            "cmd": "SUBCOORDINATOR_INFO",
            "subcoordinator_port": new_coordinator_port,
            "prev_peer": prev_peer,
        });
        tcp_roundtrip(removed.ctrl_addr(), &info_payload).await?;
        Ok(())
    }

    pub async fn peers_snapshot(&self) -> Vec<PeerRecord> {
        self.state.lock().await.peers.clone()
    }
}

async fn write_reply(stream: &mut TcpStream, reply: &Value) -> Result<()> {
    let bytes = serde_json::to_vec(reply)?;
    tokio::time::timeout(TCP_TIMEOUT, stream.write_all(&bytes))
        .await
        .map_err(|_| StrandError::Protocol("write timeout".into()))??;
    Ok(())
}

async fn tcp_roundtrip(addr: SocketAddr, payload: &Value) -> Result<Vec<u8>> {
    let mut stream = tokio::time::timeout(TCP_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| StrandError::Protocol("connect timeout".into()))??;
    let bytes = serde_json::to_vec(payload)?;
    tokio::time::timeout(TCP_TIMEOUT, stream.write_all(&bytes))
        .await
        .map_err(|_| StrandError::Protocol("write timeout".into()))??;
    stream.shutdown().await?;

    let mut reply = Vec::new();
    tokio::time::timeout(TCP_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .map_err(|_| StrandError::Protocol("read timeout".into()))??;
    Ok(reply)
}

fn resolve_addr(spec: &str) -> Result<SocketAddr> {
    spec.parse()
        .map_err(|_| StrandError::Protocol(format!("bad address '{spec}'")))
}
