//! Receives, reassembles, forwards, stores, and displays (`spec.md` §4.3).

pub mod text;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, DecodedFrame};
use crate::config::PeerConfig;
use crate::error::{Result, StrandError};
use crate::renderer::FrameRenderer;
use crate::wire::control::PeerControlMessage;
use crate::wire::data::DataMessage;
use crate::wire::PeerRecord;

use self::text::TextDedup;

const UDP_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct PartialFrame {
    total_chunks: u16,
    chunks: HashMap<u16, Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoReadiness {
    Pending,
    Ready,
    Flushed,
}

#[derive(Default)]
struct PlaybackStore {
    all_collections: Vec<Vec<Option<DecodedFrame>>>,
    ready_queue: Vec<VideoReadiness>,
    all_frames: Vec<DecodedFrame>,
    flush_cursor: usize,
}

impl PlaybackStore {
    fn ensure_video(&mut self, video_number: usize, total_frames: usize) {
        if self.all_collections.len() <= video_number {
            self.all_collections.resize(video_number + 1, Vec::new());
            self.ready_queue.resize(video_number + 1, VideoReadiness::Pending);
        }
        if self.all_collections[video_number].len() < total_frames {
            self.all_collections[video_number].resize(total_frames, None);
        }
    }

    /// Video `k+1` is never appended until video `k` has been flushed.
    fn flush_ready_prefix(&mut self) {
        while self.flush_cursor < self.ready_queue.len()
            && self.ready_queue[self.flush_cursor] == VideoReadiness::Ready
        {
            let frames = std::mem::take(&mut self.all_collections[self.flush_cursor]);
            self.all_frames.extend(frames.into_iter().flatten());
            self.ready_queue[self.flush_cursor] = VideoReadiness::Flushed;
            self.flush_cursor += 1;
        }
    }
}

struct PeerState {
    next_peers: Vec<PeerRecord>,
    subcoordinator_addr: Option<SocketAddr>,
    pending: HashMap<u64, PartialFrame>,
    received_frames: HashSet<(u32, u32)>,
    video_totals: HashMap<u32, u32>,
    playback: PlaybackStore,
    text_dedup: TextDedup,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            next_peers: Vec::new(),
            subcoordinator_addr: None,
            pending: HashMap::new(),
            received_frames: HashSet::new(),
            video_totals: HashMap::new(),
            playback: PlaybackStore::default(),
            text_dedup: TextDedup::default(),
        }
    }
}

impl PeerState {
    fn segment_offset(&self, video_number: u32) -> u64 {
        (0..video_number)
            .filter_map(|v| self.video_totals.get(&v).copied())
            .map(u64::from)
            .sum()
    }
}

pub struct Peer {
    pub config: PeerConfig,
    state: Mutex<PeerState>,
    data_socket: UdpSocket,
    frame_dump_tx: mpsc::Sender<(u32, u32, DecodedFrame)>,
    playback_index: AtomicUsize,
    paused: AtomicBool,
}

impl Peer {
    pub async fn new(config: PeerConfig) -> Result<Arc<Self>> {
        let data_socket = UdpSocket::bind((config.bind, config.data_port)).await?;
        let frame_dir = config
            .output_dir
            .join(format!("peer_{}_frames", config.name));
        tokio::fs::create_dir_all(&frame_dir).await.ok();

        let manifest_path = frame_dir.join("manifest.jsonl");
        let (frame_dump_tx, mut frame_dump_rx) = mpsc::channel::<(u32, u32, DecodedFrame)>(64);
        tokio::spawn(async move {
            while let Some((video_number, frame_num, frame)) = frame_dump_rx.recv().await {
                let path = frame_dir.join(format!("frame_{frame_num:06}.jpg"));
                if let Ok(jpeg) = codec::encode_jpeg(frame.width, frame.height, &frame.rgb, 80) {
                    if let Err(e) = tokio::fs::write(&path, &jpeg).await {
                        warn!(%e, ?path, video_number, "failed to persist frame dump");
                        continue;
                    }
                    let entry = json!({
                        "video_number": video_number,
                        "frame_num": frame_num,
                        "bytes": jpeg.len(),
                        "captured_at": chrono::Utc::now().to_rfc3339(),
                    });
                    let line = format!("{entry}\n");
                    match tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&manifest_path)
                        .await
                    {
                        Ok(mut file) => {
                            if let Err(e) = file.write_all(line.as_bytes()).await {
                                warn!(%e, "failed to append frame manifest entry");
                            }
                        }
                        Err(e) => warn!(%e, "failed to open frame manifest"),
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            config,
            state: Mutex::new(PeerState::default()),
            data_socket,
            frame_dump_tx,
            playback_index: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
        }))
    }

    pub async fn register_with_coordinator(&self, coordinator_addr: SocketAddr) -> Result<()> {
        let payload = json!({
            "action": "register",
            "type": "peer",
            "name": self.config.name,
            "port": self.config.data_port,
            "ctrl_port": self.config.ctrl_port(),
            "ip": self.config.bind.to_string(),
        });
        let reply = tcp_roundtrip(coordinator_addr, &payload).await?;
        let reply: Value = serde_json::from_slice(&reply).unwrap_or_default();
        info!(?reply, "registered with coordinator");
        Ok(())
    }

    pub async fn run(
        self: Arc<Self>,
        renderer: Box<dyn FrameRenderer>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let ctrl_listener = TcpListener::bind((self.config.bind, self.config.ctrl_port())).await?;
        info!(
            data_port = self.config.data_port,
            ctrl_port = self.config.ctrl_port(),
            "peer listening"
        );

        let ctrl_this = self.clone();
        let ctrl_cancel = cancel.clone();
        let ctrl_task = tokio::spawn(async move { ctrl_this.control_loop(ctrl_listener, ctrl_cancel).await });

        let playback_this = self.clone();
        let playback_cancel = cancel.clone();
        let playback_task =
            tokio::spawn(async move { playback_this.playback_loop(renderer, playback_cancel).await });

        self.data_loop(cancel).await?;
        let _ = ctrl_task.await;
        let _ = playback_task.await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Data plane
    // -----------------------------------------------------------------

    async fn data_loop(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let recv = tokio::time::timeout(UDP_TIMEOUT, self.data_socket.recv_from(&mut buf)).await;
            let (len, _from) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(%e, "udp recv error");
                    continue;
                }
                Err(_) => continue, // timeout: loop back and re-check cancellation
            };

            let msg: DataMessage = match serde_json::from_slice(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    warn!(%e, "malformed datagram");
                    continue;
                }
            };

            let this = self.clone();
            tokio::spawn(async move { this.handle_data_message(msg).await });
        }
    }

    async fn handle_data_message(self: Arc<Self>, msg: DataMessage) {
        match msg {
            DataMessage::VideoFrame(chunk) => self.handle_video_chunk(chunk).await,
            DataMessage::VideoEnd { video_number, frame_num, .. } => {
                self.handle_video_end(video_number, frame_num).await
            }
            DataMessage::Data { origin, seq, msg, .. } => {
                let mut state = self.state.lock().await;
                if let Some(line) = text::handle_text_message(&mut state.text_dedup, &origin, seq, &msg) {
                    debug!(origin, seq, %line, "text message accepted");
                }
            }
        }
    }

    async fn handle_video_chunk(self: Arc<Self>, chunk: crate::wire::data::VideoFrameChunk) {
        let complete = {
            let mut state = self.state.lock().await;

            if state.received_frames.contains(&(chunk.video_number, chunk.frame_num)) {
                return; // dedup: already decoded and forwarded
            }

            state
                .video_totals
                .insert(chunk.video_number, chunk.total_frames_incoming);

            let global_index = state.segment_offset(chunk.video_number) + chunk.frame_num as u64;
            let entry = state.pending.entry(global_index).or_insert_with(|| PartialFrame {
                total_chunks: chunk.total_chunks,
                chunks: HashMap::new(),
            });
            entry.chunks.insert(chunk.chunk_id, chunk.data.clone());

            if entry.chunks.len() == entry.total_chunks as usize {
                let complete = state.pending.remove(&global_index).unwrap();
                Some(complete)
            } else {
                None
            }
        };

        let Some(complete) = complete else { return };

        let ordered: Vec<Vec<u8>> = (0..complete.total_chunks)
            .map(|id| complete.chunks.get(&id).cloned().unwrap_or_default())
            .collect();

        // Re-emit the reassembled chunk set only now that the frame is
        // complete — a peer with a partial frame withholds it instead of
        // relaying gaps downstream, so repair happens once at this hop
        // rather than cascading to every peer after it.
        for (chunk_id, data) in ordered.iter().enumerate() {
            let forward = DataMessage::VideoFrame(crate::wire::data::VideoFrameChunk {
                origin: chunk.origin.clone(),
                video_number: chunk.video_number,
                frame_num: chunk.frame_num,
                chunk_id: chunk_id as u16,
                total_chunks: complete.total_chunks,
                total_frames_incoming: chunk.total_frames_incoming,
                data: data.clone(),
            });
            self.forward_bytes(&serde_json::to_vec(&forward).unwrap()).await;
        }

        let compressed = codec::join_chunks(&ordered);
        let decoded = match codec::decompress(&compressed).and_then(|jpeg| codec::decode_jpeg(&jpeg)) {
            Ok(d) => d,
            Err(e) => {
                warn!(%e, video_number = chunk.video_number, frame_num = chunk.frame_num, "frame decode failed");
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.received_frames.insert((chunk.video_number, chunk.frame_num));
        state.playback.ensure_video(
            chunk.video_number as usize,
            chunk.total_frames_incoming as usize,
        );
        state.playback.all_collections[chunk.video_number as usize][chunk.frame_num as usize] =
            Some(decoded.clone());
        drop(state);

        let _ = self
            .frame_dump_tx
            .try_send((chunk.video_number, chunk.frame_num, decoded));
    }

    async fn handle_video_end(self: Arc<Self>, video_number: u32, total_frames: u32) {
        let (missing, should_flush) = {
            let mut state = self.state.lock().await;
            state.playback.ensure_video(video_number as usize, total_frames as usize);

            let row = &state.playback.all_collections[video_number as usize];
            let missing: Vec<u32> = row
                .iter()
                .enumerate()
                .filter(|(_, f)| f.is_none())
                .map(|(i, _)| i as u32)
                .collect();

            let mut should_flush = false;
            if missing.is_empty()
                && state.playback.ready_queue[video_number as usize] == VideoReadiness::Pending
            {
                state.playback.ready_queue[video_number as usize] = VideoReadiness::Ready;
                should_flush = true;
            }
            (missing, should_flush)
        };

        if !missing.is_empty() {
            if let Err(e) = self.request_missing_frames(video_number, missing).await {
                warn!(%e, video_number, "requestMissingFrames failed");
            }
            // Gaps remain: don't forward video_end or declare deliveryDone
            // yet. The replay worker re-emits its own video_end once the
            // requested frames land, which re-enters this function and
            // retries the completeness check.
            return;
        }

        if should_flush {
            let mut state = self.state.lock().await;
            state.playback.flush_ready_prefix();
        }

        let end = DataMessage::VideoEnd {
            origin: self.config.name.clone(),
            video_number,
            frame_num: total_frames,
        };
        let is_tail = self
            .forward_bytes(&serde_json::to_vec(&end).unwrap())
            .await;

        if is_tail {
            if let Err(e) = self.send_delivery_done().await {
                warn!(%e, "deliveryDone failed");
            }
        }
    }

    /// Forward a datagram to the live head of `next_peers`, probing
    /// liveness first and failing over on a dead head. Returns `true` if
    /// this peer is the tail (no next hop at all).
    async fn forward_bytes(&self, bytes: &[u8]) -> bool {
        loop {
            let target = {
                let state = self.state.lock().await;
                state.next_peers.first().cloned()
            };
            let Some(target) = target else {
                return true;
            };

            if self.probe_ack(target.ctrl_addr()).await.is_ok() {
                if let Err(e) = self.data_socket.send_to(bytes, target.data_addr()).await {
                    warn!(%e, target = %target.name, "udp send failed");
                }
                return false;
            }

            warn!(target = %target.name, "next hop unresponsive, failing over");
            let mut state = self.state.lock().await;
            if !state.next_peers.is_empty() {
                state.next_peers.remove(0);
            }
        }
    }

    async fn probe_ack(&self, addr: SocketAddr) -> Result<()> {
        let mut stream = tokio::time::timeout(TCP_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| StrandError::Protocol("ack connect timeout".into()))??;
        tokio::time::timeout(TCP_TIMEOUT, stream.write_all(br#"{"cmd":"ack"}"#))
            .await
            .map_err(|_| StrandError::Protocol("ack write timeout".into()))??;
        stream.shutdown().await?;
        let mut reply = Vec::new();
        tokio::time::timeout(TCP_TIMEOUT, stream.read_to_end(&mut reply))
            .await
            .map_err(|_| StrandError::Protocol("ack read timeout".into()))??;
        Ok(())
    }

    async fn request_missing_frames(&self, video_number: u32, missing_frames: Vec<u32>) -> Result<()> {
        let addr = {
            let state = self.state.lock().await;
            state
                .subcoordinator_addr
                .ok_or_else(|| StrandError::Protocol("no subcoordinator known".into()))?
        };
        let payload = json!({
            "type": "requestMissingFrames",
            "peer_name": self.config.name,
            "peer_port": self.config.data_port,
            "video_number": video_number,
            "missing_frames": missing_frames,
        });
        tcp_roundtrip(addr, &payload).await?;
        Ok(())
    }

    async fn send_delivery_done(&self) -> Result<()> {
        let addr = {
            let state = self.state.lock().await;
            state
                .subcoordinator_addr
                .ok_or_else(|| StrandError::Protocol("no subcoordinator known".into()))?
        };
        let payload = json!({ "type": "deliveryDone" });
        tcp_roundtrip(addr, &payload).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Control plane
    // -----------------------------------------------------------------

    async fn control_loop(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_control_connection(stream).await {
                            warn!(%e, "control connection error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_control_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut buf = Vec::new();
        tokio::time::timeout(TCP_TIMEOUT, stream.read_to_end(&mut buf))
            .await
            .map_err(|_| StrandError::Protocol("read timeout".into()))??;

        let reply: Vec<u8> = match serde_json::from_slice::<Value>(&buf) {
            Ok(raw) => match PeerControlMessage::parse(&raw) {
                Ok(msg) => {
                    self.apply_control_message(msg).await;
                    crate::wire::control::OK_REPLY.as_bytes().to_vec()
                }
                Err(e) => serde_json::to_vec(&e.to_json_reply())?,
            },
            Err(e) => serde_json::to_vec(&StrandError::Json(e).to_json_reply())?,
        };

        tokio::time::timeout(TCP_TIMEOUT, stream.write_all(&reply))
            .await
            .map_err(|_| StrandError::Protocol("write timeout".into()))??;
        Ok(())
    }

    async fn apply_control_message(&self, msg: PeerControlMessage) {
        match msg {
            PeerControlMessage::UpdateNext(record) => {
                let mut state = self.state.lock().await;
                state.next_peers.push(record);
            }
            PeerControlMessage::SubcoordinatorInfo { subcoordinator_port, prev_peer } => {
                let mut state = self.state.lock().await;
                // LAN/localhost assumption (`spec.md` §1 non-goals): the
                // Subcoordinator is reachable on the same host as the
                // Coordinator that relayed this message.
                state.subcoordinator_addr =
                    Some(SocketAddr::new(self.config.bind, subcoordinator_port));
                if let Some(prev) = prev_peer {
                    debug!(prev = prev.name, "learned upstream predecessor");
                }
            }
            PeerControlMessage::Ack => {}
        }
    }

    // -----------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------

    async fn playback_loop(self: Arc<Self>, mut renderer: Box<dyn FrameRenderer>, cancel: CancellationToken) {
        let tick = Duration::from_secs_f64(1.0 / self.config.playback_fps.max(1.0));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(tick) => {}
            }

            if self.paused.load(Ordering::Relaxed) {
                continue;
            }

            let index = self.playback_index.load(Ordering::Relaxed);
            let state = self.state.lock().await;
            let total = state.playback.all_frames.len();
            if let Some(frame) = state.playback.all_frames.get(index) {
                renderer.show(frame, index, total, false);
                drop(state);
                self.playback_index.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn seek(&self, index: usize) {
        self.playback_index.store(index, Ordering::Relaxed);
    }

    pub async fn all_frames_len(&self) -> usize {
        self.state.lock().await.playback.all_frames.len()
    }

    pub async fn is_video_complete(&self, video_number: u32) -> bool {
        let state = self.state.lock().await;
        state
            .playback
            .all_collections
            .get(video_number as usize)
            .map(|row| !row.is_empty() && row.iter().all(Option::is_some))
            .unwrap_or(false)
    }

    pub async fn next_peers_snapshot(&self) -> Vec<PeerRecord> {
        self.state.lock().await.next_peers.clone()
    }

    pub async fn set_subcoordinator_addr(&self, addr: SocketAddr) {
        self.state.lock().await.subcoordinator_addr = Some(addr);
    }
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
