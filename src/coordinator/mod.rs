//! Global admission and batch allocation (`spec.md` §4.1).
//!
//! One coarse `Mutex<AdmissionTables>` guards the four parallel arrays
//! (`subcoordinators`, `buffer`, `queue`, `strands`) plus the
//! `all_strands_have_peers` flag, matching `spec.md` §5's mandate that these
//! are read-modify-written together often enough to need one lock rather
//! than four independent ones.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, StrandError};
use crate::wire::PeerRecord;

const TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// One Subcoordinator's admission slot.
#[derive(Debug, Clone)]
pub struct SubcoordSlot {
    pub addr: SocketAddr,
    /// How many peers the Coordinator may currently send to this slot next.
    pub buffer: usize,
    pub queue: Vec<PeerRecord>,
    /// Peers already dispatched, kept for diagnostics.
    pub strand: Vec<PeerRecord>,
}

#[derive(Debug, Default)]
pub struct AdmissionTables {
    pub slots: Vec<SubcoordSlot>,
    pub all_strands_have_peers: bool,
}

pub struct Coordinator {
    pub tables: Mutex<AdmissionTables>,
    pub batch_size: usize,
}

impl Coordinator {
    pub fn new(batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(AdmissionTables::default()),
            batch_size,
        })
    }

    /// Run the TCP accept loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, bind: IpAddr, port: u16, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind((bind, port)).await?;
        info!(port, "coordinator listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("coordinator shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, peer_addr).await {
                            warn!(%e, "coordinator connection error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let mut buf = Vec::new();
        tokio::time::timeout(TCP_TIMEOUT, stream.read_to_end(&mut buf))
            .await
            .map_err(|_| StrandError::Protocol("read timeout".into()))??;

        let reply = match serde_json::from_slice::<Value>(&buf) {
            Ok(raw) => match crate::wire::control::CoordinatorRequest::parse(&raw) {
                Ok(req) => self.handle_request(req, peer_addr.ip()).await,
                Err(e) => e.to_json_reply(),
            },
            Err(e) => StrandError::Json(e).to_json_reply(),
        };

        let bytes = serde_json::to_vec(&reply)?;
        tokio::time::timeout(TCP_TIMEOUT, stream.write_all(&bytes))
            .await
            .map_err(|_| StrandError::Protocol("write timeout".into()))??;
        Ok(())
    }

    async fn handle_request(
        self: &Arc<Self>,
        req: crate::wire::control::CoordinatorRequest,
        from_ip: IpAddr,
    ) -> Value {
        use crate::wire::control::CoordinatorRequest as Req;
        match req {
            Req::RegisterSubcoordinator { port } => {
                self.register_subcoordinator(SocketAddr::new(from_ip, port)).await
            }
            Req::RegisterPeer(record) => self.register_peer(record).await,
            Req::StatusDone { port } => self.status_done(SocketAddr::new(from_ip, port)).await,
        }
    }

    async fn register_subcoordinator(&self, addr: SocketAddr) -> Value {
        let mut tables = self.tables.lock().await;
        tables.slots.push(SubcoordSlot {
            addr,
            buffer: self.batch_size,
            queue: Vec::new(),
            strand: Vec::new(),
        });
        info!(%addr, slot = tables.slots.len() - 1, "subcoordinator registered");
        json!({ "reply": "registered" })
    }

    /// Exposed for integration tests driving admission without a live TCP
    /// connection.
    pub async fn register_peer_for_test(self: &Arc<Self>, record: PeerRecord) -> Value {
        self.register_peer(record).await
    }

    /// Scan slots in order, accept into the first slot whose queue is not
    /// saturated (`spec.md` §4.1 admission policy).
    async fn register_peer(self: &Arc<Self>, record: PeerRecord) -> Value {
        let (accepted_slot, dispatch) = {
            let mut tables = self.tables.lock().await;
            let all_seeded = tables.all_strands_have_peers;
            let batch_size = self.batch_size;

            let mut accepted = None;
            for (i, slot) in tables.slots.iter_mut().enumerate() {
                let room = slot.queue.len() < batch_size;
                let accepts = if all_seeded { room } else { slot.buffer > 0 && room };
                if accepts {
                    slot.queue.push(record.clone());
                    accepted = Some(i);
                    break;
                }
            }

            let dispatch = accepted.filter(|&i| {
                let slot = &tables.slots[i];
                slot.buffer > 0 && slot.queue.len() == slot.buffer
            });
            (accepted, dispatch)
        };

        match accepted_slot {
            None => json!({ "message": "full" }),
            Some(i) => {
                if let Some(slot_index) = dispatch {
                    let this = self.clone();
                    tokio::spawn(async move { this.dispatch_batch(slot_index).await });
                }
                json!({ "message": "queued", "slot": i })
            }
        }
    }

    /// Subcoordinator signals it finished a video and is ready for more
    /// peers: `buffer[i] = len(queue[i])`, reply, dispatch immediately.
    async fn status_done(self: &Arc<Self>, addr: SocketAddr) -> Value {
        let (slot_index, n) = {
            let mut tables = self.tables.lock().await;
            let Some(i) = tables.slots.iter().position(|s| s.addr.port() == addr.port()) else {
                return json!({ "error": "unknown subcoordinator" });
            };
            let n = tables.slots[i].queue.len();
            tables.slots[i].buffer = n;
            (i, n)
        };

        if n > 0 {
            let this = self.clone();
            tokio::spawn(async move { this.dispatch_batch(slot_index).await });
        }
        json!({ "buffer": n })
    }

    /// Forward each peer in the batch to the owning Subcoordinator, then
    /// send each peer its `SUBCOORDINATOR_INFO`. Runs off the accept task
    /// (`spec.md` §5).
    ///
    /// Re-queue on partial failure (`DESIGN.md`): the first peer whose
    /// register fails aborts the rest of the batch's dispatch and the whole
    /// batch — including peers already forwarded — is put back on
    /// `queue[i]` with `buffer[i]` restored, rather than lost.
    async fn dispatch_batch(self: Arc<Self>, slot_index: usize) {
        let (addr, batch) = {
            let mut tables = self.tables.lock().await;
            let Some(slot) = tables.slots.get_mut(slot_index) else {
                return;
            };
            if slot.queue.is_empty() {
                return;
            }
            let batch: Vec<PeerRecord> = slot.queue.drain(..).collect();
            (slot.addr, batch)
        };

        let mut forwarded = Vec::with_capacity(batch.len());
        let mut failure = None;

        for peer in &batch {
            match register_peer_with_subcoordinator(addr, peer).await {
                Ok(()) => forwarded.push(peer.clone()),
                Err(e) => {
                    warn!(%e, peer = %peer.name, "dispatch to subcoordinator failed");
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!(slot_index, %e, "batch dispatch aborted, re-queueing");
            let mut tables = self.tables.lock().await;
            if let Some(slot) = tables.slots.get_mut(slot_index) {
                let mut restored = batch;
                restored.extend(slot.queue.drain(..));
                slot.buffer = restored.len();
                slot.queue = restored;
            }
            return;
        }

        // Wire up SUBCOORDINATOR_INFO for each peer, pointing at its
        // predecessor within this batch.
        for (i, peer) in batch.iter().enumerate() {
            let prev = if i > 0 {
                Some(crate::wire::control::PeerNameAndPort {
                    name: batch[i - 1].name.clone(),
                    port: batch[i - 1].data_port,
                })
            } else {
                None
            };
            if let Err(e) = send_subcoordinator_info(peer, addr.port(), prev).await {
                warn!(%e, peer = %peer.name, "failed to deliver SUBCOORDINATOR_INFO");
            }
        }

        let mut tables = self.tables.lock().await;
        if let Some(slot) = tables.slots.get_mut(slot_index) {
            slot.strand.extend(batch);
            slot.buffer = 0;
        }
        if slot_index + 1 == tables.slots.len() {
            tables.all_strands_have_peers = true;
        }
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

async fn register_peer_with_subcoordinator(subcoordinator_addr: SocketAddr, peer: &PeerRecord) -> Result<()> {
    let payload = json!({
        "type": "register",
        "name": peer.name,
        "port": peer.data_port,
        "ctrl_port": peer.ctrl_port,
        "ip": peer.ip.to_string(),
    });
    tcp_roundtrip(subcoordinator_addr, &payload).await?;
    Ok(())
}

async fn send_subcoordinator_info(
    peer: &PeerRecord,
    subcoordinator_port: u16,
    prev_peer: Option<crate::wire::control::PeerNameAndPort>,
) -> Result<()> {
    let payload = json!({
        "cmd": "SUBCOORDINATOR_INFO",
        "subcoordinator_port": subcoordinator_port,
        "prev_peer": prev_peer,
    });
    tcp_roundtrip(peer.ctrl_addr(), &payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admission_saturates_before_all_strands_seeded() {
        let coordinator = Coordinator::new(3);
        {
            let mut tables = coordinator.tables.lock().await;
            tables.slots.push(SubcoordSlot {
                addr: "127.0.0.1:1".parse().unwrap(),
                buffer: 3,
                queue: Vec::new(),
                strand: Vec::new(),
            });
        }

        let make_peer = |n: u16| PeerRecord::new(format!("p{n}"), "127.0.0.1".parse().unwrap(), 10_000 + n);

        for i in 0..3 {
            let reply = coordinator.register_peer(make_peer(i)).await;
            assert_eq!(reply["message"], "queued");
        }

        // Give the spawned dispatch task a chance to run and drain the queue.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tables = coordinator.tables.lock().await;
        // Dispatch will have failed (no real subcoordinator listening) and
        // re-queued the batch, so the queue should be non-empty again with
        // buffer restored rather than silently dropped.
        assert_eq!(tables.slots[0].queue.len() + tables.slots[0].strand.len(), 3);
    }

    #[tokio::test]
    async fn fourth_peer_is_rejected_before_any_strand_is_seeded() {
        let coordinator = Coordinator::new(3);
        {
            let mut tables = coordinator.tables.lock().await;
            tables.slots.push(SubcoordSlot {
                addr: "127.0.0.1:1".parse().unwrap(),
                buffer: 0,
                queue: vec![
                    PeerRecord::new("a", "127.0.0.1".parse().unwrap(), 1),
                    PeerRecord::new("b", "127.0.0.1".parse().unwrap(), 2),
                    PeerRecord::new("c", "127.0.0.1".parse().unwrap(), 3),
                ],
                strand: Vec::new(),
            });
        }

        let reply = coordinator
            .register_peer(PeerRecord::new("d", "127.0.0.1".parse().unwrap(), 4))
            .await;
        assert_eq!(reply["message"], "full");
    }
}
