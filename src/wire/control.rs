//! TCP/JSON control-channel messages.
//!
//! Several of these families mix two independently-named discriminant fields
//! on one JSON object (Coordinator registration uses top-level `action` plus
//! a nested `type`), so none of them is a single `#[serde(tag = "...")]`
//! enum. Instead each `parse` function reads into a `serde_json::Value`
//! first, inspects the discriminant field(s), then deserializes into the
//! matched variant's struct — the tag extraction is manual, the match at the
//! call site is an exhaustive Rust `match`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StrandError};
use crate::wire::PeerRecord;

// ---------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CoordinatorRequest {
    RegisterSubcoordinator { port: u16 },
    RegisterPeer(PeerRecord),
    StatusDone { port: u16 },
}

impl CoordinatorRequest {
    pub fn parse(raw: &Value) -> Result<Self> {
        let action = raw
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| StrandError::Protocol("missing 'action'".into()))?;

        match action {
            "register" => {
                let kind = raw
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StrandError::Protocol("missing 'type'".into()))?;
                match kind {
                    "subcoordinator" => {
                        let port = raw
                            .get("port")
                            .and_then(Value::as_u64)
                            .ok_or_else(|| StrandError::Protocol("missing 'port'".into()))?
                            as u16;
                        Ok(CoordinatorRequest::RegisterSubcoordinator { port })
                    }
                    "peer" => {
                        let name = field_str(raw, "name")?;
                        let port = field_u16(raw, "port")?;
                        let ctrl_port = field_u16(raw, "ctrl_port")?;
                        let ip = field_str(raw, "ip")?
                            .parse()
                            .map_err(|_| StrandError::Protocol("bad 'ip'".into()))?;
                        Ok(CoordinatorRequest::RegisterPeer(PeerRecord {
                            name,
                            ip,
                            data_port: port,
                            ctrl_port,
                        }))
                    }
                    other => Err(StrandError::Protocol(format!("unknown register type '{other}'"))),
                }
            }
            "status" => {
                let status = raw
                    .get("status")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StrandError::Protocol("missing 'status'".into()))?;
                if status != "done" {
                    return Err(StrandError::Protocol(format!("unknown status '{status}'")));
                }
                let port = field_u16(raw, "port")?;
                Ok(CoordinatorRequest::StatusDone { port })
            }
            other => Err(StrandError::Protocol(format!("unknown action '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------
// Subcoordinator
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SubcoordinatorRequest {
    Register(PeerRecord),
    DeliveryDone,
    Lookup { name: String, requester: String },
    List { requester: String },
    RequestMissingFrames {
        peer_name: String,
        peer_port: u16,
        video_number: u32,
        missing_frames: Vec<u32>,
    },
}

impl SubcoordinatorRequest {
    pub fn parse(raw: &Value) -> Result<Self> {
        let ty = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| StrandError::Protocol("missing 'type'".into()))?;

        match ty {
            "register" => {
                let name = field_str(raw, "name")?;
                let port = field_u16(raw, "port")?;
                let ctrl_port = field_u16(raw, "ctrl_port")?;
                let ip = field_str(raw, "ip")?
                    .parse()
                    .map_err(|_| StrandError::Protocol("bad 'ip'".into()))?;
                Ok(SubcoordinatorRequest::Register(PeerRecord {
                    name,
                    ip,
                    data_port: port,
                    ctrl_port,
                }))
            }
            "deliveryDone" => Ok(SubcoordinatorRequest::DeliveryDone),
            "lookup" => Ok(SubcoordinatorRequest::Lookup {
                name: field_str(raw, "name")?,
                requester: field_str(raw, "requester")?,
            }),
            "list" => Ok(SubcoordinatorRequest::List {
                requester: field_str(raw, "requester")?,
            }),
            "requestMissingFrames" => {
                let missing_frames = raw
                    .get("missing_frames")
                    .and_then(Value::as_array)
                    .ok_or_else(|| StrandError::Protocol("missing 'missing_frames'".into()))?
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|v| v as u32)
                    .collect();
                Ok(SubcoordinatorRequest::RequestMissingFrames {
                    peer_name: field_str(raw, "peer_name")?,
                    peer_port: field_u16(raw, "peer_port")?,
                    video_number: field_u32(raw, "video_number")?,
                    missing_frames,
                })
            }
            other => Err(StrandError::Protocol(format!("unknown type '{other}'"))),
        }
    }
}

/// `register` reply: the previous peer in the strand, or `{}` if this peer
/// is the first (head).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegisterReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<PeerRecord>,
}

// ---------------------------------------------------------------------
// Peer control port
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PeerControlMessage {
    UpdateNext(PeerRecord),
    SubcoordinatorInfo {
        subcoordinator_port: u16,
        prev_peer: Option<PeerNameAndPort>,
    },
    Ack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNameAndPort {
    pub name: String,
    pub port: u16,
}

impl PeerControlMessage {
    pub fn parse(raw: &Value) -> Result<Self> {
        let cmd = raw
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| StrandError::Protocol("missing 'cmd'".into()))?;

        match cmd {
            "UPDATE_NEXT" => {
                let name = field_str(raw, "name")?;
                let port = field_u16(raw, "port")?;
                let ctrl_port = field_u16(raw, "ctrl_port")?;
                let ip = raw
                    .get("ip")
                    .and_then(Value::as_str)
                    .unwrap_or("127.0.0.1")
                    .parse()
                    .map_err(|_| StrandError::Protocol("bad 'ip'".into()))?;
                Ok(PeerControlMessage::UpdateNext(PeerRecord {
                    name,
                    ip,
                    data_port: port,
                    ctrl_port,
                }))
            }
            "SUBCOORDINATOR_INFO" => {
                let subcoordinator_port = field_u16(raw, "subcoordinator_port")?;
                let prev_peer = match raw.get("prev_peer") {
                    Some(v) if !v.is_null() => {
                        Some(serde_json::from_value(v.clone())?)
                    }
                    _ => None,
                };
                Ok(PeerControlMessage::SubcoordinatorInfo {
                    subcoordinator_port,
                    prev_peer,
                })
            }
            "ack" => Ok(PeerControlMessage::Ack),
            other => Err(StrandError::Protocol(format!("unknown cmd '{other}'"))),
        }
    }
}

pub const OK_REPLY: &str = "OK";

// ---------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------

fn field_str(raw: &Value, key: &str) -> Result<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| StrandError::Protocol(format!("missing '{key}'")))
}

fn field_u16(raw: &Value, key: &str) -> Result<u16> {
    raw.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as u16)
        .ok_or_else(|| StrandError::Protocol(format!("missing '{key}'")))
}

fn field_u32(raw: &Value, key: &str) -> Result<u32> {
    raw.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| StrandError::Protocol(format!("missing '{key}'")))
}
