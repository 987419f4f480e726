//! UDP/JSON data-plane messages.
//!
//! All three variants share one `"type"` discriminant, so unlike the
//! control messages this one is a clean `#[serde(tag = "type")]` enum.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataMessage {
    VideoFrame(VideoFrameChunk),
    VideoEnd {
        origin: String,
        video_number: u32,
        frame_num: u32,
    },
    Data {
        origin: String,
        seq: u64,
        sender: String,
        msg: String,
    },
}

/// One UDP-sized slice of one JPEG+deflate-compressed frame.
///
/// `data` is base64-encoded raw bytes so the whole envelope stays one JSON
/// object, per the wire contract in `spec.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFrameChunk {
    pub origin: String,
    pub video_number: u32,
    pub frame_num: u32,
    pub chunk_id: u16,
    pub total_chunks: u16,
    pub total_frames_incoming: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// `MAX_CHUNK_SIZE` bytes of raw (pre-base64) chunk payload.
pub const MAX_CHUNK_SIZE: usize = 5000;
/// Upper bound on one UDP datagram once JSON+base64 overhead is added.
pub const MAX_DGRAM: usize = 60_000;

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
