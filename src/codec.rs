//! Frame encoding: JPEG (via `image`) + deflate-family compression (via
//! `flate2`) + chunking into `MAX_CHUNK_SIZE`-byte slices.
//!
//! The video decoder/encoder library itself is out of scope (`spec.md` §1);
//! this module only wraps the generic, off-the-shelf compression that every
//! Subcoordinator applies on top of whatever JPEG bytes a [`FrameSource`]
//! hands it.
//!
//! [`FrameSource`]: crate::frame_source::FrameSource

use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use image::{ImageBuffer, Rgb};
use std::io::Read;

use crate::error::{Result, StrandError};
use crate::wire::data::MAX_CHUNK_SIZE;

/// A decoded, displayable video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// JPEG-encode an RGB8 buffer at the given quality (0-100).
pub fn encode_jpeg(width: u32, height: u32, rgb: &[u8], quality: u8) -> Result<Vec<u8>> {
    let image: ImageBuffer<Rgb<u8>, _> = ImageBuffer::from_raw(width, height, rgb.to_vec())
        .ok_or_else(|| StrandError::Codec("frame buffer size mismatch".into()))?;

    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(&image)
        .map_err(|e| StrandError::Codec(format!("jpeg encode failed: {e}")))?;
    Ok(out)
}

/// Decode JPEG bytes back into an RGB8 buffer.
pub fn decode_jpeg(jpeg: &[u8]) -> Result<DecodedFrame> {
    let image = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| StrandError::Codec(format!("jpeg decode failed: {e}")))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Ok(DecodedFrame {
        width,
        height,
        rgb: image.into_raw(),
    })
}

/// Wrap JPEG bytes in the generic deflate-family container the wire
/// contract expects ("wrap in a generic container; compress with a
/// deflate-family codec", `spec.md` §4.2 step 2).
pub fn compress(jpeg: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(jpeg, Compression::default());
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .expect("in-memory zlib encode cannot fail");
    out
}

pub fn decompress(container: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(container);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StrandError::Codec(format!("deflate decompress failed: {e}")))?;
    Ok(out)
}

/// Split compressed frame bytes into `ceil(len / MAX_CHUNK_SIZE)` chunks.
pub fn split_into_chunks(compressed: &[u8]) -> Vec<&[u8]> {
    if compressed.is_empty() {
        return vec![&compressed[0..0]];
    }
    compressed.chunks(MAX_CHUNK_SIZE).collect()
}

/// Reassemble chunks (already ordered by `chunk_id`) back into one buffer.
pub fn join_chunks(chunks: &[Vec<u8>]) -> Vec<u8> {
    chunks.concat()
}

pub fn total_chunks_for(len: usize) -> u16 {
    if len == 0 {
        return 1;
    }
    ((len + MAX_CHUNK_SIZE - 1) / MAX_CHUNK_SIZE) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(w: u32, h: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                buf.push((x % 256) as u8);
                buf.push((y % 256) as u8);
                buf.push(((x + y) % 256) as u8);
            }
        }
        buf
    }

    #[test]
    fn jpeg_round_trip_preserves_dimensions() {
        let raw = gradient_frame(64, 48);
        let jpeg = encode_jpeg(64, 48, &raw, 40).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.width, 64);
        assert_eq!(decoded.height, 48);
        assert_eq!(decoded.rgb.len(), raw.len());
    }

    #[test]
    fn compress_round_trip() {
        let raw = gradient_frame(32, 32);
        let jpeg = encode_jpeg(32, 32, &raw, 40).unwrap();
        let compressed = compress(&jpeg);
        let decompressed = decompress(&compressed).unwrap();
        assert_eq!(decompressed, jpeg);
    }

    #[test]
    fn chunking_round_trip() {
        let data = vec![7u8; MAX_CHUNK_SIZE * 3 + 17];
        let chunks = split_into_chunks(&data);
        assert_eq!(chunks.len(), 4);
        assert_eq!(total_chunks_for(data.len()), 4);
        let owned: Vec<Vec<u8>> = chunks.into_iter().map(|c| c.to_vec()).collect();
        assert_eq!(join_chunks(&owned), data);
    }

    #[test]
    fn empty_frame_yields_single_empty_chunk() {
        let chunks = split_into_chunks(&[]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(total_chunks_for(0), 1);
    }
}
