//! The video decoder is an external collaborator (`spec.md` §1); this module
//! is the boundary the Subcoordinator's streaming loop talks to instead of a
//! real mp4 demuxer.

use std::path::{Path, PathBuf};

use crate::error::{Result, StrandError};

/// One undecoded RGB8 frame read from the source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

pub trait FrameSource: Send {
    /// Count frames by scanning the source once (`spec.md` §4.2 step 1).
    fn frame_count(&mut self) -> Result<usize>;

    fn read_frame(&mut self, index: usize) -> Result<RawFrame>;

    fn fps(&self) -> f64;
}

/// Reads `frame_NNNNNN.{png,jpg}` files from a directory via `image::open`,
/// standing in for real video-container demuxing.
pub struct DirectoryFrameSource {
    dir: PathBuf,
    fps: f64,
    files: Vec<PathBuf>,
}

impl DirectoryFrameSource {
    pub fn new(dir: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            dir: dir.into(),
            fps,
            files: Vec::new(),
        }
    }

    fn scan(&mut self) -> Result<()> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("png") | Some("jpg") | Some("jpeg")
                )
            })
            .collect();
        files.sort();
        self.files = files;
        Ok(())
    }
}

impl FrameSource for DirectoryFrameSource {
    fn frame_count(&mut self) -> Result<usize> {
        if self.files.is_empty() {
            self.scan()?;
        }
        Ok(self.files.len())
    }

    fn read_frame(&mut self, index: usize) -> Result<RawFrame> {
        if self.files.is_empty() {
            self.scan()?;
        }
        let path: &Path = self
            .files
            .get(index)
            .ok_or_else(|| StrandError::Codec(format!("no frame at index {index}")))?;
        let image = image::open(path)
            .map_err(|e| StrandError::Codec(format!("failed to read {path:?}: {e}")))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Ok(RawFrame {
            width,
            height,
            rgb: image.into_raw(),
        })
    }

    fn fps(&self) -> f64 {
        self.fps
    }
}

/// Procedurally generates `count` solid-color-gradient frames in memory, so
/// the crate and its test/demo harness are runnable without real video
/// assets.
pub struct SyntheticFrameSource {
    count: usize,
    width: u32,
    height: u32,
    fps: f64,
}

impl SyntheticFrameSource {
    pub fn new(count: usize, width: u32, height: u32, fps: f64) -> Self {
        Self {
            count,
            width,
            height,
            fps,
        }
    }
}

impl FrameSource for SyntheticFrameSource {
    fn frame_count(&mut self) -> Result<usize> {
        Ok(self.count)
    }

    fn read_frame(&mut self, index: usize) -> Result<RawFrame> {
        if index >= self.count {
            return Err(StrandError::Codec(format!("no frame at index {index}")));
        }
        let shift = index as u8;
        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                rgb.push(x.wrapping_add(shift as u32) as u8);
                rgb.push(y as u8);
                rgb.push(shift);
            }
        }
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            rgb,
        })
    }

    fn fps(&self) -> f64 {
        self.fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_reports_count_and_reads_distinct_frames() {
        let mut src = SyntheticFrameSource::new(5, 8, 8, 30.0);
        assert_eq!(src.frame_count().unwrap(), 5);
        let f0 = src.read_frame(0).unwrap();
        let f1 = src.read_frame(1).unwrap();
        assert_eq!(f0.width, 8);
        assert_ne!(f0.rgb, f1.rgb);
    }

    #[test]
    fn synthetic_source_rejects_out_of_range_index() {
        let mut src = SyntheticFrameSource::new(2, 4, 4, 30.0);
        assert!(src.read_frame(2).is_err());
    }
}
