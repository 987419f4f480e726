//! The on-screen renderer and status overlay are external collaborators
//! (`spec.md` §1); this is the boundary the playback loop calls into.

use tracing::debug;

use crate::codec::DecodedFrame;

pub trait FrameRenderer: Send {
    fn show(&mut self, frame: &DecodedFrame, index: usize, total: usize, paused: bool);
}

/// Logs one line per displayed frame instead of drawing pixels anywhere.
#[derive(Default)]
pub struct ConsoleRenderer;

impl FrameRenderer for ConsoleRenderer {
    fn show(&mut self, frame: &DecodedFrame, index: usize, total: usize, paused: bool) {
        debug!(
            width = frame.width,
            height = frame.height,
            index,
            total,
            paused,
            "displaying frame"
        );
    }
}

/// Discards every frame; used by tests that only care about `all_frames`
/// bookkeeping, not display.
#[derive(Default)]
pub struct NullRenderer;

impl FrameRenderer for NullRenderer {
    fn show(&mut self, _frame: &DecodedFrame, _index: usize, _total: usize, _paused: bool) {}
}
