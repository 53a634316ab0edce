use std::sync::{Mutex, MutexGuard};

/// Receives encoded still frames from a camera pipeline.
///
/// Producers call `push_frame` once per frame and never wait on consumers;
/// a sink keeps only the newest frame.
pub trait FrameSink: Send + Sync {
    fn push_frame(&self, jpeg: &[u8]);
}

/// Single-slot holder for the most recent JPEG frame.
///
/// Readers and the writer share one lock that is held only for the slot swap
/// or the copy out, never across I/O. Every read returns a buffer owned by the
/// caller, so a later `set` can never be observed half-written.
#[derive(Debug, Default)]
pub struct FrameCache {
    slot: Mutex<Option<Vec<u8>>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame with a copy of `bytes`.
    pub fn set(&self, bytes: &[u8]) {
        let frame = bytes.to_vec();
        *self.lock() = Some(frame);
    }

    /// Copy of the current frame, or `None` if nothing has been set.
    pub fn get(&self) -> Option<Vec<u8>> {
        self.lock().clone()
    }

    pub fn has_frame(&self) -> bool {
        self.lock().is_some()
    }

    /// Drop the current frame so that `get` returns `None` until the next `set`.
    pub fn clear(&self) {
        self.lock().take();
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        // The slot is always a complete value, so a panic elsewhere cannot leave it torn.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameSink for FrameCache {
    fn push_frame(&self, jpeg: &[u8]) {
        self.set(jpeg);
    }
}
