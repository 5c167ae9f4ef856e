use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Single-slot, last-value-wins buffer for the most recent frame.
///
/// The capture loop replaces the slot on every frame (dropping the previous
/// one); readers take a private copy. The lock is held only for the swap or
/// the copy, never across I/O.
pub struct FrameSlot {
    slot: Mutex<Option<Frame>>,
    stats: FrameSlotStats,
}

/// Statistics for slot activity
#[derive(Debug, Default)]
pub struct FrameSlotStats {
    /// Total frames published into the slot
    pub frames_published: AtomicU64,
    /// Total copies handed out to readers
    pub frames_read: AtomicU64,
    /// Frames replaced before anybody read them
    pub frames_dropped: AtomicU64,
}

/// Snapshot of slot statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlotStatsSnapshot {
    pub frames_published: u64,
    pub frames_read: u64,
    pub frames_dropped: u64,
}

impl FrameSlotStats {
    pub fn snapshot(&self) -> FrameSlotStatsSnapshot {
        FrameSlotStatsSnapshot {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            stats: FrameSlotStats::default(),
        }
    }

    /// Replace the current frame; the previous one is released
    pub fn publish(&self, frame: Frame) {
        self.publish_if(frame, || true);
    }

    /// Publish only if `live()` still holds with the slot locked. A writer
    /// told to stop before `clear()` cannot refill the slot afterwards.
    pub fn publish_if(&self, frame: Frame, live: impl FnOnce() -> bool) -> bool {
        let previous = {
            let mut slot = self.slot.lock();
            if !live() {
                trace!("Discarding frame {} from a stopped writer", frame.id);
                return false;
            }
            trace!("Publishing frame {} to slot", frame.id);
            slot.replace(frame)
        };
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        if previous.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        // `previous` is dropped here, outside the lock
        true
    }

    /// Private copy of the latest frame, or `None` if nothing was published
    pub fn latest(&self) -> Option<Frame> {
        let copy = self.slot.lock().clone();
        if copy.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        copy
    }

    /// Release the held frame
    pub fn clear(&self) {
        let previous = self.slot.lock().take();
        drop(previous);
    }

    pub fn has_frame(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn stats(&self) -> FrameSlotStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
