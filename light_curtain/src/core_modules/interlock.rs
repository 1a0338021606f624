// THEORY:
// The `Interlock` is the single value the outside world reads to decide whether
// the machine may move. Two writers touch it from different threads: the frame
// path publishes the verdict of every cycle, and the device watcher forces it
// unsafe when the camera disappears.
//
// The value is one `AtomicU8` with three levels. Device loss is a latch: once
// written, frame-path publications are refused until a new session re-arms it.
// A reader therefore never observes "safe" after the camera is gone, whatever
// order the two writers run in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const UNSAFE: u8 = 0;
const SAFE: u8 = 1;
const DEVICE_LOST: u8 = 2;

/// A shared, fail-safe safety flag. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct Interlock {
    level: Arc<AtomicU8>,
}

impl Default for Interlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Interlock {
    /// A new interlock starts unsafe.
    pub fn new() -> Self {
        Self {
            level: Arc::new(AtomicU8::new(UNSAFE)),
        }
    }

    pub fn is_safe(&self) -> bool {
        self.level.load(Ordering::Acquire) == SAFE
    }

    pub fn is_device_lost(&self) -> bool {
        self.level.load(Ordering::Acquire) == DEVICE_LOST
    }

    /// Publishes a frame-path verdict. Returns false when the latch refused it.
    pub fn publish(&self, safe: bool) -> bool {
        let value = if safe { SAFE } else { UNSAFE };
        self.level
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != DEVICE_LOST).then_some(value)
            })
            .is_ok()
    }

    /// Latches unsafe until `rearm`.
    pub fn force_unsafe(&self) {
        self.level.store(DEVICE_LOST, Ordering::Release);
    }

    /// Clears the latch, leaving the flag unsafe.
    pub fn rearm(&self) {
        self.level.store(UNSAFE, Ordering::Release);
    }
}
