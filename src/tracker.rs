//! Memory and disk accounting hooks.
//!
//! Trackers form a tree: bytes consumed by a child are also charged to its
//! parent, so a statement-level tracker sees the sum of its operators.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

#[derive(Debug)]
pub struct MemTracker {
    label: String,
    bytes_consumed: AtomicI64,
    max_consumed: AtomicI64,
    parent: Mutex<Option<Arc<MemTracker>>>,
}

/// Disk usage is accounted the same way; the join itself never spills.
pub type DiskTracker = MemTracker;

impl MemTracker {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            bytes_consumed: AtomicI64::new(0),
            max_consumed: AtomicI64::new(0),
            parent: Mutex::new(None),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Adds `bytes` (negative to release) to this tracker and its ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes == 0 {
            return;
        }
        let now = self.bytes_consumed.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.max_consumed.fetch_max(now, Ordering::Relaxed);
        if let Some(parent) = self.parent.lock().as_ref() {
            parent.consume(bytes);
        }
    }

    pub fn bytes_consumed(&self) -> i64 {
        self.bytes_consumed.load(Ordering::Relaxed)
    }

    pub fn max_consumed(&self) -> i64 {
        self.max_consumed.load(Ordering::Relaxed)
    }

    /// Releases everything this tracker holds, including from its parent.
    pub fn reset(&self) {
        let held = self.bytes_consumed.load(Ordering::Relaxed);
        self.consume(-held);
        self.max_consumed.store(0, Ordering::Relaxed);
    }

    /// Re-parents the tracker, moving its current consumption along.
    pub fn attach_to(&self, parent: &Arc<MemTracker>) {
        let held = self.bytes_consumed();
        let mut slot = self.parent.lock();
        if let Some(old) = slot.take() {
            old.consume(-held);
        }
        parent.consume(held);
        *slot = Some(Arc::clone(parent));
    }

    pub fn detach(&self) {
        let held = self.bytes_consumed();
        if let Some(old) = self.parent.lock().take() {
            old.consume(-held);
        }
    }
}
