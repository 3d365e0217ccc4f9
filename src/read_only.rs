//! Sticky, process-lifetime read-only notifier (spec §5, §7).
//!
//! Multi-producer: any zone thread may call `enter`. Shared via `Arc` so
//! every allocator and the depot can query the same flag with a relaxed
//! atomic load.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct ReadOnlyNotifier {
    read_only: AtomicBool,
}

impl ReadOnlyNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            read_only: AtomicBool::new(false),
        })
    }

    /// Enter read-only mode. Idempotent; logs only on the transition.
    pub fn enter(&self) {
        if !self.read_only.swap(true, Ordering::SeqCst) {
            log::warn!("depot: entering read-only mode");
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }
}
