//! Shared diagnostics counters for a capture session.
//!
//! Every recoverable fault increments one of these counters so an operator
//! can distinguish a healthy session from one quietly dropping data. The
//! counters are lock-free atomics shared via `Arc` across all workers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-session counters, incremented by the workers and readable at any time.
#[derive(Debug, Default)]
pub struct SessionCounters {
    /// Malformed datagrams dropped by the receiver.
    pub protocol_errors: AtomicU64,
    /// Contributions displaced from a saturated receive queue.
    pub queue_drops: AtomicU64,
    /// Contributions discarded for arriving behind the retained window.
    pub late_drops: AtomicU64,
    /// Frames force-flushed before all engines contributed.
    pub incomplete_flushes: AtomicU64,
    /// Archive records lost to write failures.
    pub storage_errors: AtomicU64,
    /// Frames flushed by the assembler (complete or not).
    pub frames_assembled: AtomicU64,
    /// Frame records durably written to the archive container.
    pub frames_archived: AtomicU64,
    /// Aggregate packets sent to the display endpoint.
    pub packets_published: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            late_drops: self.late_drops.load(Ordering::Relaxed),
            incomplete_flushes: self.incomplete_flushes.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            frames_assembled: self.frames_assembled.load(Ordering::Relaxed),
            frames_archived: self.frames_archived.load(Ordering::Relaxed),
            packets_published: self.packets_published.load(Ordering::Relaxed),
        }
    }
}

/// Increment helper keeping call sites terse.
#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of [`SessionCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub protocol_errors: u64,
    pub queue_drops: u64,
    pub late_drops: u64,
    pub incomplete_flushes: u64,
    pub storage_errors: u64,
    pub frames_assembled: u64,
    pub frames_archived: u64,
    pub packets_published: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = SessionCounters::new();
        let snap = counters.snapshot();
        assert_eq!(snap.protocol_errors, 0);
        assert_eq!(snap.frames_archived, 0);
    }

    #[test]
    fn test_bump_and_snapshot() {
        let counters = SessionCounters::new();

        bump(&counters.protocol_errors);
        bump(&counters.protocol_errors);
        bump(&counters.storage_errors);

        let snap = counters.snapshot();
        assert_eq!(snap.protocol_errors, 2);
        assert_eq!(snap.storage_errors, 1);
        assert_eq!(snap.queue_drops, 0);
    }

    #[test]
    fn test_shared_across_clones() {
        let counters = Arc::new(SessionCounters::new());
        let other = counters.clone();

        bump(&counters.frames_assembled);
        assert_eq!(other.snapshot().frames_assembled, 1);
    }
}
