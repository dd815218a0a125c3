//! Structured lifecycle records.
//!
//! Public entries emit typed events (symbol, served path, pointer, size,
//! arena) into a bounded ring when tracing is on. Off by default; the
//! harness enables it to attribute allocations to engine tiers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Upper bound on retained events; older records are dropped first.
const TRACE_CAPACITY: usize = 4096;

/// One allocator lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Monotonic event id.
    pub seq: u64,
    /// API symbol (`malloc`, `free`, `realloc`, `memalign`, `trim`).
    pub symbol: &'static str,
    /// Engine tier that served or absorbed the operation.
    pub path: &'static str,
    /// User pointer involved, when any.
    pub ptr: Option<usize>,
    /// Request or chunk size involved, when any.
    pub size: Option<usize>,
    /// Arena index, when the operation touched one.
    pub arena: Option<usize>,
}

pub(crate) struct TraceRing {
    enabled: AtomicBool,
    seq: AtomicU64,
    events: Mutex<VecDeque<TraceEvent>>,
}

impl TraceRing {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            seq: AtomicU64::new(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn record(
        &self,
        symbol: &'static str,
        path: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        arena: Option<usize>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut events = self.events.lock();
        if events.len() == TRACE_CAPACITY {
            events.pop_front();
        }
        events.push_back(TraceEvent {
            seq,
            symbol,
            path,
            ptr,
            size,
            arena,
        });
    }

    /// Removes and returns every retained event.
    pub fn drain(&self) -> Vec<TraceEvent> {
        self.events.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_ring_records_nothing() {
        let ring = TraceRing::new(false);
        ring.record("malloc", "tcache", Some(0x1000), Some(24), None);
        assert!(ring.drain().is_empty());
    }

    #[test]
    fn events_carry_monotonic_ids() {
        let ring = TraceRing::new(true);
        ring.record("malloc", "fastbin", Some(0x1000), Some(24), Some(0));
        ring.record("free", "tcache", Some(0x1000), None, None);
        let events = ring.drain();
        assert_eq!(events.len(), 2);
        assert!(events[0].seq < events[1].seq);
        assert_eq!(events[0].path, "fastbin");
        assert_eq!(events[1].symbol, "free");
    }

    #[test]
    fn ring_is_bounded() {
        let ring = TraceRing::new(true);
        for i in 0..TRACE_CAPACITY + 10 {
            ring.record("malloc", "top", Some(i), None, None);
        }
        let events = ring.drain();
        assert_eq!(events.len(), TRACE_CAPACITY);
        assert_eq!(events[0].ptr, Some(10));
    }
}
