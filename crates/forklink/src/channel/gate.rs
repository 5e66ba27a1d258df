//! Countdown barrier that opens exactly once.
//!
//! Participants arrive from any thread in any order. The arrival that takes the
//! count from one to zero is told it opened the gate, and it alone runs the
//! follow-up work. Arrivals after that are ignored.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct ReadinessGate {
    remaining: AtomicUsize,
}

impl ReadinessGate {
    pub fn new(participants: usize) -> Self {
        assert!(participants > 0, "a gate needs at least one participant");
        Self {
            remaining: AtomicUsize::new(participants),
        }
    }

    /// Records one arrival. Returns `true` for exactly one caller: the one whose
    /// arrival brought the count to zero.
    pub fn arrive(&self) -> bool {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => true,
            Ok(_) => false,
            Err(_) => {
                tracing::warn!("Readiness gate already open, ignoring extra arrival");
                false
            }
        }
    }

    /// Like [`arrive`](Self::arrive), running `on_open` when this arrival opened the gate.
    pub fn arrive_then(&self, on_open: impl FnOnce()) -> bool {
        let opened = self.arrive();
        if opened {
            on_open();
        }
        opened
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }
}
