#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use idmap_contracts::MonotonicTimeNs;

/// Server-side source of `created_at` values. Successive calls never go backwards.
pub trait MappingClock {
    fn now(&self) -> MonotonicTimeNs;

    /// Every later `now()` is strictly greater than `floor`. Used to continue after the
    /// newest persisted record even when the wall clock has stepped back.
    fn advance_past(&self, floor: MonotonicTimeNs);
}

fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    if nanos > u64::MAX as u128 {
        u64::MAX
    } else {
        nanos as u64
    }
}

/// Wall clock that is bumped by 1ns whenever it would repeat or step back.
#[derive(Debug, Default)]
pub struct SystemMappingClock {
    last: AtomicU64,
}

impl SystemMappingClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingClock for SystemMappingClock {
    fn now(&self) -> MonotonicTimeNs {
        let wall = system_time_now_ns().max(1);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return MonotonicTimeNs(next),
                Err(current) => prev = current,
            }
        }
    }

    fn advance_past(&self, floor: MonotonicTimeNs) {
        self.last.fetch_max(floor.0, Ordering::AcqRel);
    }
}

/// Deterministic clock: starts at `start` and advances by `step` per call.
#[derive(Debug)]
pub struct ManualMappingClock {
    next: AtomicU64,
    step: u64,
}

impl ManualMappingClock {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
            step: step.max(1),
        }
    }
}

impl MappingClock for ManualMappingClock {
    fn now(&self) -> MonotonicTimeNs {
        MonotonicTimeNs(self.next.fetch_add(self.step, Ordering::AcqRel))
    }

    fn advance_past(&self, floor: MonotonicTimeNs) {
        self.next
            .fetch_max(floor.0.saturating_add(1), Ordering::AcqRel);
    }
}
