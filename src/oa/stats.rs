use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome kinds counted by the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DrainEvent {
    Sample = 0,
    Periodic = 1,
    ReportLost = 2,
    BufferLost = 3,
    Retry = 4,
    Pair = 5,
    SanityFailure = 6,
}

const DRAIN_EVENT_COUNT: usize = 7;

impl DrainEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sample => "sample",
            Self::Periodic => "periodic",
            Self::ReportLost => "report_lost",
            Self::BufferLost => "buffer_lost",
            Self::Retry => "retry",
            Self::Pair => "pair",
            Self::SanityFailure => "sanity_failure",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Sample),
            1 => Some(Self::Periodic),
            2 => Some(Self::ReportLost),
            3 => Some(Self::BufferLost),
            4 => Some(Self::Retry),
            5 => Some(Self::Pair),
            6 => Some(Self::SanityFailure),
            _ => None,
        }
    }
}

impl fmt::Display for DrainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free per-DrainEvent counters.
///
/// `snapshot()` atomically reads and resets all counters, so a reporter
/// can poll it while the drain loop keeps counting. `total()` is never
/// reset and counts from stream open.
pub struct DrainStats {
    counts: [AtomicU64; DRAIN_EVENT_COUNT],
    totals: [AtomicU64; DRAIN_EVENT_COUNT],
}

impl DrainStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            totals: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, e: DrainEvent) {
        self.record_n(e, 1);
    }

    pub fn record_n(&self, e: DrainEvent, n: u64) {
        if let Some(counter) = self.counts.get(e as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
        if let Some(total) = self.totals.get(e as usize) {
            total.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Count since the last snapshot, without resetting.
    pub fn get(&self, e: DrainEvent) -> u64 {
        self.counts
            .get(e as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Count since the stats were created, unaffected by snapshots.
    pub fn total(&self, e: DrainEvent) -> u64 {
        self.totals
            .get(e as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(DrainEvent, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(e) = DrainEvent::from_u8(i as u8) {
                    result.push((e, v));
                }
            }
        }

        result
    }
}

impl Default for DrainStats {
    fn default() -> Self {
        Self::new()
    }
}
