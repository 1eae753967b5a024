//! Counter deltas between report pairs.
//!
//! All delta arithmetic goes through [`wraparound_delta`]. The accumulator
//! layout is positional: timestamp, ticks, 40-bit counters, 64-bit
//! counters, then the 32-bit A, B and C groups.

use thiserror::Error;
use tracing::debug;

use super::devinfo::DeviceInfo;
use super::format::{undefined_a_counters, FormatDescriptor};
use super::report::{ReportView, TICK_WIDTH};

/// `t1 - t0` modulo `2^width`. Handles a single wrap of the counter.
///
/// # Panics
/// If `width > 64`.
#[inline]
pub fn wraparound_delta(t1: u64, t0: u64, width: u32) -> u64 {
    assert!(width <= 64, "delta width {width} exceeds 64 bits");
    if width == 64 {
        return t1.wrapping_sub(t0);
    }
    t1.wrapping_sub(t0) & ((1u64 << width) - 1)
}

/// Timestamp delta between two reports for a device's timestamp width.
///
/// A 32-bit report header only carries the low 32 timestamp bits, so the
/// width is capped there for such formats.
pub fn timestamp_delta(a: &ReportView<'_>, b: &ReportView<'_>, timestamp_width: u32) -> u64 {
    let width = if a.format().report_hdr_64bit {
        timestamp_width
    } else {
        timestamp_width.min(32)
    };
    wraparound_delta(b.timestamp(), a.timestamp(), width)
}

/// GPU tick delta between two reports.
pub fn tick_delta(a: &ReportView<'_>, b: &ReportView<'_>) -> u64 {
    wraparound_delta(b.tick_count(), a.tick_count(), TICK_WIDTH)
}

fn delta_40(a: &ReportView<'_>, b: &ReportView<'_>, i: usize) -> u64 {
    wraparound_delta(b.counter_40bit(i), a.counter_40bit(i), 40)
}

fn delta_64(a: &ReportView<'_>, b: &ReportView<'_>, i: usize) -> u64 {
    wraparound_delta(b.counter_64bit(i), a.counter_64bit(i), 64)
}

fn delta_32(v0: u32, v1: u32) -> u64 {
    wraparound_delta(u64::from(v1), u64::from(v0), 32)
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Running sums of per-slot deltas, bound to one format for its lifetime.
#[derive(Debug, Clone)]
pub struct Accumulator {
    format: FormatDescriptor,
    timestamp_width: u32,
    deltas: Vec<u64>,
    pairs: u64,
}

impl Accumulator {
    pub fn new(format: &FormatDescriptor, timestamp_width: u32) -> Self {
        Self {
            format: *format,
            timestamp_width,
            deltas: vec![0; format.accumulator_len()],
            pairs: 0,
        }
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub fn deltas(&self) -> &[u64] {
        &self.deltas
    }

    /// Number of report pairs folded in since the last reset.
    pub fn pairs(&self) -> u64 {
        self.pairs
    }

    /// Add the deltas between `a` and the later report `b`.
    ///
    /// # Panics
    /// If either report was decoded with a different format.
    pub fn accumulate(&mut self, a: &ReportView<'_>, b: &ReportView<'_>) {
        assert!(
            *a.format() == self.format && *b.format() == self.format,
            "accumulator bound to {} fed {} -> {}",
            self.format.name,
            a.format().name,
            b.format().name,
        );

        let fmt = self.format;
        let ts_width = self.timestamp_width;
        let mut slots = self.deltas.iter_mut();
        let mut add = |delta: u64| {
            if let Some(slot) = slots.next() {
                *slot = slot.wrapping_add(delta);
            }
        };

        add(timestamp_delta(a, b, ts_width));
        add(tick_delta(a, b));
        for i in 0..fmt.n_a40 {
            add(delta_40(a, b, i));
        }
        for i in 0..fmt.n_a64 {
            add(delta_64(a, b, i));
        }
        for i in 0..fmt.n_a {
            add(delta_32(a.counter_32bit_a(i), b.counter_32bit_a(i)));
        }
        for i in 0..fmt.n_b {
            add(delta_32(a.counter_b(i), b.counter_b(i)));
        }
        for i in 0..fmt.n_c {
            add(delta_32(a.counter_c(i), b.counter_c(i)));
        }

        self.pairs += 1;
    }

    /// Accumulated timestamp delta.
    pub fn timestamp(&self) -> u64 {
        self.deltas.first().copied().unwrap_or(0)
    }

    /// Accumulated tick delta.
    pub fn ticks(&self) -> u64 {
        self.deltas.get(1).copied().unwrap_or(0)
    }

    /// Slot names in accumulation order.
    pub fn labels(&self) -> Vec<String> {
        let fmt = &self.format;
        let mut labels = Vec::with_capacity(self.deltas.len());
        labels.push("timestamp".to_string());
        labels.push("ticks".to_string());
        labels.extend((0..fmt.n_a40).map(|i| format!("A{}", fmt.first_a40 + i)));
        labels.extend((0..fmt.n_a64).map(|i| format!("A64_{i}")));
        labels.extend((0..fmt.n_a).map(|i| format!("A{}", fmt.first_a + i)));
        labels.extend((0..fmt.n_b).map(|i| format!("B{i}")));
        labels.extend((0..fmt.n_c).map(|i| format!("C{i}")));
        labels
    }

    /// Return the current totals and start a new window.
    pub fn take(&mut self) -> Vec<u64> {
        let out = std::mem::replace(&mut self.deltas, vec![0; self.format.accumulator_len()]);
        self.pairs = 0;
        out
    }

    pub fn reset(&mut self) {
        self.deltas.iter_mut().for_each(|d| *d = 0);
        self.pairs = 0;
    }
}

// ---------------------------------------------------------------------------
// Sanity check
// ---------------------------------------------------------------------------

/// A report pair that violates the reference metric set's expectations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SanityError {
    #[error("{group}{index}: delta = {delta}, max_delta = {max_delta}")]
    CounterAboveMax {
        group: &'static str,
        index: usize,
        delta: u64,
        max_delta: u64,
    },

    #[error("B{index}: delta = {delta}, expected {expected} (+/- {tolerance}), tick_delta = {tick_delta}")]
    BCounterMismatch {
        index: usize,
        delta: u64,
        expected: u64,
        tolerance: u64,
        tick_delta: u64,
    },
}

/// Summary of a pair that passed the sanity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitySummary {
    pub time_delta_ns: u64,
    pub tick_delta: u64,
    /// GPU clock in MHz derived from the pair, 0 if no time elapsed.
    pub freq_mhz: u64,
}

/// Expected B deltas as (numerator, denominator, tolerance) of tick_delta.
const B_PATTERN: [(u64, u64, u64); 8] = [
    (0, 1, 0),
    (1, 1, 0),
    (1, 1, 0),
    (1, 2, 1),
    (1, 3, 1),
    (1, 3, 1),
    (1, 6, 1),
    (2, 3, 1),
];

/// Validate report pair `(a, b)` against the per-EU upper bound and the
/// fixed B counter test pattern.
///
/// The B pattern is only evaluated for render and render-restricted units.
pub fn sanity_check(
    a: &ReportView<'_>,
    b: &ReportView<'_>,
    devinfo: &DeviceInfo,
) -> Result<SanitySummary, SanityError> {
    let fmt = a.format();
    assert!(
        fmt == b.format(),
        "sanity check across formats {} -> {}",
        fmt.name,
        b.format().name
    );
    let undefined = undefined_a_counters(devinfo.family);
    let is_undefined = |a_id: usize| undefined.get(a_id).copied().unwrap_or(false);

    let time_delta_ns =
        devinfo.timebase_scale(timestamp_delta(a, b, devinfo.timestamp_width()));
    let tick_delta = tick_delta(a, b);
    let freq_mhz = if time_delta_ns > 0 {
        tick_delta * 1_000 / time_delta_ns
    } else {
        0
    };
    debug!(
        from = %a.reason(),
        to = %b.reason(),
        freq_mhz,
        tick_delta,
        "sanity checking report pair",
    );

    let max_delta = tick_delta.saturating_mul(devinfo.n_eus);
    let check_max = |group: &'static str, index: usize, delta: u64| {
        if delta > max_delta {
            Err(SanityError::CounterAboveMax {
                group,
                index,
                delta,
                max_delta,
            })
        } else {
            Ok(())
        }
    };

    for i in 0..fmt.n_a40 {
        let a_id = fmt.first_a40 + i;
        if !is_undefined(a_id) {
            check_max("A40_", a_id, delta_40(a, b, i))?;
        }
    }
    for i in 0..fmt.n_a64 {
        if !is_undefined(i) {
            check_max("A64_", fmt.first_a + i, delta_64(a, b, i))?;
        }
    }
    for i in 0..fmt.n_a {
        let a_id = fmt.first_a + i;
        if !is_undefined(a_id) {
            check_max("A", a_id, delta_32(a.counter_32bit_a(i), b.counter_32bit_a(i)))?;
        }
    }

    if fmt.n_b > 0 && fmt.oa_type.has_test_pattern_b_counters() {
        check_b_pattern(a, b, tick_delta)?;
    }

    for i in 0..fmt.n_c {
        check_max("C", i, delta_32(a.counter_c(i), b.counter_c(i)))?;
    }

    Ok(SanitySummary {
        time_delta_ns,
        tick_delta,
        freq_mhz,
    })
}

fn check_b_pattern(
    a: &ReportView<'_>,
    b: &ReportView<'_>,
    tick_delta: u64,
) -> Result<(), SanityError> {
    let n_b = a.format().n_b;
    for index in 0..n_b {
        let delta = delta_32(a.counter_b(index), b.counter_b(index));
        let (expected, tolerance) = if tick_delta == 0 {
            (0, 0)
        } else {
            match B_PATTERN.get(index) {
                Some((num, den, tol)) => (tick_delta * num / den, *tol),
                None => continue,
            }
        };
        if delta + tolerance < expected || delta > expected + tolerance {
            return Err(SanityError::BCounterMismatch {
                index,
                delta,
                expected,
                tolerance,
                tick_delta,
            });
        }
    }
    Ok(())
}
