//! Sampling period exponent math.
//!
//! The hardware triggers a periodic report whenever timestamp bit
//! `exponent + 1` toggles, so the period is `2 << exponent` timestamp ticks.

/// Largest exponent the hardware accepts.
pub const MAX_OA_EXPONENT: u32 = 31;

/// Exponent search stops here; exponent 30 is already minutes long.
const EXPONENT_SEARCH_LIMIT: u32 = 30;

const NSEC_PER_SEC: u128 = 1_000_000_000;

/// Period of `exponent` in timestamp ticks.
pub const fn period_ticks(exponent: u32) -> u64 {
    2u64 << exponent
}

/// Period of `exponent` in nanoseconds for a timestamp frequency in Hz.
pub fn exponent_to_ns(exponent: u32, timestamp_frequency: u64) -> u64 {
    if timestamp_frequency == 0 {
        return 0;
    }
    (NSEC_PER_SEC * u128::from(period_ticks(exponent)) / u128::from(timestamp_frequency)) as u64
}

/// Report frequency of `exponent` in Hz.
///
/// Derived from the truncated nanosecond period, the same way the sample
/// rate policy is enforced, so boundary rates compare identically.
pub fn exponent_to_hz(exponent: u32, timestamp_frequency: u64) -> u64 {
    match exponent_to_ns(exponent, timestamp_frequency) {
        0 => u64::MAX,
        period_ns => 1_000_000_000 / period_ns,
    }
}

/// Largest exponent whose period is still `<= period_ns`.
pub fn max_exponent_for_period_lte(period_ns: u64, timestamp_frequency: u64) -> Option<u32> {
    for i in 0..EXPONENT_SEARCH_LIMIT {
        if exponent_to_ns(i, timestamp_frequency) > period_ns {
            return Some(i.saturating_sub(1));
        }
    }
    None
}

/// Largest exponent whose frequency is still `> frequency_hz`.
pub fn max_exponent_for_freq_gt(frequency_hz: u64, timestamp_frequency: u64) -> Option<u32> {
    let period = 1_000_000_000u64.checked_div(frequency_hz)?;
    if period == 0 {
        return None;
    }
    max_exponent_for_period_lte(period - 1, timestamp_frequency)
}

/// A timer report delta is on time when it is no larger than expected.
pub fn expected_report_timing_delta(delta: u64, expected: u64) -> bool {
    delta <= expected
}

/// True when at least half of the timer deltas are on time.
pub fn timer_reports_match(deltas: &[u64], expected: u64) -> bool {
    if deltas.is_empty() {
        return false;
    }
    let matches = deltas
        .iter()
        .filter(|d| expected_report_timing_delta(**d, expected))
        .count();
    matches * 2 >= deltas.len()
}
