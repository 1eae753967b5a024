//! Per-device constants that report decoding and sanity checks depend on.

use super::format::{GraphicsVersion, HardwareFamily};

/// Static description of the device a stream samples from.
///
/// Computed once when an [`crate::session::OaContext`] is built and shared
/// by reference afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub family: HardwareFamily,
    pub graphics_version: GraphicsVersion,
    pub device_id: u32,
    pub revision: u32,
    /// Execution units contributing to the A counters.
    pub n_eus: u64,
    /// Report timestamp frequency in Hz.
    pub timestamp_frequency: u64,
    pub gt_min_frequency_mhz: u32,
    pub gt_max_frequency_mhz: u32,
}

impl DeviceInfo {
    /// A device of the given family with its representative IP version.
    pub fn for_family(family: HardwareFamily, n_eus: u64, timestamp_frequency: u64) -> Self {
        Self {
            family,
            graphics_version: family.graphics_version(),
            device_id: 0,
            revision: 0,
            n_eus,
            timestamp_frequency,
            gt_min_frequency_mhz: 300,
            gt_max_frequency_mhz: 1_500,
        }
    }

    /// Usable timestamp bits in reports from this device.
    pub fn timestamp_width(&self) -> u32 {
        self.graphics_version.timestamp_width()
    }

    /// Convert a timestamp delta to nanoseconds.
    pub fn timebase_scale(&self, delta: u64) -> u64 {
        if self.timestamp_frequency == 0 {
            return 0;
        }
        ((delta as u128 * 1_000_000_000) / self.timestamp_frequency as u128) as u64
    }
}
