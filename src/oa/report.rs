//! Report decoding.
//!
//! A report is only meaningful through its [`FormatDescriptor`]. Every
//! accessor reads inside `[0, format.size)` and bounds-checks the byte range
//! it touches; an undersized buffer is a caller bug and panics.

use std::fmt;

use bitflags::bitflags;

use super::format::FormatDescriptor;

bitflags! {
    /// Why the hardware wrote a report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReportReason: u32 {
        const TIMER = 1 << 0;
        const INTERNAL_TRIGGER_1 = 1 << 1;
        const INTERNAL_TRIGGER_2 = 1 << 2;
        const CONTEXT_SWITCH = 1 << 3;
        const GO_TRANSITION = 1 << 4;
        const CLOCK_RATIO_CHANGE = 1 << 5;
    }
}

impl ReportReason {
    /// Human-readable name of the first reason bit set.
    pub fn describe(self) -> &'static str {
        if self.contains(Self::TIMER) {
            "timer"
        } else if self.contains(Self::INTERNAL_TRIGGER_1) {
            "internal trigger 1"
        } else if self.contains(Self::INTERNAL_TRIGGER_2) {
            "internal trigger 2"
        } else if self.contains(Self::CONTEXT_SWITCH) {
            "context switch"
        } else if self.contains(Self::GO_TRANSITION) {
            "GO 1->0 transition (enter RC6)"
        } else if self.contains(Self::CLOCK_RATIO_CHANGE) {
            "[un]slice clock ratio change"
        } else {
            "unknown"
        }
    }
}

impl fmt::Display for ReportReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

// Header dword 0.
pub const REASON_SHIFT: u32 = 19;
pub const REASON_MASK: u32 = 0x3f;
pub const CTX_VALID_BIT: u32 = 1 << 16;

// 32-bit header field offsets.
const TS_OFF_32: usize = 4;
const CTX_OFF_32: usize = 8;
const TICKS_OFF_32: usize = 12;

// 64-bit header field offsets.
const TS_OFF_64: usize = 8;
const CTX_OFF_64: usize = 16;
const TICKS_OFF_64: usize = 24;

/// Context id reported when the validity bit is clear.
pub const INVALID_CTX_ID: u32 = 0xffff_ffff;

/// Width of tick deltas in bits.
pub const TICK_WIDTH: u32 = 32;

/// Borrowed view of one report, bound to its format.
#[derive(Clone, Copy)]
pub struct ReportView<'a> {
    data: &'a [u8],
    format: &'a FormatDescriptor,
}

impl<'a> ReportView<'a> {
    /// Bind `data` to `format`.
    ///
    /// # Panics
    /// If `data` is shorter than `format.size`.
    pub fn new(data: &'a [u8], format: &'a FormatDescriptor) -> Self {
        assert!(
            data.len() >= format.size,
            "report buffer of {} bytes is smaller than {} format size {}",
            data.len(),
            format.name,
            format.size,
        );
        Self {
            data: &data[..format.size],
            format,
        }
    }

    pub fn format(&self) -> &'a FormatDescriptor {
        self.format
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    fn header(&self) -> u32 {
        read_u32_le(self.data, 0)
    }

    /// The 6-bit reason field as raw bits.
    pub fn raw_reason(&self) -> u32 {
        (self.header() >> REASON_SHIFT) & REASON_MASK
    }

    pub fn reason(&self) -> ReportReason {
        ReportReason::from_bits_truncate(self.raw_reason())
    }

    /// A report is periodic iff the timer bit is set.
    pub fn is_periodic(&self) -> bool {
        self.reason().contains(ReportReason::TIMER)
    }

    pub fn timestamp(&self) -> u64 {
        if self.format.report_hdr_64bit {
            read_u64_le(self.data, TS_OFF_64)
        } else {
            u64::from(read_u32_le(self.data, TS_OFF_32))
        }
    }

    pub fn context_id(&self) -> Option<u32> {
        if self.header() & CTX_VALID_BIT == 0 {
            return None;
        }
        let off = if self.format.report_hdr_64bit {
            CTX_OFF_64
        } else {
            CTX_OFF_32
        };
        Some(read_u32_le(self.data, off))
    }

    pub fn tick_count(&self) -> u64 {
        if self.format.report_hdr_64bit {
            read_u64_le(self.data, TICKS_OFF_64)
        } else {
            u64::from(read_u32_le(self.data, TICKS_OFF_32))
        }
    }

    /// Unslice clock ratio field.
    pub fn unslice_clock_ratio(&self) -> u32 {
        self.header() & 0x1ff
    }

    /// Slice clock ratio, split across two header fields.
    pub fn slice_clock_ratio(&self) -> u32 {
        let h = self.header();
        ((h >> 25) & 0x7f) | (((h >> 9) & 0x3) << 7)
    }

    pub fn unslice_clock_mhz(&self) -> u32 {
        clock_ratio_to_mhz(self.unslice_clock_ratio())
    }

    pub fn slice_clock_mhz(&self) -> u32 {
        clock_ratio_to_mhz(self.slice_clock_ratio())
    }

    /// 40-bit counter `index` of the group (A id `first_a40 + index`).
    pub fn counter_40bit(&self, index: usize) -> u64 {
        assert!(index < self.format.n_a40, "40-bit counter {index} out of range");
        let a_id = self.format.first_a40 + index;
        let low = read_u32_le(self.data, self.format.a40_low_off + 4 * a_id);
        let high = read_u8(self.data, self.format.a40_high_off + a_id);
        u64::from(low) | u64::from(high) << 32
    }

    pub fn counter_64bit(&self, index: usize) -> u64 {
        assert!(index < self.format.n_a64, "64-bit counter {index} out of range");
        read_u64_le(self.data, self.format.a64_off + 8 * index)
    }

    /// 32-bit A counter `index` of the group (A id `first_a + index`).
    pub fn counter_32bit_a(&self, index: usize) -> u32 {
        assert!(index < self.format.n_a, "A counter {index} out of range");
        read_u32_le(self.data, self.format.a_off + 4 * index)
    }

    pub fn counter_b(&self, index: usize) -> u32 {
        assert!(index < self.format.n_b, "B counter {index} out of range");
        read_u32_le(self.data, self.format.b_off + 4 * index)
    }

    pub fn counter_c(&self, index: usize) -> u32 {
        assert!(index < self.format.n_c, "C counter {index} out of range");
        read_u32_le(self.data, self.format.c_off + 4 * index)
    }
}

impl fmt::Debug for ReportView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportView")
            .field("format", &self.format.name)
            .field("reason", &self.reason())
            .field("timestamp", &self.timestamp())
            .field("ticks", &self.tick_count())
            .field("context_id", &self.context_id())
            .finish()
    }
}

/// Convert a clock ratio field to MHz.
pub fn clock_ratio_to_mhz(ratio: u32) -> u32 {
    ratio * 16_666 / 1_000
}

// ---------------------------------------------------------------------------
// Report construction
// ---------------------------------------------------------------------------

/// Owned report buffer with typed setters, the inverse of [`ReportView`].
///
/// Used by the simulated OA unit and by tests to produce reports with a
/// known content.
#[derive(Clone)]
pub struct ReportBuilder<'f> {
    data: Vec<u8>,
    format: &'f FormatDescriptor,
}

impl<'f> ReportBuilder<'f> {
    pub fn new(format: &'f FormatDescriptor) -> Self {
        Self {
            data: vec![0; format.size],
            format,
        }
    }

    fn set_header(&mut self, header: u32) {
        write_u32_le(&mut self.data, 0, header);
    }

    fn header(&self) -> u32 {
        read_u32_le(&self.data, 0)
    }

    pub fn reason(&mut self, reason: ReportReason) -> &mut Self {
        let h = self.header() & !(REASON_MASK << REASON_SHIFT);
        self.set_header(h | (reason.bits() & REASON_MASK) << REASON_SHIFT);
        self
    }

    pub fn timestamp(&mut self, ts: u64) -> &mut Self {
        if self.format.report_hdr_64bit {
            write_u64_le(&mut self.data, TS_OFF_64, ts);
        } else {
            write_u32_le(&mut self.data, TS_OFF_32, ts as u32);
        }
        self
    }

    pub fn ticks(&mut self, ticks: u64) -> &mut Self {
        if self.format.report_hdr_64bit {
            write_u64_le(&mut self.data, TICKS_OFF_64, ticks);
        } else {
            write_u32_le(&mut self.data, TICKS_OFF_32, ticks as u32);
        }
        self
    }

    pub fn context_id(&mut self, ctx: Option<u32>) -> &mut Self {
        let off = if self.format.report_hdr_64bit {
            CTX_OFF_64
        } else {
            CTX_OFF_32
        };
        match ctx {
            Some(id) => {
                let h = self.header() | CTX_VALID_BIT;
                self.set_header(h);
                write_u32_le(&mut self.data, off, id);
            }
            None => {
                let h = self.header() & !CTX_VALID_BIT;
                self.set_header(h);
                write_u32_le(&mut self.data, off, INVALID_CTX_ID);
            }
        }
        self
    }

    pub fn counter_40bit(&mut self, index: usize, value: u64) -> &mut Self {
        assert!(index < self.format.n_a40, "40-bit counter {index} out of range");
        let a_id = self.format.first_a40 + index;
        write_u32_le(&mut self.data, self.format.a40_low_off + 4 * a_id, value as u32);
        let high = self.format.a40_high_off + a_id;
        self.data[high] = (value >> 32) as u8;
        self
    }

    pub fn counter_64bit(&mut self, index: usize, value: u64) -> &mut Self {
        assert!(index < self.format.n_a64, "64-bit counter {index} out of range");
        write_u64_le(&mut self.data, self.format.a64_off + 8 * index, value);
        self
    }

    pub fn counter_32bit_a(&mut self, index: usize, value: u32) -> &mut Self {
        assert!(index < self.format.n_a, "A counter {index} out of range");
        write_u32_le(&mut self.data, self.format.a_off + 4 * index, value);
        self
    }

    pub fn counter_b(&mut self, index: usize, value: u32) -> &mut Self {
        assert!(index < self.format.n_b, "B counter {index} out of range");
        write_u32_le(&mut self.data, self.format.b_off + 4 * index, value);
        self
    }

    pub fn counter_c(&mut self, index: usize, value: u32) -> &mut Self {
        assert!(index < self.format.n_c, "C counter {index} out of range");
        write_u32_le(&mut self.data, self.format.c_off + 4 * index, value);
        self
    }

    pub fn view(&self) -> ReportView<'_> {
        ReportView::new(&self.data, self.format)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

// ---------------------------------------------------------------------------
// Byte access
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    read_fixed::<1>(data, offset)[0]
}

#[inline(always)]
pub(crate) fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
pub(crate) fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    assert!(
        offset.checked_add(N).is_some_and(|end| end <= data.len()),
        "read of {N} bytes at offset {offset} past end of {}-byte report",
        data.len(),
    );
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

pub(crate) fn write_u32_le(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64_le(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::oa::format::{lookup_id, FormatId, HardwareFamily};

    fn gen12() -> &'static FormatDescriptor {
        lookup_id(HardwareFamily::Gen12, FormatId::A32u40A4u32B8C8).unwrap()
    }

    fn mpec() -> &'static FormatDescriptor {
        lookup_id(HardwareFamily::Mtl, FormatId::OamMpec8u64B8C8).unwrap()
    }

    #[test]
    fn test_reason_field_position() {
        let mut raw = vec![0u8; 256];
        raw[..4].copy_from_slice(&(0b001001u32 << 19).to_le_bytes());
        let view = ReportView::new(&raw, gen12());
        assert_eq!(view.raw_reason(), 0b001001);
        assert_eq!(
            view.reason(),
            ReportReason::TIMER | ReportReason::CONTEXT_SWITCH
        );
        assert!(view.is_periodic());
        assert_eq!(view.reason().describe(), "timer");
    }

    #[test]
    fn test_reason_names() {
        assert_eq!(ReportReason::CONTEXT_SWITCH.describe(), "context switch");
        assert_eq!(
            ReportReason::GO_TRANSITION.describe(),
            "GO 1->0 transition (enter RC6)"
        );
        assert_eq!(ReportReason::empty().describe(), "unknown");
    }

    #[test]
    fn test_header_widths() {
        let mut b = ReportBuilder::new(gen12());
        b.timestamp(0x1234_5678).ticks(0x9abc);
        let view = b.view();
        assert_eq!(view.timestamp(), 0x1234_5678);
        assert_eq!(view.tick_count(), 0x9abc);
        assert_eq!(read_u32_le(b.as_bytes(), 4), 0x1234_5678);
        assert_eq!(read_u32_le(b.as_bytes(), 12), 0x9abc);

        let mut b = ReportBuilder::new(mpec());
        b.timestamp(0x00ab_cdef_0123_4567).ticks(0x1_0000_0001);
        let view = b.view();
        assert_eq!(view.timestamp(), 0x00ab_cdef_0123_4567);
        assert_eq!(view.tick_count(), 0x1_0000_0001);
        assert_eq!(read_u64_le(b.as_bytes(), 8), 0x00ab_cdef_0123_4567);
        assert_eq!(read_u64_le(b.as_bytes(), 24), 0x1_0000_0001);
    }

    #[test]
    fn test_context_id_requires_valid_bit() {
        let mut raw = vec![0u8; 256];
        raw[8..12].copy_from_slice(&42u32.to_le_bytes());
        assert_eq!(ReportView::new(&raw, gen12()).context_id(), None);

        raw[..4].copy_from_slice(&CTX_VALID_BIT.to_le_bytes());
        assert_eq!(ReportView::new(&raw, gen12()).context_id(), Some(42));

        let mut b = ReportBuilder::new(gen12());
        b.context_id(None);
        assert_eq!(b.view().context_id(), None);
    }

    #[test]
    fn test_clock_ratios() {
        let header: u32 = 0x1ff | (0x7f << 25) | (0x3 << 9);
        let mut raw = vec![0u8; 256];
        raw[..4].copy_from_slice(&header.to_le_bytes());
        let view = ReportView::new(&raw, gen12());
        assert_eq!(view.unslice_clock_ratio(), 0x1ff);
        assert_eq!(view.slice_clock_ratio(), 0x1ff);
        assert_eq!(clock_ratio_to_mhz(60), 999);
    }

    #[test]
    fn test_counter_groups_at_declared_offsets() {
        let fmt = gen12();
        let mut raw = vec![0u8; fmt.size];
        raw[fmt.a_off + 4..fmt.a_off + 8].copy_from_slice(&7u32.to_le_bytes());
        raw[fmt.b_off + 28..fmt.b_off + 32].copy_from_slice(&9u32.to_le_bytes());
        raw[fmt.c_off..fmt.c_off + 4].copy_from_slice(&11u32.to_le_bytes());
        let view = ReportView::new(&raw, fmt);
        assert_eq!(view.counter_32bit_a(1), 7);
        assert_eq!(view.counter_b(7), 9);
        assert_eq!(view.counter_c(0), 11);

        let mut b = ReportBuilder::new(mpec());
        b.counter_64bit(3, u64::MAX - 1);
        assert_eq!(b.view().counter_64bit(3), u64::MAX - 1);
    }

    #[test]
    fn test_40bit_counter_uses_first_a40() {
        let fmt = lookup_id(HardwareFamily::Dg2, FormatId::A24u40A14u32B8C8).unwrap();
        let mut b = ReportBuilder::new(fmt);
        b.counter_40bit(0, 0xab_0000_0001);
        // A4 low word sits after the four 32-bit A counters.
        assert_eq!(read_u32_le(b.as_bytes(), 32), 1);
        assert_eq!(b.as_bytes()[164], 0xab);
        b.counter_32bit_a(3, 5);
        assert_eq!(b.view().counter_40bit(0), 0xab_0000_0001);
        assert_eq!(b.view().counter_32bit_a(3), 5);
    }

    #[test]
    #[should_panic(expected = "smaller than")]
    fn test_undersized_buffer_panics() {
        let raw = vec![0u8; 100];
        let _ = ReportView::new(&raw, gen12());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_counter_index_out_of_range_panics() {
        let raw = vec![0u8; 256];
        let _ = ReportView::new(&raw, gen12()).counter_b(8);
    }

    proptest! {
        #[test]
        fn prop_40bit_round_trip(value in 0u64..(1u64 << 40), index in 0usize..32) {
            let mut b = ReportBuilder::new(gen12());
            b.counter_40bit(index, value);
            prop_assert_eq!(b.view().counter_40bit(index), value);
        }
    }
}
