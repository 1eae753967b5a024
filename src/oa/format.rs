//! Report format registry.
//!
//! Each hardware family exposes a sparse set of report layouts. A layout is
//! a [`FormatDescriptor`]: byte offsets and counts for every counter group,
//! plus the bits used to build the device-facing format selector.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// OA unit type. Values match the driver's `DRM_XE_OA_FMT_TYPE_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OaType {
    Oag = 0,
    Oar = 1,
    Oam = 2,
    Oac = 3,
    OamMpec = 4,
    Pec = 5,
}

impl OaType {
    /// Returns the canonical log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Oag => "oag",
            Self::Oar => "oar",
            Self::Oam => "oam",
            Self::Oac => "oac",
            Self::OamMpec => "oam_mpec",
            Self::Pec => "pec",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Oag),
            1 => Some(Self::Oar),
            2 => Some(Self::Oam),
            3 => Some(Self::Oac),
            4 => Some(Self::OamMpec),
            5 => Some(Self::Pec),
            _ => None,
        }
    }

    /// Whether the B counters carry the fixed test pattern checked by
    /// `sanity_check`.
    pub const fn has_test_pattern_b_counters(self) -> bool {
        matches!(self, Self::Oag | Self::Oar)
    }

    /// Engine classes whose instances can host a unit of this type.
    pub const fn engine_classes(self) -> &'static [EngineClass] {
        match self {
            Self::Oag | Self::Oar => &[EngineClass::Render],
            Self::Oac => &[EngineClass::Compute],
            Self::Pec => &[EngineClass::Render, EngineClass::Compute],
            Self::Oam | Self::OamMpec => &[EngineClass::VideoDecode, EngineClass::VideoEnhance],
        }
    }
}

impl fmt::Display for OaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine class. Values match `DRM_XE_ENGINE_CLASS_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum EngineClass {
    Render = 0,
    Copy = 1,
    VideoDecode = 2,
    VideoEnhance = 3,
    Compute = 4,
}

impl EngineClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Copy => "copy",
            Self::VideoDecode => "video_decode",
            Self::VideoEnhance => "video_enhance",
            Self::Compute => "compute",
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Render),
            1 => Some(Self::Copy),
            2 => Some(Self::VideoDecode),
            3 => Some(Self::VideoEnhance),
            4 => Some(Self::Compute),
            _ => None,
        }
    }
}

impl fmt::Display for EngineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graphics IP version, compared as (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub struct GraphicsVersion {
    pub major: u8,
    pub minor: u8,
}

impl GraphicsVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Usable timestamp bits in a report. 12.55 and later carry 56 bits.
    pub fn timestamp_width(self) -> u32 {
        if self >= Self::new(12, 55) {
            56
        } else {
            32
        }
    }
}

impl fmt::Display for GraphicsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Hardware family selecting one format table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareFamily {
    Gen12,
    Dg2,
    Mtl,
    Lnl,
}

impl HardwareFamily {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gen12 => "gen12",
            Self::Dg2 => "dg2",
            Self::Mtl => "mtl",
            Self::Lnl => "lnl",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "gen12" => Some(Self::Gen12),
            "dg2" => Some(Self::Dg2),
            "mtl" => Some(Self::Mtl),
            "lnl" => Some(Self::Lnl),
            _ => None,
        }
    }

    /// Derive the family from the graphics IP version.
    pub fn from_graphics_version(ver: GraphicsVersion) -> Self {
        if ver.major >= 20 {
            Self::Lnl
        } else if ver >= GraphicsVersion::new(12, 70) {
            Self::Mtl
        } else if ver >= GraphicsVersion::new(12, 55) {
            Self::Dg2
        } else {
            Self::Gen12
        }
    }

    /// A representative graphics version for the family.
    pub const fn graphics_version(self) -> GraphicsVersion {
        match self {
            Self::Gen12 => GraphicsVersion::new(12, 0),
            Self::Dg2 => GraphicsVersion::new(12, 55),
            Self::Mtl => GraphicsVersion::new(12, 70),
            Self::Lnl => GraphicsVersion::new(20, 4),
        }
    }

    /// The format used for render-unit validation on this family.
    pub const fn default_test_format(self) -> FormatId {
        match self {
            Self::Gen12 => FormatId::A32u40A4u32B8C8,
            Self::Dg2 | Self::Mtl => FormatId::A24u40A14u32B8C8,
            Self::Lnl => FormatId::Pec64u64,
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Gen12, Self::Dg2, Self::Mtl, Self::Lnl]
    }

    fn table(self) -> &'static [FormatDescriptor] {
        match self {
            Self::Gen12 => GEN12_FORMATS,
            Self::Dg2 => DG2_FORMATS,
            Self::Mtl => MTL_FORMATS,
            Self::Lnl => LNL_FORMATS,
        }
    }
}

impl fmt::Display for HardwareFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report format identifier, as passed in the OA_FORMAT open property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FormatId {
    C4B8 = 1,
    A12 = 2,
    A12B8C8 = 3,
    A32u40A4u32B8C8 = 4,
    OarA32u40A4u32B8C8 = 5,
    A24u40A14u32B8C8 = 6,
    OacA24u64B8C8 = 7,
    OacA22u32R2u32B8C8 = 8,
    OamMpec8u64B8C8 = 9,
    OamMpec8u32B8C8 = 10,
    Pec64u64 = 11,
    Pec64u64B8C8 = 12,
    Pec64u32 = 13,
    Pec32u64G1 = 14,
    Pec32u32G1 = 15,
    Pec32u64G2 = 16,
    Pec32u32G2 = 17,
    Pec36u64G1x32G2x4 = 18,
    Pec36u64G1x4G2x32 = 19,
}

/// Maximum FormatId value.
pub const MAX_FORMAT_ID: u64 = 19;

impl FormatId {
    /// Returns the canonical layout name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::C4B8 => "C4_B8",
            Self::A12 => "A12",
            Self::A12B8C8 => "A12_B8_C8",
            Self::A32u40A4u32B8C8 => "A32u40_A4u32_B8_C8",
            Self::OarA32u40A4u32B8C8 => "OAR_A32u40_A4u32_B8_C8",
            Self::A24u40A14u32B8C8 => "A24u40_A14u32_B8_C8",
            Self::OacA24u64B8C8 => "OAC_A24u64_B8_C8",
            Self::OacA22u32R2u32B8C8 => "OAC_A22u32_R2u32_B8_C8",
            Self::OamMpec8u64B8C8 => "MPEC8u64_B8_C8",
            Self::OamMpec8u32B8C8 => "MPEC8u32_B8_C8",
            Self::Pec64u64 => "PEC64u64",
            Self::Pec64u64B8C8 => "PEC64u64_B8_C8",
            Self::Pec64u32 => "PEC64u32",
            Self::Pec32u64G1 => "PEC32u64_G1",
            Self::Pec32u32G1 => "PEC32u32_G1",
            Self::Pec32u64G2 => "PEC32u64_G2",
            Self::Pec32u32G2 => "PEC32u32_G2",
            Self::Pec36u64G1x32G2x4 => "PEC36u64_G1_32_G2_4",
            Self::Pec36u64G1x4G2x32 => "PEC36u64_G1_4_G2_32",
        }
    }

    /// Convert from a raw property value.
    pub fn from_u64(v: u64) -> Option<Self> {
        Self::all().iter().copied().find(|id| *id as u64 == v)
    }

    /// Convert from the canonical layout name.
    pub fn from_str(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|id| id.as_str() == name)
    }

    /// Return all format ids in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::C4B8,
            Self::A12,
            Self::A12B8C8,
            Self::A32u40A4u32B8C8,
            Self::OarA32u40A4u32B8C8,
            Self::A24u40A14u32B8C8,
            Self::OacA24u64B8C8,
            Self::OacA22u32R2u32B8C8,
            Self::OamMpec8u64B8C8,
            Self::OamMpec8u32B8C8,
            Self::Pec64u64,
            Self::Pec64u64B8C8,
            Self::Pec64u32,
            Self::Pec32u64G1,
            Self::Pec32u32G1,
            Self::Pec32u64G2,
            Self::Pec32u32G2,
            Self::Pec36u64G1x32G2x4,
            Self::Pec36u64G1x4G2x32,
        ]
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary layout of one report format. All offsets are in bytes.
///
/// 40-bit counters are split: the low 32 bits of counter `first_a40 + i`
/// live at `a40_low_off + 4 * (first_a40 + i)` and its high byte at
/// `a40_high_off + first_a40 + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub id: FormatId,
    pub name: &'static str,
    pub size: usize,
    pub a40_high_off: usize,
    pub a40_low_off: usize,
    pub n_a40: usize,
    pub first_a40: usize,
    pub a64_off: usize,
    pub n_a64: usize,
    pub a_off: usize,
    pub n_a: usize,
    pub first_a: usize,
    pub b_off: usize,
    pub n_b: usize,
    pub c_off: usize,
    pub n_c: usize,
    pub oa_type: OaType,
    pub report_hdr_64bit: bool,
    pub counter_select: u8,
    pub counter_size: u8,
    pub bc_report: u8,
}

/// Bytes occupied by the report header for each header width.
pub const HEADER_BYTES_32: usize = 16;
pub const HEADER_BYTES_64: usize = 32;

/// Number of A counter ids tracked by the undefined-counter mask.
pub const MAX_A_COUNTERS: usize = 45;

const fn blank(id: FormatId, name: &'static str, size: usize, oa_type: OaType) -> FormatDescriptor {
    FormatDescriptor {
        id,
        name,
        size,
        a40_high_off: 0,
        a40_low_off: 0,
        n_a40: 0,
        first_a40: 0,
        a64_off: 0,
        n_a64: 0,
        a_off: 0,
        n_a: 0,
        first_a: 0,
        b_off: 0,
        n_b: 0,
        c_off: 0,
        n_c: 0,
        oa_type,
        report_hdr_64bit: false,
        counter_select: 0,
        counter_size: 0,
        bc_report: 0,
    }
}

impl FormatDescriptor {
    /// Header bytes at the start of every report of this format.
    pub const fn header_bytes(&self) -> usize {
        if self.report_hdr_64bit {
            HEADER_BYTES_64
        } else {
            HEADER_BYTES_32
        }
    }

    /// Number of accumulator slots: timestamp, ticks, then every counter.
    pub const fn accumulator_len(&self) -> usize {
        2 + self.n_a40 + self.n_a64 + self.n_a + self.n_b + self.n_c
    }

    /// Device-facing format selector value.
    ///
    /// Bits 0..8 unit type, 8..16 counter select, 16..24 counter size,
    /// 24..32 bc report.
    pub const fn selector(&self) -> u64 {
        (self.oa_type as u64)
            | (self.counter_select as u64) << 8
            | (self.counter_size as u64) << 16
            | (self.bc_report as u64) << 24
    }

    /// Byte ranges of every declared field group, labelled.
    pub fn field_ranges(&self) -> Vec<(&'static str, std::ops::Range<usize>)> {
        let mut ranges = vec![("header", 0..self.header_bytes())];
        if self.n_a40 > 0 {
            let low = self.a40_low_off + 4 * self.first_a40;
            ranges.push(("a40_low", low..low + 4 * self.n_a40));
            let high = self.a40_high_off + self.first_a40;
            ranges.push(("a40_high", high..high + self.n_a40));
        }
        if self.n_a64 > 0 {
            ranges.push(("a64", self.a64_off..self.a64_off + 8 * self.n_a64));
        }
        if self.n_a > 0 {
            ranges.push(("a32", self.a_off..self.a_off + 4 * self.n_a));
        }
        if self.n_b > 0 {
            ranges.push(("b", self.b_off..self.b_off + 4 * self.n_b));
        }
        if self.n_c > 0 {
            ranges.push(("c", self.c_off..self.c_off + 4 * self.n_c));
        }
        ranges
    }

    /// Check that every field fits inside the report and no two overlap.
    pub fn validate_layout(&self) -> Result<(), FormatError> {
        let ranges = self.field_ranges();
        for (name, range) in &ranges {
            if range.end > self.size {
                return Err(FormatError::FieldOutOfBounds {
                    format: self.name,
                    field: name,
                    end: range.end,
                    size: self.size,
                });
            }
        }
        for (i, (a_name, a)) in ranges.iter().enumerate() {
            for (b_name, b) in ranges.iter().skip(i + 1) {
                if a.start < b.end && b.start < a.end {
                    return Err(FormatError::FieldOverlap {
                        format: self.name,
                        first: a_name,
                        second: b_name,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Errors from format lookup and layout validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("format id 0 is reserved")]
    ZeroId,

    #[error("unknown format id: {raw}")]
    UnknownId { raw: u64 },

    #[error("format {format} is not defined for {family}")]
    NotDefined {
        family: HardwareFamily,
        format: FormatId,
    },

    #[error("format {format}: field {field} ends at {end}, past report size {size}")]
    FieldOutOfBounds {
        format: &'static str,
        field: &'static str,
        end: usize,
        size: usize,
    },

    #[error("format {format}: fields {first} and {second} overlap")]
    FieldOverlap {
        format: &'static str,
        first: &'static str,
        second: &'static str,
    },
}

/// Look up a format by raw id for a hardware family.
pub fn lookup(family: HardwareFamily, raw_id: u64) -> Result<&'static FormatDescriptor, FormatError> {
    if raw_id == 0 {
        return Err(FormatError::ZeroId);
    }
    let id = FormatId::from_u64(raw_id).ok_or(FormatError::UnknownId { raw: raw_id })?;
    lookup_id(family, id)
}

/// Look up a typed format id for a hardware family.
pub fn lookup_id(
    family: HardwareFamily,
    id: FormatId,
) -> Result<&'static FormatDescriptor, FormatError> {
    family
        .table()
        .iter()
        .find(|desc| desc.id == id)
        .ok_or(FormatError::NotDefined { family, format: id })
}

/// All formats defined for a family, in id order.
pub fn formats(family: HardwareFamily) -> &'static [FormatDescriptor] {
    family.table()
}

/// A counters with no defined meaning for this family; sanity checks skip
/// them. No family currently reserves any.
pub fn undefined_a_counters(_family: HardwareFamily) -> &'static [bool; MAX_A_COUNTERS] {
    static NONE: [bool; MAX_A_COUNTERS] = [false; MAX_A_COUNTERS];
    &NONE
}

// ---------------------------------------------------------------------------
// Format tables
// ---------------------------------------------------------------------------

const OAG_A32U40_A4U32_B8_C8: FormatDescriptor = FormatDescriptor {
    a40_high_off: 160,
    a40_low_off: 16,
    n_a40: 32,
    a_off: 144,
    n_a: 4,
    first_a: 32,
    b_off: 192,
    n_b: 8,
    c_off: 224,
    n_c: 8,
    counter_select: 5,
    ..blank(FormatId::A32u40A4u32B8C8, "A32u40_A4u32_B8_C8", 256, OaType::Oag)
};

const OAR_A32U40_A4U32_B8_C8: FormatDescriptor = FormatDescriptor {
    id: FormatId::OarA32u40A4u32B8C8,
    oa_type: OaType::Oar,
    ..OAG_A32U40_A4U32_B8_C8
};

// u40: A4 - A23, u32: A0 - A3.
const A24U40_A14U32_B8_C8: FormatDescriptor = FormatDescriptor {
    a40_high_off: 160,
    a40_low_off: 16,
    n_a40: 20,
    first_a40: 4,
    a_off: 16,
    n_a: 4,
    b_off: 192,
    n_b: 8,
    c_off: 224,
    n_c: 8,
    counter_select: 5,
    ..blank(FormatId::A24u40A14u32B8C8, "A24u40_A14u32_B8_C8", 256, OaType::Oag)
};

// Only the one-increment subset A28 - A35 of the 24 u64 counters.
const OAC_A24U64_B8_C8: FormatDescriptor = FormatDescriptor {
    a64_off: 160,
    n_a64: 8,
    b_off: 224,
    n_b: 8,
    c_off: 256,
    n_c: 8,
    counter_select: 1,
    ..blank(FormatId::OacA24u64B8C8, "OAC_A24u64_B8_C8", 320, OaType::Oac)
};

const MPEC8U64_B8_C8: FormatDescriptor = FormatDescriptor {
    a64_off: 32,
    n_a64: 8,
    b_off: 96,
    n_b: 8,
    c_off: 128,
    n_c: 8,
    report_hdr_64bit: true,
    counter_select: 1,
    ..blank(FormatId::OamMpec8u64B8C8, "MPEC8u64_B8_C8", 192, OaType::OamMpec)
};

const MPEC8U32_B8_C8: FormatDescriptor = FormatDescriptor {
    a_off: 32,
    n_a: 8,
    b_off: 64,
    n_b: 8,
    c_off: 96,
    n_c: 8,
    report_hdr_64bit: true,
    counter_select: 2,
    ..blank(FormatId::OamMpec8u32B8C8, "MPEC8u32_B8_C8", 128, OaType::OamMpec)
};

const fn pec(
    id: FormatId,
    name: &'static str,
    size: usize,
    counter_select: u8,
    counter_size: u8,
    bc_report: u8,
) -> FormatDescriptor {
    FormatDescriptor {
        report_hdr_64bit: true,
        counter_select,
        counter_size,
        bc_report,
        ..blank(id, name, size, OaType::Pec)
    }
}

static GEN12_FORMATS: &[FormatDescriptor] = &[OAG_A32U40_A4U32_B8_C8];

static DG2_FORMATS: &[FormatDescriptor] = &[
    OAR_A32U40_A4U32_B8_C8,
    A24U40_A14U32_B8_C8,
    OAC_A24U64_B8_C8,
];

static MTL_FORMATS: &[FormatDescriptor] = &[
    OAR_A32U40_A4U32_B8_C8,
    A24U40_A14U32_B8_C8,
    OAC_A24U64_B8_C8,
    MPEC8U64_B8_C8,
    MPEC8U32_B8_C8,
];

static LNL_FORMATS: &[FormatDescriptor] = &[
    pec(FormatId::Pec64u64, "PEC64u64", 576, 1, 1, 0),
    pec(FormatId::Pec64u64B8C8, "PEC64u64_B8_C8", 640, 1, 1, 1),
    pec(FormatId::Pec64u32, "PEC64u32", 320, 1, 0, 0),
    pec(FormatId::Pec32u64G1, "PEC32u64_G1", 320, 5, 1, 0),
    pec(FormatId::Pec32u32G1, "PEC32u32_G1", 192, 5, 0, 0),
    pec(FormatId::Pec32u64G2, "PEC32u64_G2", 320, 6, 1, 0),
    pec(FormatId::Pec32u32G2, "PEC32u32_G2", 192, 6, 0, 0),
    pec(FormatId::Pec36u64G1x32G2x4, "PEC36u64_G1_32_G2_4", 320, 3, 1, 0),
    pec(FormatId::Pec36u64G1x4G2x32, "PEC36u64_G1_4_G2_32", 320, 4, 1, 0),
];

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_entry_has_valid_layout() {
        for family in HardwareFamily::all() {
            for desc in formats(*family) {
                desc.validate_layout()
                    .unwrap_or_else(|e| panic!("{family}: {e}"));
            }
        }
    }

    #[test]
    fn test_lookup_rejects_zero_and_unknown() {
        assert_eq!(lookup(HardwareFamily::Dg2, 0), Err(FormatError::ZeroId));
        assert_eq!(
            lookup(HardwareFamily::Dg2, u64::MAX),
            Err(FormatError::UnknownId { raw: u64::MAX })
        );
    }

    #[test]
    fn test_lookup_is_sparse_per_family() {
        // Defined on mtl, not on dg2.
        let raw = FormatId::OamMpec8u64B8C8 as u64;
        assert!(lookup(HardwareFamily::Mtl, raw).is_ok());
        assert_eq!(
            lookup(HardwareFamily::Dg2, raw),
            Err(FormatError::NotDefined {
                family: HardwareFamily::Dg2,
                format: FormatId::OamMpec8u64B8C8,
            })
        );
        // Known id, never populated anywhere.
        assert!(lookup(HardwareFamily::Gen12, FormatId::C4B8 as u64).is_err());
    }

    #[test]
    fn test_gen12_reference_layout() {
        let desc = lookup_id(HardwareFamily::Gen12, FormatId::A32u40A4u32B8C8).unwrap();
        assert_eq!(desc.size, 256);
        assert_eq!(desc.n_a40, 32);
        assert_eq!(desc.first_a, 32);
        assert_eq!(desc.oa_type, OaType::Oag);
        assert!(!desc.report_hdr_64bit);
        assert_eq!(desc.accumulator_len(), 2 + 32 + 4 + 8 + 8);
    }

    #[test]
    fn test_selector_packs_fields() {
        let desc = lookup_id(HardwareFamily::Lnl, FormatId::Pec64u64B8C8).unwrap();
        assert_eq!(desc.selector(), 5 | 1 << 8 | 1 << 16 | 1 << 24);

        let oar = lookup_id(HardwareFamily::Dg2, FormatId::OarA32u40A4u32B8C8).unwrap();
        assert_eq!(oar.selector(), 1 | 5 << 8);
    }

    #[test]
    fn test_overlap_is_detected() {
        let bad = FormatDescriptor {
            b_off: 150,
            ..OAG_A32U40_A4U32_B8_C8
        };
        assert!(matches!(
            bad.validate_layout(),
            Err(FormatError::FieldOverlap { .. })
        ));

        let short = FormatDescriptor {
            size: 200,
            ..OAG_A32U40_A4U32_B8_C8
        };
        assert!(matches!(
            short.validate_layout(),
            Err(FormatError::FieldOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_family_from_graphics_version() {
        let cases = [
            ((12, 0), HardwareFamily::Gen12),
            ((12, 10), HardwareFamily::Gen12),
            ((12, 55), HardwareFamily::Dg2),
            ((12, 70), HardwareFamily::Mtl),
            ((12, 71), HardwareFamily::Mtl),
            ((20, 4), HardwareFamily::Lnl),
        ];
        for ((major, minor), want) in cases {
            assert_eq!(
                HardwareFamily::from_graphics_version(GraphicsVersion::new(major, minor)),
                want
            );
        }
        assert_eq!(GraphicsVersion::new(12, 0).timestamp_width(), 32);
        assert_eq!(GraphicsVersion::new(12, 55).timestamp_width(), 56);
    }

    #[test]
    fn test_format_id_round_trip() {
        for id in FormatId::all() {
            assert_eq!(FormatId::from_u64(*id as u64), Some(*id));
            assert_eq!(FormatId::from_str(id.as_str()), Some(*id));
        }
        assert_eq!(FormatId::all().len() as u64, MAX_FORMAT_ID);
    }

    #[test]
    fn test_default_test_format_is_defined() {
        for family in HardwareFamily::all() {
            assert!(lookup_id(*family, family.default_test_format()).is_ok());
        }
    }
}
