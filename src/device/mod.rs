//! Device I/O seam.
//!
//! Everything the stream core needs from the kernel driver goes through
//! [`OaDevice`] and [`OaStream`]. Errors come back as POSIX errno values so
//! the core can classify them exactly once.

pub mod sim;

#[cfg(feature = "xe")]
pub mod xe;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use nix::errno::Errno;

use crate::oa::devinfo::DeviceInfo;
use crate::oa::format::EngineClass;
use crate::oa::record::Transport;

bitflags! {
    /// Out-of-band stream status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OaStatus: u64 {
        const REPORT_LOST = 1 << 0;
        const BUFFER_OVERFLOW = 1 << 1;
        const COUNTER_OVERFLOW = 1 << 2;
        const MMIO_TRG_Q_FULL = 1 << 3;
    }
}

bitflags! {
    /// Requested protection of a ring mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Stream open property key. Values match `DRM_XE_OA_PROPERTY_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum PropertyKey {
    OaUnitId = 1,
    SampleOa = 2,
    OaMetricSet = 3,
    OaFormat = 4,
    OaPeriodExponent = 5,
    OaDisabled = 6,
    ExecQueueId = 7,
    OaEngineInstance = 8,
}

impl PropertyKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OaUnitId => "oa_unit_id",
            Self::SampleOa => "sample_oa",
            Self::OaMetricSet => "oa_metric_set",
            Self::OaFormat => "oa_format",
            Self::OaPeriodExponent => "oa_period_exponent",
            Self::OaDisabled => "oa_disabled",
            Self::ExecQueueId => "exec_queue_id",
            Self::OaEngineInstance => "oa_engine_instance",
        }
    }

    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            1 => Some(Self::OaUnitId),
            2 => Some(Self::SampleOa),
            3 => Some(Self::OaMetricSet),
            4 => Some(Self::OaFormat),
            5 => Some(Self::OaPeriodExponent),
            6 => Some(Self::OaDisabled),
            7 => Some(Self::ExecQueueId),
            8 => Some(Self::OaEngineInstance),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat list of `(key, value)` pairs handed to the stream open call.
pub type PropertyList = Vec<(u64, u64)>;

/// One engine an OA unit can sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineRef {
    pub class: EngineClass,
    pub instance: u16,
}

/// Static description of one OA unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaUnitInfo {
    pub id: u32,
    pub engines: Vec<EngineRef>,
}

/// A user-supplied register configuration as handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricConfigRegs {
    pub uuid: String,
    /// `(address, value)` pairs.
    pub regs: Vec<(u32, u32)>,
}

/// Destination of a stream read.
///
/// `requested` may exceed the mapped slice; bytes past the slice behave
/// like an unmapped page and fault when written.
pub struct ReadBuf<'a> {
    mapped: &'a mut [u8],
    requested: usize,
}

impl<'a> ReadBuf<'a> {
    pub fn new(mapped: &'a mut [u8]) -> Self {
        let requested = mapped.len();
        Self { mapped, requested }
    }

    /// A read of `requested` bytes into a region where only `mapped` is
    /// accessible.
    pub fn with_unmapped_tail(mapped: &'a mut [u8], requested: usize) -> Self {
        Self { mapped, requested }
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped.len()
    }

    pub fn mapped_mut(&mut self) -> &mut [u8] {
        &mut *self.mapped
    }
}

/// Read-only window onto a stream's hardware ring.
pub trait RingMapping: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset`.
    fn read_at(&self, offset: usize, dst: &mut [u8]);
}

/// One open stream handle.
pub trait OaStream: Send + Sync {
    fn transport(&self) -> Transport;

    /// POSIX read semantics: bytes copied, or an errno.
    fn read(&self, buf: &mut ReadBuf<'_>) -> Result<usize, Errno>;

    fn enable(&self) -> Result<(), Errno>;

    fn disable(&self) -> Result<(), Errno>;

    /// Query and clear the status flags.
    fn status(&self) -> Result<OaStatus, Errno>;

    /// Wait until a read would not block. Returns false on timeout.
    fn poll(&self, timeout: Duration) -> Result<bool, Errno>;

    fn map(&self, prot: MapProt) -> Result<Arc<dyn RingMapping>, Errno>;

    /// Release the handle. Later calls fail with `EBADF`.
    fn close(&self);
}

/// A device exposing OA units.
pub trait OaDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn oa_units(&self) -> &[OaUnitInfo];

    fn open_stream(
        &self,
        properties: &[(u64, u64)],
        blocking: bool,
    ) -> Result<Arc<dyn OaStream>, Errno>;

    fn add_config(&self, config: &MetricConfigRegs) -> Result<u64, Errno>;

    fn remove_config(&self, id: u64) -> Result<(), Errno>;
}
