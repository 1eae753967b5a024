//! User-supplied metric set register configurations.

use std::collections::HashMap;

use nix::errno::Errno;
use thiserror::Error;

use crate::device::MetricConfigRegs;
use crate::oa::format::HardwareFamily;

/// Length of a metric set uuid in its textual 8-4-4-4-12 form.
pub const UUID_LEN: usize = 36;

/// Metric set built into every device.
pub const BUILTIN_METRIC_SETS: &[(u64, &str)] = &[(1, "TestOa")];

/// Errors from adding or removing a metric configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid metric set uuid {0:?}")]
    InvalidUuid(String),

    #[error("metric configuration has no registers")]
    Empty,

    #[error("register {addr:#x} is not configurable from userspace")]
    RegisterNotAllowed { addr: u32 },

    #[error("a configuration with uuid {0} already exists")]
    DuplicateUuid(String),

    #[error("no metric configuration with id {0}")]
    UnknownId(u64),

    #[error("permission denied")]
    PermissionDenied,

    #[error("device rejected the configuration: {0}")]
    Device(Errno),
}

impl ConfigError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::InvalidUuid(_) | Self::Empty | Self::RegisterNotAllowed { .. } => Errno::EINVAL,
            Self::DuplicateUuid(_) => Errno::EADDRINUSE,
            Self::UnknownId(_) => Errno::ENOENT,
            Self::PermissionDenied => Errno::EACCES,
            Self::Device(e) => *e,
        }
    }
}

/// True for a 36 character `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` hex string.
pub fn is_valid_uuid(uuid: &str) -> bool {
    const DASHES: [usize; 4] = [8, 13, 18, 23];
    uuid.len() == UUID_LEN
        && uuid.bytes().enumerate().all(|(i, c)| {
            if DASHES.contains(&i) {
                c == b'-'
            } else {
                c.is_ascii_hexdigit()
            }
        })
}

const FLEX_EU_REGS: [u32; 7] = [0xe458, 0xe558, 0xe658, 0xe758, 0xe45c, 0xe55c, 0xe65c];
const NOA_WRITE: u32 = 0x9888;
const NOA_CONFIG: [u32; 2] = [0xd04, 0xd2c];
const WAIT_FOR_RC6_EXIT: u32 = 0x20cc;

/// Whether userspace may program `addr` on `family`.
pub fn is_register_allowed(family: HardwareFamily, addr: u32) -> bool {
    // OASTARTTRIG1-8 and OAREPORTTRIG1-8.
    if (0xd900..=0xd93c).contains(&addr) && addr % 4 == 0 {
        return true;
    }
    if FLEX_EU_REGS.contains(&addr) {
        return true;
    }
    match family {
        HardwareFamily::Lnl => (0x13000..=0x13fff).contains(&addr),
        HardwareFamily::Mtl => addr == NOA_WRITE || NOA_CONFIG.contains(&addr),
        HardwareFamily::Gen12 | HardwareFamily::Dg2 => {
            addr == NOA_WRITE || NOA_CONFIG.contains(&addr) || addr == WAIT_FOR_RC6_EXIT
        }
    }
}

/// Validate a configuration before handing it to the device.
pub fn validate(family: HardwareFamily, config: &MetricConfigRegs) -> Result<(), ConfigError> {
    if !is_valid_uuid(&config.uuid) {
        return Err(ConfigError::InvalidUuid(config.uuid.clone()));
    }
    if config.regs.is_empty() {
        return Err(ConfigError::Empty);
    }
    if let Some((addr, _)) = config
        .regs
        .iter()
        .find(|(addr, _)| !is_register_allowed(family, *addr))
    {
        return Err(ConfigError::RegisterNotAllowed { addr: *addr });
    }
    Ok(())
}

/// Metric sets known to one device context.
#[derive(Debug, Default)]
pub struct MetricSets {
    user: HashMap<u64, String>,
}

impl MetricSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` names a built-in or registered metric set.
    pub fn contains(&self, id: u64) -> bool {
        BUILTIN_METRIC_SETS.iter().any(|(b, _)| *b == id) || self.user.contains_key(&id)
    }

    pub fn name(&self, id: u64) -> Option<&str> {
        BUILTIN_METRIC_SETS
            .iter()
            .find(|(b, _)| *b == id)
            .map(|(_, name)| *name)
            .or_else(|| self.user.get(&id).map(String::as_str))
    }

    pub fn id_for_uuid(&self, uuid: &str) -> Option<u64> {
        self.user
            .iter()
            .find(|(_, u)| u.as_str() == uuid)
            .map(|(id, _)| *id)
    }

    pub(crate) fn insert(&mut self, id: u64, uuid: String) {
        self.user.insert(id, uuid);
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<String> {
        self.user.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }
}
