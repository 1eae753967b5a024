//! Privileged single-integer policy files.
//!
//! Each file holds one decimal integer, optionally followed by a newline.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

pub const DEFAULT_PARANOID_PATH: &str = "/proc/sys/dev/xe/perf_stream_paranoid";
pub const DEFAULT_MAX_SAMPLE_RATE_PATH: &str = "/proc/sys/dev/xe/oa_max_sample_rate";

/// Paranoid gate value when the policy file does not exist.
pub const DEFAULT_PARANOID: u64 = 1;
/// Maximum unprivileged sampling rate in Hz when the policy file does not exist.
pub const DEFAULT_MAX_SAMPLE_RATE: u64 = 100_000;

/// Read a whole-file decimal integer.
pub fn read_u64(path: &Path) -> Result<u64> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    data.trim_end_matches('\n')
        .trim()
        .parse::<u64>()
        .with_context(|| format!("parsing {}: {data:?}", path.display()))
}

/// Replace the file's contents with `value`.
pub fn write_u64(path: &Path, value: u64) -> Result<()> {
    fs::write(path, format!("{value}\n")).with_context(|| format!("writing {}", path.display()))
}

/// Read a policy value, falling back to `default` when the file is missing.
pub fn read_or(path: &Path, default: u64) -> Result<u64> {
    if !path.exists() {
        return Ok(default);
    }
    read_u64(path)
}

/// Locations of the stream policy files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyPaths {
    pub paranoid: PathBuf,
    pub max_sample_rate: PathBuf,
}

impl Default for PolicyPaths {
    fn default() -> Self {
        Self {
            paranoid: PathBuf::from(DEFAULT_PARANOID_PATH),
            max_sample_rate: PathBuf::from(DEFAULT_MAX_SAMPLE_RATE_PATH),
        }
    }
}

/// Snapshot of the policy gates consulted when opening a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub paranoid: bool,
    pub max_sample_rate: u64,
}

impl PolicyPaths {
    pub fn load(&self) -> Result<Policy> {
        Ok(Policy {
            paranoid: read_or(&self.paranoid, DEFAULT_PARANOID)? != 0,
            max_sample_rate: read_or(&self.max_sample_rate, DEFAULT_MAX_SAMPLE_RATE)?,
        })
    }
}

/// Writes a policy value and restores the previous one when dropped.
pub struct PolicyGuard {
    path: PathBuf,
    previous: u64,
}

impl PolicyGuard {
    pub fn set(path: impl Into<PathBuf>, value: u64) -> Result<Self> {
        let path = path.into();
        let previous = read_u64(&path)?;
        write_u64(&path, value)?;
        debug!(path = %path.display(), previous, value, "policy value set");
        Ok(Self { path, previous })
    }

    pub fn previous(&self) -> u64 {
        self.previous
    }
}

impl Drop for PolicyGuard {
    fn drop(&mut self) {
        if let Err(e) = write_u64(&self.path, self.previous) {
            warn!(path = %self.path.display(), error = %e, "failed to restore policy value");
        }
    }
}
