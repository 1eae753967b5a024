use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::oa::devinfo::DeviceInfo;
use crate::oa::exponent::MAX_OA_EXPONENT;
use crate::oa::format::{lookup_id, FormatDescriptor, FormatId, GraphicsVersion, HardwareFamily};
use crate::oa::record::Transport;
use crate::session::sysctl::{PolicyPaths, DEFAULT_MAX_SAMPLE_RATE_PATH, DEFAULT_PARANOID_PATH};
use crate::session::OpenParams;

/// Top-level configuration for the oastream recorder.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Device backend configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Stream open parameters.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Policy file locations.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Recording file output.
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Accumulation window; totals are logged and exported per window.
    /// Default: 1s.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Stop recording after this long. Default: run until interrupted.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Which device implementation backs the streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Simulated,
    Xe,
}

/// Device backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Backend. Default: simulated.
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// DRM device node for the xe backend. Default: "/dev/dri/card0".
    #[serde(default = "default_device_path")]
    pub path: PathBuf,

    /// Hardware family of the simulated device. Default: gen12.
    #[serde(default = "default_family")]
    pub family: HardwareFamily,

    /// Execution units contributing to the A counters. Default: 96.
    #[serde(default = "default_n_eus")]
    pub n_eus: u64,

    /// Report timestamp frequency in Hz. Default: 19.2MHz.
    #[serde(default = "default_timestamp_frequency")]
    pub timestamp_frequency: u64,

    /// Graphics IP version; overrides `family` when set.
    #[serde(default)]
    pub graphics_ver: Option<GraphicsVersion>,

    /// Read transport of the simulated device. Default: framed.
    #[serde(default = "default_transport")]
    pub transport: Transport,

    /// Simulated context switch cadence in timer reports; 0 disables.
    #[serde(default)]
    pub context_switch_every: u32,
}

/// Stream open parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Report format name (e.g. "A32u40_A4u32_B8_C8"). Default: the
    /// family's test format.
    #[serde(default)]
    pub format: String,

    /// Sampling period exponent. Default: 13 (about 1ms at 19.2MHz).
    #[serde(default = "default_exponent")]
    pub exponent: Option<u32>,

    /// Metric set id. Default: 1.
    #[serde(default = "default_metric_set")]
    pub metric_set: u64,

    /// OA unit to open. Default: 0.
    #[serde(default)]
    pub oa_unit: u32,

    #[serde(default)]
    pub engine_instance: Option<u16>,

    #[serde(default)]
    pub exec_queue: Option<u32>,

    /// Use blocking reads. Default: true.
    #[serde(default = "default_true")]
    pub blocking: bool,

    /// Read buffer size in bytes; 0 sizes it from the format. Default: 0.
    #[serde(default)]
    pub read_buffer_size: usize,

    /// Poll timeout of the non-blocking drain loop. Default: 100ms.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,
}

/// Policy file locations.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_paranoid_path")]
    pub paranoid_path: PathBuf,

    #[serde(default = "default_max_sample_rate_path")]
    pub max_sample_rate_path: PathBuf,
}

/// Recording file output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingConfig {
    /// Write a recording file. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Output path.
    #[serde(default)]
    pub path: PathBuf,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090". Empty disables the server.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_window() -> Duration {
    Duration::from_secs(1)
}

fn default_backend() -> Backend {
    Backend::Simulated
}

fn default_device_path() -> PathBuf {
    PathBuf::from("/dev/dri/card0")
}

fn default_family() -> HardwareFamily {
    HardwareFamily::Gen12
}

fn default_n_eus() -> u64 {
    96
}

fn default_timestamp_frequency() -> u64 {
    19_200_000
}

fn default_transport() -> Transport {
    Transport::Framed
}

fn default_exponent() -> Option<u32> {
    Some(13)
}

fn default_metric_set() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_paranoid_path() -> PathBuf {
    PathBuf::from(DEFAULT_PARANOID_PATH)
}

fn default_max_sample_rate_path() -> PathBuf {
    PathBuf::from(DEFAULT_MAX_SAMPLE_RATE_PATH)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceConfig::default(),
            stream: StreamConfig::default(),
            policy: PolicyConfig::default(),
            recording: RecordingConfig::default(),
            window: default_window(),
            duration: None,
            health: HealthConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_device_path(),
            family: default_family(),
            n_eus: default_n_eus(),
            timestamp_frequency: default_timestamp_frequency(),
            graphics_ver: None,
            transport: default_transport(),
            context_switch_every: 0,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: String::new(),
            exponent: default_exponent(),
            metric_set: default_metric_set(),
            oa_unit: 0,
            engine_instance: None,
            exec_queue: None,
            blocking: default_true(),
            read_buffer_size: 0,
            poll_timeout: default_poll_timeout(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            paranoid_path: default_paranoid_path(),
            max_sample_rate_path: default_max_sample_rate_path(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Derived values ---

impl DeviceConfig {
    /// Effective hardware family.
    pub fn family(&self) -> HardwareFamily {
        self.graphics_ver
            .map(HardwareFamily::from_graphics_version)
            .unwrap_or(self.family)
    }

    /// Device description of the simulated backend.
    pub fn device_info(&self) -> DeviceInfo {
        let mut info = DeviceInfo::for_family(self.family(), self.n_eus, self.timestamp_frequency);
        if let Some(ver) = self.graphics_ver {
            info.graphics_version = ver;
        }
        info
    }
}

impl StreamConfig {
    /// Resolved format id for `family`.
    pub fn format_id(&self, family: HardwareFamily) -> Result<FormatId> {
        if self.format.is_empty() {
            return Ok(family.default_test_format());
        }
        FormatId::from_str(&self.format)
            .with_context(|| format!("unknown stream.format {:?}", self.format))
    }

    pub fn format(&self, family: HardwareFamily) -> Result<&'static FormatDescriptor> {
        let id = self.format_id(family)?;
        lookup_id(family, id).with_context(|| format!("stream.format {id}"))
    }

    /// Open parameters for this stream.
    pub fn open_params(&self, family: HardwareFamily) -> Result<OpenParams> {
        Ok(OpenParams {
            oa_unit: self.oa_unit,
            sample_oa: true,
            metric_set: self.metric_set,
            format: self.format_id(family)? as u64,
            exponent: self.exponent.map(u64::from),
            disabled: true,
            engine_instance: self.engine_instance,
            exec_queue: self.exec_queue,
            blocking: self.blocking,
        })
    }
}

impl PolicyConfig {
    pub fn paths(&self) -> PolicyPaths {
        PolicyPaths {
            paranoid: self.paranoid_path.clone(),
            max_sample_rate: self.max_sample_rate_path.clone(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let family = self.device.family();

        if self.device.timestamp_frequency == 0 {
            bail!("device.timestamp_frequency must be positive");
        }

        if self.device.n_eus == 0 {
            bail!("device.n_eus must be positive");
        }

        self.stream.format(family)?;

        if let Some(exp) = self.stream.exponent {
            if exp > MAX_OA_EXPONENT {
                bail!("stream.exponent must be at most {MAX_OA_EXPONENT}");
            }
        } else if self.stream.exec_queue.is_none() {
            bail!("stream.exponent or stream.exec_queue is required");
        }

        if self.stream.metric_set == 0 {
            bail!("stream.metric_set must be positive");
        }

        if self.stream.poll_timeout.is_zero() {
            bail!("stream.poll_timeout must be positive");
        }

        if self.window.is_zero() {
            bail!("window must be positive");
        }

        if self.recording.enabled && self.recording.path.as_os_str().is_empty() {
            bail!("recording.path is required when recording is enabled");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.window, Duration::from_secs(1));
        assert_eq!(cfg.device.backend, Backend::Simulated);
        assert_eq!(cfg.stream.exponent, Some(13));
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.policy.paths(), PolicyPaths::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
device:
  family: dg2
  transport: raw
  context_switch_every: 4
stream:
  format: OAC_A24u64_B8_C8
  exponent: 5
window: 250ms
duration: 2s
recording:
  enabled: true
  path: /tmp/oa.rec
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.device.family(), HardwareFamily::Dg2);
        assert_eq!(cfg.device.transport, Transport::Raw);
        assert_eq!(cfg.window, Duration::from_millis(250));
        assert_eq!(cfg.duration, Some(Duration::from_secs(2)));
        assert_eq!(
            cfg.stream.format_id(HardwareFamily::Dg2).unwrap(),
            FormatId::OacA24u64B8C8
        );
    }

    #[test]
    fn test_graphics_version_overrides_family() {
        let cfg = DeviceConfig {
            graphics_ver: Some(GraphicsVersion::new(12, 70)),
            ..Default::default()
        };
        assert_eq!(cfg.family(), HardwareFamily::Mtl);
        assert_eq!(cfg.device_info().graphics_version, GraphicsVersion::new(12, 70));
    }

    #[test]
    fn test_default_format_follows_family() {
        let stream = StreamConfig::default();
        assert_eq!(
            stream.format_id(HardwareFamily::Lnl).unwrap(),
            FormatId::Pec64u64
        );
        let params = stream.open_params(HardwareFamily::Gen12).unwrap();
        assert_eq!(params.format, FormatId::A32u40A4u32B8C8 as u64);
        assert!(params.disabled);
    }

    #[test]
    fn test_validation_format_not_in_family() {
        let cfg = Config {
            stream: StreamConfig {
                format: "PEC64u64".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_exponent_range() {
        let cfg = Config {
            stream: StreamConfig {
                exponent: Some(32),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stream.exponent"));

        let cfg = Config {
            stream: StreamConfig {
                exponent: None,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_recording_path() {
        let cfg = Config {
            recording: RecordingConfig {
                enabled: true,
                path: PathBuf::new(),
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("recording.path"));
    }
}
