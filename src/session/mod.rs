//! Stream sessions: opening, exclusivity, enable/disable and ring mapping.
//!
//! An [`OaContext`] is built once per device. It owns the registry of
//! claimed OA units and the known metric sets, so every session opened
//! through it is checked against the same shared state.

pub mod metrics_config;
pub mod sysctl;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use self::metrics_config::{ConfigError, MetricSets};
use self::sysctl::{Policy, PolicyPaths};
use crate::device::{
    MapProt, MetricConfigRegs, OaDevice, OaStream, PropertyKey, PropertyList, RingMapping,
};
use crate::oa::delta::{sanity_check, timestamp_delta, SanityError};
use crate::oa::devinfo::DeviceInfo;
use crate::oa::drain::{read_records, Drainer, ReadOutcome};
use crate::oa::exponent::{exponent_to_hz, MAX_OA_EXPONENT};
use crate::oa::format::{lookup, FormatDescriptor, FormatError, FormatId, HardwareFamily};
use crate::oa::report::ReportView;
use crate::oa::stats::DrainStats;

/// Privilege of the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Privileged,
    Unprivileged,
}

impl Privilege {
    /// Privilege of the current process, from its effective uid.
    pub fn current() -> Self {
        if nix::unistd::geteuid().is_root() {
            Self::Privileged
        } else {
            Self::Unprivileged
        }
    }
}

// ---------------------------------------------------------------------------
// Open parameters
// ---------------------------------------------------------------------------

/// Parameters of a stream open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenParams {
    pub oa_unit: u32,
    pub sample_oa: bool,
    pub metric_set: u64,
    /// Raw format id as passed to the device.
    pub format: u64,
    pub exponent: Option<u64>,
    pub disabled: bool,
    pub engine_instance: Option<u16>,
    pub exec_queue: Option<u32>,
    pub blocking: bool,
}

impl OpenParams {
    /// Periodic system-wide sampling of the built-in metric set on unit 0.
    pub fn periodic(format: FormatId, exponent: u32) -> Self {
        Self {
            oa_unit: 0,
            sample_oa: true,
            metric_set: 1,
            format: format as u64,
            exponent: Some(u64::from(exponent)),
            disabled: false,
            engine_instance: None,
            exec_queue: None,
            blocking: true,
        }
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Flat property list for the device open call.
    pub fn to_properties(&self) -> PropertyList {
        let mut props = vec![
            (PropertyKey::OaUnitId as u64, u64::from(self.oa_unit)),
            (PropertyKey::SampleOa as u64, u64::from(self.sample_oa)),
            (PropertyKey::OaMetricSet as u64, self.metric_set),
            (PropertyKey::OaFormat as u64, self.format),
        ];
        if let Some(exp) = self.exponent {
            props.push((PropertyKey::OaPeriodExponent as u64, exp));
        }
        props.push((PropertyKey::OaDisabled as u64, u64::from(self.disabled)));
        if let Some(queue) = self.exec_queue {
            props.push((PropertyKey::ExecQueueId as u64, u64::from(queue)));
        }
        if let Some(instance) = self.engine_instance {
            props.push((PropertyKey::OaEngineInstance as u64, u64::from(instance)));
        }
        props
    }

    /// Parse a flat property list. Unknown or zero keys are rejected.
    pub fn from_properties(props: &[(u64, u64)], blocking: bool) -> Result<Self, OpenError> {
        let mut params = Self {
            oa_unit: 0,
            sample_oa: false,
            metric_set: 0,
            format: 0,
            exponent: None,
            disabled: false,
            engine_instance: None,
            exec_queue: None,
            blocking,
        };
        for &(key, value) in props {
            let narrow = |v: u64| u32::try_from(v).map_err(|_| OpenError::InvalidValue { key, value });
            match PropertyKey::from_u64(key).ok_or(OpenError::UnknownProperty(key))? {
                PropertyKey::OaUnitId => params.oa_unit = narrow(value)?,
                PropertyKey::SampleOa => params.sample_oa = value != 0,
                PropertyKey::OaMetricSet => params.metric_set = value,
                PropertyKey::OaFormat => params.format = value,
                PropertyKey::OaPeriodExponent => params.exponent = Some(value),
                PropertyKey::OaDisabled => params.disabled = value != 0,
                PropertyKey::ExecQueueId => params.exec_queue = Some(narrow(value)?),
                PropertyKey::OaEngineInstance => {
                    params.engine_instance = Some(
                        u16::try_from(value).map_err(|_| OpenError::InvalidValue { key, value })?,
                    );
                }
            }
        }
        Ok(params)
    }
}

/// Reasons a stream open is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    #[error("unknown property key {0}")]
    UnknownProperty(u64),

    #[error("property {key} has out of range value {value}")]
    InvalidValue { key: u64, value: u64 },

    #[error("OA unit {0} does not exist")]
    InvalidOaUnit(u32),

    #[error("SAMPLE_OA was not requested")]
    MissingSampleOa,

    #[error("invalid metric set {0}")]
    InvalidMetricSet(u64),

    #[error("invalid format {raw}: {source}")]
    InvalidFormat { raw: u64, source: FormatError },

    #[error("period exponent {0} exceeds {MAX_OA_EXPONENT}")]
    ExponentTooLarge(u64),

    #[error("neither a period exponent nor an exec queue was given")]
    NoSamplingMode,

    #[error("OA unit {unit} has no engine instance {instance} for {format}")]
    InvalidEngine {
        unit: u32,
        instance: u16,
        format: &'static str,
    },

    #[error("format {format} cannot be sampled on OA unit {unit}")]
    FormatUnitMismatch { unit: u32, format: &'static str },

    #[error("system-wide sampling requires privileges while the paranoid gate is set")]
    SystemWideNotPermitted,

    #[error("sampling at {hz} Hz exceeds the unprivileged limit of {max} Hz")]
    RateNotPermitted { hz: u64, max: u64 },

    #[error("OA unit {0} is already in use")]
    Busy(u32),

    #[error("OA unit {0} is already in use by another exec queue stream")]
    ExecQueueBusy(u32),

    #[error("device refused the stream: {0}")]
    Device(Errno),
}

impl OpenError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::UnknownProperty(_)
            | Self::InvalidValue { .. }
            | Self::InvalidOaUnit(_)
            | Self::MissingSampleOa
            | Self::InvalidMetricSet(_)
            | Self::InvalidFormat { .. }
            | Self::ExponentTooLarge(_)
            | Self::NoSamplingMode
            | Self::InvalidEngine { .. }
            | Self::FormatUnitMismatch { .. } => Errno::EINVAL,
            Self::SystemWideNotPermitted | Self::RateNotPermitted { .. } => Errno::EACCES,
            Self::Busy(_) => Errno::EBUSY,
            Self::ExecQueueBusy(_) => Errno::ENODEV,
            Self::Device(e) => *e,
        }
    }
}

/// Errors from controlling or mapping an open stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,

    #[error("mapping the OA ring requires privileges")]
    PermissionDenied,

    #[error("OA ring can only be mapped read-only, got {0:?}")]
    InvalidProtection(MapProt),

    #[error("device error: {0}")]
    Device(Errno),
}

impl StreamError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::Closed => Errno::EBADF,
            Self::PermissionDenied => Errno::EACCES,
            Self::InvalidProtection(_) => Errno::EINVAL,
            Self::Device(e) => *e,
        }
    }

    fn from_errno(e: Errno) -> Self {
        match e {
            Errno::EBADF => Self::Closed,
            other => Self::Device(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Exclusivity
// ---------------------------------------------------------------------------

/// OA units currently claimed by an open session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    claims: Mutex<HashMap<u32, u64>>,
}

impl SessionRegistry {
    fn claim(self: &Arc<Self>, unit: u32, session: u64) -> Option<ScopeClaim> {
        let mut claims = self.claims.lock();
        if claims.contains_key(&unit) {
            return None;
        }
        claims.insert(unit, session);
        Some(ScopeClaim {
            registry: Arc::clone(self),
            unit,
        })
    }

    /// Session currently holding `unit`.
    pub fn holder(&self, unit: u32) -> Option<u64> {
        self.claims.lock().get(&unit).copied()
    }
}

/// Held for the lifetime of a session; releases the unit when dropped.
struct ScopeClaim {
    registry: Arc<SessionRegistry>,
    unit: u32,
}

impl Drop for ScopeClaim {
    fn drop(&mut self) {
        self.registry.claims.lock().remove(&self.unit);
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Per-device state shared by every session.
pub struct OaContext {
    device: Arc<dyn OaDevice>,
    info: DeviceInfo,
    policy: PolicyPaths,
    privilege: Privilege,
    registry: Arc<SessionRegistry>,
    metric_sets: Mutex<MetricSets>,
    next_session: AtomicU64,
}

impl OaContext {
    pub fn new(device: Arc<dyn OaDevice>, policy: PolicyPaths) -> Self {
        let info = device.info().clone();
        Self {
            device,
            info,
            policy,
            privilege: Privilege::current(),
            registry: Arc::new(SessionRegistry::default()),
            metric_sets: Mutex::new(MetricSets::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Act as a caller with the given privilege.
    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn family(&self) -> HardwareFamily {
        self.info.family
    }

    pub fn device(&self) -> &Arc<dyn OaDevice> {
        &self.device
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Current policy gates. Unreadable policy files fall back to defaults.
    pub fn policy(&self) -> Policy {
        self.policy.load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read stream policy, using defaults");
            Policy {
                paranoid: sysctl::DEFAULT_PARANOID != 0,
                max_sample_rate: sysctl::DEFAULT_MAX_SAMPLE_RATE,
            }
        })
    }

    pub fn metric_set_name(&self, id: u64) -> Option<String> {
        self.metric_sets.lock().name(id).map(str::to_string)
    }

    /// Open a stream from a flat property list.
    pub fn open_properties(
        &self,
        props: &[(u64, u64)],
        blocking: bool,
    ) -> Result<StreamSession, OpenError> {
        if props.iter().any(|&(key, _)| key == 0) {
            return Err(OpenError::UnknownProperty(0));
        }
        self.open(&OpenParams::from_properties(props, blocking)?)
    }

    /// Validate `params`, claim the OA unit and open the stream.
    pub fn open(&self, params: &OpenParams) -> Result<StreamSession, OpenError> {
        let unit = self
            .device
            .oa_units()
            .iter()
            .find(|u| u.id == params.oa_unit)
            .ok_or(OpenError::InvalidOaUnit(params.oa_unit))?;

        if !params.sample_oa {
            return Err(OpenError::MissingSampleOa);
        }

        if params.metric_set == 0
            || params.metric_set == u64::MAX
            || !self.metric_sets.lock().contains(params.metric_set)
        {
            return Err(OpenError::InvalidMetricSet(params.metric_set));
        }

        let format = lookup(self.info.family, params.format).map_err(|source| {
            OpenError::InvalidFormat {
                raw: params.format,
                source,
            }
        })?;

        let exponent = match params.exponent {
            Some(exp) if exp > u64::from(MAX_OA_EXPONENT) => {
                return Err(OpenError::ExponentTooLarge(exp));
            }
            Some(exp) => Some(exp as u32),
            None => None,
        };
        if exponent.is_none() && params.exec_queue.is_none() {
            return Err(OpenError::NoSamplingMode);
        }

        let classes = format.oa_type.engine_classes();
        match params.engine_instance {
            Some(instance) => {
                if !unit
                    .engines
                    .iter()
                    .any(|e| e.instance == instance && classes.contains(&e.class))
                {
                    return Err(OpenError::InvalidEngine {
                        unit: unit.id,
                        instance,
                        format: format.name,
                    });
                }
            }
            None => {
                if !unit.engines.iter().any(|e| classes.contains(&e.class)) {
                    return Err(OpenError::FormatUnitMismatch {
                        unit: unit.id,
                        format: format.name,
                    });
                }
            }
        }

        if self.privilege == Privilege::Unprivileged {
            let policy = self.policy();
            if policy.paranoid && params.exec_queue.is_none() {
                return Err(OpenError::SystemWideNotPermitted);
            }
            if let Some(exp) = exponent {
                let hz = exponent_to_hz(exp, self.info.timestamp_frequency);
                if hz > policy.max_sample_rate {
                    return Err(OpenError::RateNotPermitted {
                        hz,
                        max: policy.max_sample_rate,
                    });
                }
            }
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let claim = self.registry.claim(unit.id, id).ok_or_else(|| {
            if params.exec_queue.is_some() {
                OpenError::ExecQueueBusy(unit.id)
            } else {
                OpenError::Busy(unit.id)
            }
        })?;

        // A failed open drops the claim with it.
        let stream = self
            .device
            .open_stream(&params.to_properties(), params.blocking)
            .map_err(OpenError::Device)?;

        info!(
            session = id,
            oa_unit = unit.id,
            format = format.name,
            ?exponent,
            enabled = !params.disabled,
            "stream opened"
        );

        Ok(StreamSession {
            id,
            stream,
            format,
            info: self.info.clone(),
            params: params.clone(),
            exponent,
            privilege: self.privilege,
            enabled: Arc::new(AtomicBool::new(!params.disabled)),
            alive: Arc::new(AtomicBool::new(true)),
            claim: Some(claim),
        })
    }

    /// Register a user metric configuration and return its metric set id.
    pub fn add_config(&self, config: &MetricConfigRegs) -> Result<u64, ConfigError> {
        self.check_config_permission()?;
        metrics_config::validate(self.info.family, config)?;

        let mut sets = self.metric_sets.lock();
        if sets.id_for_uuid(&config.uuid).is_some() {
            return Err(ConfigError::DuplicateUuid(config.uuid.clone()));
        }
        let id = self.device.add_config(config).map_err(ConfigError::Device)?;
        sets.insert(id, config.uuid.clone());
        debug!(id, uuid = %config.uuid, regs = config.regs.len(), "metric config added");
        Ok(id)
    }

    pub fn remove_config(&self, id: u64) -> Result<(), ConfigError> {
        self.check_config_permission()?;

        let mut sets = self.metric_sets.lock();
        let uuid = sets.remove(id).ok_or(ConfigError::UnknownId(id))?;
        if let Err(e) = self.device.remove_config(id) {
            sets.insert(id, uuid);
            return Err(ConfigError::Device(e));
        }
        debug!(id, %uuid, "metric config removed");
        Ok(())
    }

    fn check_config_permission(&self) -> Result<(), ConfigError> {
        if self.privilege == Privilege::Unprivileged && self.policy().paranoid {
            return Err(ConfigError::PermissionDenied);
        }
        Ok(())
    }
}

impl fmt::Debug for OaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OaContext")
            .field("info", &self.info)
            .field("privilege", &self.privilege)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An open stream with its exclusivity claim.
pub struct StreamSession {
    id: u64,
    stream: Arc<dyn OaStream>,
    format: &'static FormatDescriptor,
    info: DeviceInfo,
    params: OpenParams,
    exponent: Option<u32>,
    privilege: Privilege,
    enabled: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    claim: Option<ScopeClaim>,
}

impl StreamSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> &'static FormatDescriptor {
        self.format
    }

    pub fn params(&self) -> &OpenParams {
        &self.params
    }

    pub fn exponent(&self) -> Option<u32> {
        self.exponent
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn stream(&self) -> &dyn OaStream {
        self.stream.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn enable(&self) -> Result<(), StreamError> {
        self.control().enable()
    }

    pub fn disable(&self) -> Result<(), StreamError> {
        self.control().disable()
    }

    /// A handle that can disable the stream from another thread.
    pub fn control(&self) -> StreamControl {
        StreamControl {
            session: self.id,
            stream: Arc::clone(&self.stream),
            enabled: Arc::clone(&self.enabled),
            alive: Arc::clone(&self.alive),
        }
    }

    /// One read, classified.
    pub fn read<'b>(&self, buf: &'b mut [u8]) -> ReadOutcome<'b> {
        read_records(self.stream.as_ref(), buf, self.format)
    }

    /// A drainer sized for this stream's format and transport.
    pub fn drainer(&self, stats: Arc<DrainStats>) -> Drainer {
        Drainer::new(self.format, self.stream.transport(), stats)
    }

    /// Map the hardware ring read-only.
    pub fn map_ring(&self, prot: MapProt) -> Result<RingView, StreamError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        if self.privilege == Privilege::Unprivileged {
            return Err(StreamError::PermissionDenied);
        }
        if prot.intersects(MapProt::WRITE | MapProt::EXEC) {
            return Err(StreamError::InvalidProtection(prot));
        }
        let mapping = self.stream.map(prot).map_err(StreamError::from_errno)?;
        Ok(RingView {
            mapping,
            format: self.format,
            alive: Arc::clone(&self.alive),
        })
    }

    /// Release the unit and invalidate the handle and its mappings.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.claim.take().is_none() {
            return;
        }
        self.alive.store(false, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
        self.stream.close();
        info!(session = self.id, "stream closed");
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("format", &self.format.name)
            .field("exponent", &self.exponent)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Cloneable enable/disable handle for a session.
#[derive(Clone)]
pub struct StreamControl {
    session: u64,
    stream: Arc<dyn OaStream>,
    enabled: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl StreamControl {
    pub fn enable(&self) -> Result<(), StreamError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        if self.enabled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.stream.enable() {
            self.enabled.store(false, Ordering::Release);
            return Err(StreamError::from_errno(e));
        }
        debug!(session = self.session, "stream enabled");
        Ok(())
    }

    /// Disable the stream. A reader blocked on it returns with an error.
    pub fn disable(&self) -> Result<(), StreamError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.stream.disable() {
            self.enabled.store(true, Ordering::Release);
            return Err(StreamError::from_errno(e));
        }
        debug!(session = self.session, "stream disabled");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Ring mapping
// ---------------------------------------------------------------------------

/// Read-only view of a session's hardware ring.
///
/// The view does not keep the session alive; any access after the session
/// closed panics.
pub struct RingView {
    mapping: Arc<dyn RingMapping>,
    format: &'static FormatDescriptor,
    alive: Arc<AtomicBool>,
}

impl fmt::Debug for RingView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingView")
            .field("format", &self.format.name)
            .field("len", &self.mapping.len())
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

impl RingView {
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Number of report slots in the ring.
    pub fn capacity(&self) -> usize {
        self.len() / self.format.size
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        assert!(self.is_valid(), "OA ring mapping accessed after close");
        assert!(
            offset + dst.len() <= self.len(),
            "read of {} bytes at {offset} past ring end {}",
            dst.len(),
            self.len()
        );
        self.mapping.read_at(offset, dst);
    }

    /// Copy of the report in slot `index`.
    pub fn report(&self, index: usize) -> Vec<u8> {
        let mut out = vec![0; self.format.size];
        self.read_at(index * self.format.size, &mut out);
        out
    }
}

/// Sanity check consecutive timer reports found in a mapped ring.
///
/// Slots are walked in ring order up to the first unwritten slot. Pairs
/// whose timestamps run backwards mark the ring's write position and are
/// skipped. Returns the number of pairs checked.
pub fn check_reports(view: &RingView, devinfo: &DeviceInfo) -> Result<usize, SanityError> {
    let fmt = view.format;
    let half_range = 1u64 << (devinfo.timestamp_width() - 1);
    let mut prev: Option<Vec<u8>> = None;
    let mut checked = 0;

    for index in 0..view.capacity() {
        let bytes = view.report(index);
        let report = ReportView::new(&bytes, fmt);
        if report.raw_reason() == 0 {
            break;
        }
        if !report.is_periodic() {
            continue;
        }
        if let Some(prev_bytes) = &prev {
            let prev_report = ReportView::new(prev_bytes, fmt);
            if timestamp_delta(&prev_report, &report, devinfo.timestamp_width()) < half_range {
                sanity_check(&prev_report, &report, devinfo)?;
                checked += 1;
            }
        }
        prev = Some(bytes);
    }

    Ok(checked)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::device::sim::{SimDevice, SimOptions};
    use crate::device::{OaStatus, ReadBuf};
    use crate::oa::drain::ReadErrorKind;
    use crate::oa::record::Transport;
    use std::path::Path;
    use std::time::Duration;

    const UUID: &str = "01234567-0123-0123-0123-0123456789ab";

    fn context_in(dir: &Path, family: HardwareFamily) -> OaContext {
        let info = DeviceInfo::for_family(family, 96, 19_200_000);
        let device = Arc::new(SimDevice::new(info, SimOptions::default()));
        let paths = PolicyPaths {
            paranoid: dir.join("perf_stream_paranoid"),
            max_sample_rate: dir.join("oa_max_sample_rate"),
        };
        sysctl::write_u64(&paths.paranoid, 1).unwrap();
        sysctl::write_u64(&paths.max_sample_rate, 100_000).unwrap();
        OaContext::new(device, paths).with_privilege(Privilege::Privileged)
    }

    fn params() -> OpenParams {
        OpenParams::periodic(FormatId::A32u40A4u32B8C8, 10)
    }

    #[test]
    fn test_exclusivity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);

        let first = ctx.open(&params()).unwrap();
        assert_eq!(ctx.registry().holder(0), Some(first.id()));
        let err = ctx.open(&params()).unwrap_err();
        assert_eq!(err.errno(), Errno::EBUSY);

        first.close();
        assert_eq!(ctx.registry().holder(0), None);
        ctx.open(&params()).unwrap();
    }

    #[test]
    fn test_drop_releases_claim() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        {
            let _session = ctx.open(&params()).unwrap();
        }
        ctx.open(&params()).unwrap();
    }

    #[test]
    fn test_exec_queue_conflict_is_enodev() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        let _held = ctx.open(&params()).unwrap();
        let mut p = params();
        p.exec_queue = Some(3);
        assert_eq!(ctx.open(&p).unwrap_err().errno(), Errno::ENODEV);
    }

    #[test]
    fn test_invalid_open_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);

        let cases: Vec<(OpenParams, Errno)> = vec![
            (OpenParams { format: 0, ..params() }, Errno::EINVAL),
            (OpenParams { format: u64::MAX, ..params() }, Errno::EINVAL),
            (
                OpenParams {
                    format: FormatId::Pec64u64 as u64,
                    ..params()
                },
                Errno::EINVAL,
            ),
            (OpenParams { metric_set: 0, ..params() }, Errno::EINVAL),
            (OpenParams { metric_set: 99, ..params() }, Errno::EINVAL),
            (OpenParams { metric_set: u64::MAX, ..params() }, Errno::EINVAL),
            (OpenParams { sample_oa: false, ..params() }, Errno::EINVAL),
            (OpenParams { exponent: Some(32), ..params() }, Errno::EINVAL),
            (OpenParams { exponent: None, ..params() }, Errno::EINVAL),
            (OpenParams { oa_unit: 7, ..params() }, Errno::EINVAL),
            (
                OpenParams {
                    engine_instance: Some(5),
                    ..params()
                },
                Errno::EINVAL,
            ),
        ];
        for (p, errno) in cases {
            let err = ctx.open(&p).unwrap_err();
            assert_eq!(err.errno(), errno, "{p:?}: {err}");
        }
        assert_eq!(ctx.registry().holder(0), None);
    }

    #[test]
    fn test_property_list_parsing() {
        let props = params().to_properties();
        assert_eq!(OpenParams::from_properties(&props, true).unwrap(), params());

        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        let mut bad = props.clone();
        bad.push((0, 1));
        assert_eq!(ctx.open_properties(&bad, true).unwrap_err().errno(), Errno::EINVAL);
        let mut bad = props;
        bad.push((42, 1));
        assert_eq!(
            ctx.open_properties(&bad, true).unwrap_err(),
            OpenError::UnknownProperty(42)
        );
    }

    #[test]
    fn test_unprivileged_policy() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12).with_privilege(Privilege::Unprivileged);

        assert_eq!(ctx.open(&params()).unwrap_err(), OpenError::SystemWideNotPermitted);

        sysctl::write_u64(&dir.path().join("perf_stream_paranoid"), 0).unwrap();
        // Exponent 5 at 19.2MHz is 300kHz, above the 100kHz limit.
        let fast = OpenParams::periodic(FormatId::A32u40A4u32B8C8, 5);
        assert_eq!(ctx.open(&fast).unwrap_err().errno(), Errno::EACCES);
        ctx.open(&params()).unwrap();

        // Exponent 6 is 6666ns, which is 150015Hz and just over a 150kHz limit.
        sysctl::write_u64(&dir.path().join("oa_max_sample_rate"), 150_000).unwrap();
        let boundary = OpenParams::periodic(FormatId::A32u40A4u32B8C8, 6);
        assert!(matches!(
            ctx.open(&boundary).unwrap_err(),
            OpenError::RateNotPermitted { hz: 150_015, max: 150_000 }
        ));
        ctx.open(&OpenParams::periodic(FormatId::A32u40A4u32B8C8, 7)).unwrap();
    }

    #[test]
    fn test_enable_disable_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        let session = ctx.open(&params().disabled(true)).unwrap();
        assert!(!session.is_enabled());

        session.enable().unwrap();
        session.enable().unwrap();
        assert!(session.is_enabled());
        session.disable().unwrap();
        session.disable().unwrap();

        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            session.read(&mut buf),
            ReadOutcome::Fatal(ReadErrorKind::Disabled)
        ));
    }

    #[test]
    fn test_disable_unblocks_reader() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        // Exponent 30 is roughly two minutes between reports.
        let session = ctx.open(&OpenParams::periodic(FormatId::A32u40A4u32B8C8, 30)).unwrap();
        let control = session.control();

        let reader = std::thread::spawn(move || {
            let mut buf = vec![0u8; 4096];
            matches!(session.read(&mut buf), ReadOutcome::Fatal(ReadErrorKind::Disabled))
        });
        std::thread::sleep(Duration::from_millis(50));
        control.disable().unwrap();
        assert!(reader.join().unwrap());
    }

    /// Stream whose enable/disable fail until `fail` is cleared.
    struct FlakyStream {
        fail: AtomicBool,
        disables: AtomicU64,
    }

    impl OaStream for FlakyStream {
        fn transport(&self) -> Transport {
            Transport::Framed
        }

        fn read(&self, _buf: &mut ReadBuf<'_>) -> Result<usize, Errno> {
            Err(Errno::EAGAIN)
        }

        fn enable(&self) -> Result<(), Errno> {
            Ok(())
        }

        fn disable(&self) -> Result<(), Errno> {
            if self.fail.load(Ordering::Acquire) {
                return Err(Errno::EIO);
            }
            self.disables.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn status(&self) -> Result<OaStatus, Errno> {
            Ok(OaStatus::empty())
        }

        fn poll(&self, _timeout: Duration) -> Result<bool, Errno> {
            Ok(false)
        }

        fn map(&self, _prot: MapProt) -> Result<Arc<dyn RingMapping>, Errno> {
            Err(Errno::EINVAL)
        }

        fn close(&self) {}
    }

    #[test]
    fn test_failed_disable_keeps_stream_enabled() {
        let stream = Arc::new(FlakyStream {
            fail: AtomicBool::new(true),
            disables: AtomicU64::new(0),
        });
        let control = StreamControl {
            session: 1,
            stream: stream.clone(),
            enabled: Arc::new(AtomicBool::new(true)),
            alive: Arc::new(AtomicBool::new(true)),
        };

        assert!(control.disable().is_err());
        assert!(control.is_enabled());

        // The retry reaches the device instead of short-circuiting.
        stream.fail.store(false, Ordering::Release);
        control.disable().unwrap();
        assert!(!control.is_enabled());
        assert_eq!(stream.disables.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_map_ring_rules() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        let session = ctx.open(&params()).unwrap();

        assert_eq!(
            session.map_ring(MapProt::READ | MapProt::WRITE).unwrap_err().errno(),
            Errno::EINVAL
        );
        assert_eq!(
            session.map_ring(MapProt::READ | MapProt::EXEC).unwrap_err().errno(),
            Errno::EINVAL
        );
        let view = session.map_ring(MapProt::READ).unwrap();
        assert!(view.is_valid());
        session.close();
        assert!(!view.is_valid());

        let ctx = ctx.with_privilege(Privilege::Unprivileged);
        sysctl::write_u64(&dir.path().join("perf_stream_paranoid"), 0).unwrap();
        let session = ctx.open(&params()).unwrap();
        assert_eq!(
            session.map_ring(MapProt::READ).unwrap_err(),
            StreamError::PermissionDenied
        );
    }

    #[test]
    #[should_panic(expected = "accessed after close")]
    fn test_mapping_faults_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        let session = ctx.open(&params()).unwrap();
        let view = session.map_ring(MapProt::READ).unwrap();
        session.close();
        let _ = view.report(0);
    }

    #[test]
    fn test_check_reports_on_mapped_ring() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        let session = ctx.open(&OpenParams::periodic(FormatId::A32u40A4u32B8C8, 5)).unwrap();
        let view = session.map_ring(MapProt::READ).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        let checked = check_reports(&view, ctx.info()).unwrap();
        assert!(checked > 0);
    }

    #[test]
    fn test_user_configs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Gen12);
        let config = MetricConfigRegs {
            uuid: UUID.to_string(),
            regs: vec![(0x9888, 0), (0xe458, 0)],
        };

        let id = ctx.add_config(&config).unwrap();
        assert_eq!(ctx.add_config(&config).unwrap_err().errno(), Errno::EADDRINUSE);

        let mut p = params();
        p.metric_set = id;
        ctx.open(&p).unwrap().close();

        ctx.remove_config(id).unwrap();
        assert_eq!(ctx.remove_config(id).unwrap_err().errno(), Errno::ENOENT);
        assert_eq!(ctx.open(&p).unwrap_err().errno(), Errno::EINVAL);

        let ctx = ctx.with_privilege(Privilege::Unprivileged);
        assert_eq!(ctx.add_config(&config).unwrap_err().errno(), Errno::EACCES);
    }

    #[test]
    fn test_media_unit_formats() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path(), HardwareFamily::Mtl);

        let mut p = OpenParams::periodic(FormatId::OamMpec8u64B8C8, 10);
        assert!(matches!(
            ctx.open(&p).unwrap_err(),
            OpenError::FormatUnitMismatch { unit: 0, .. }
        ));
        p.oa_unit = 1;
        p.engine_instance = Some(0);
        ctx.open(&p).unwrap();
    }
}
