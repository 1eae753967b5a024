//! Software OA unit.
//!
//! Reports are produced against a virtual timestamp clock derived from
//! wall time, so a stream behaves like hardware writing into a bounded ring
//! while the consumer drains it. There is no producer thread: every report
//! due so far is generated under the stream lock whenever `read`, `poll`
//! or a ring access looks at the clock. Counter values follow the reference metric
//! set: every A counter grows by at most `n_eus` per tick and the B
//! counters carry the fixed tick ratios.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::{
    EngineRef, MapProt, MetricConfigRegs, OaDevice, OaStatus, OaStream, OaUnitInfo, PropertyKey,
    ReadBuf, RingMapping,
};
use crate::oa::devinfo::DeviceInfo;
use crate::oa::exponent::period_ticks;
use crate::oa::format::{lookup, EngineClass, FormatDescriptor, HardwareFamily};
use crate::oa::record::{RecordHeader, RecordType, Transport, MAX_OA_BUF_SIZE, RECORD_HEADER_SIZE};
use crate::oa::report::{ReportBuilder, ReportReason};

/// Metric set id that always exists on the simulated device.
pub const TEST_OA_METRIC_SET: u64 = 1;

/// Tunables for the simulated device.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub transport: Transport,
    /// Ring capacity in reports. 0 sizes the ring to the 16 MiB reference.
    pub ring_reports: usize,
    /// GPU clock driving the tick counter.
    pub gpu_clock_hz: u64,
    /// Virtual timestamp at stream creation.
    pub timestamp_start: u64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            transport: Transport::Framed,
            ring_reports: 0,
            gpu_clock_hz: 1_000_000_000,
            timestamp_start: 0xffff_0000,
        }
    }
}

/// Simulated device with one render/compute OA unit and, on media-capable
/// families, one media unit.
pub struct SimDevice {
    info: DeviceInfo,
    units: Vec<OaUnitInfo>,
    options: SimOptions,
    configs: Mutex<HashMap<u64, MetricConfigRegs>>,
    next_config_id: AtomicU64,
    ctx_switch_every: Arc<AtomicU32>,
    streams: Mutex<Vec<Weak<Shared>>>,
}

impl SimDevice {
    pub fn new(info: DeviceInfo, options: SimOptions) -> Self {
        let mut units = vec![OaUnitInfo {
            id: 0,
            engines: vec![
                EngineRef {
                    class: EngineClass::Render,
                    instance: 0,
                },
                EngineRef {
                    class: EngineClass::Compute,
                    instance: 0,
                },
            ],
        }];
        if info.family == HardwareFamily::Mtl {
            units.push(OaUnitInfo {
                id: 1,
                engines: vec![
                    EngineRef {
                        class: EngineClass::VideoDecode,
                        instance: 0,
                    },
                    EngineRef {
                        class: EngineClass::VideoEnhance,
                        instance: 0,
                    },
                ],
            });
        }

        Self {
            info,
            units,
            options,
            configs: Mutex::new(HashMap::new()),
            next_config_id: AtomicU64::new(TEST_OA_METRIC_SET + 1),
            ctx_switch_every: Arc::new(AtomicU32::new(0)),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Emit a context-switch report after every `n` timer reports; 0 stops.
    pub fn set_context_switch_every(&self, n: u32) {
        self.ctx_switch_every.store(n, Ordering::Relaxed);
    }

    /// Drop the next due report on every open stream and signal the loss.
    pub fn inject_report_lost(&self) {
        for shared in self.live_streams() {
            let mut state = shared.state.lock();
            shared.advance(&mut state, Instant::now());
            state.drop_next = true;
        }
    }

    fn live_streams(&self) -> Vec<Arc<Shared>> {
        let mut streams = self.streams.lock();
        streams.retain(|w| w.strong_count() > 0);
        streams.iter().filter_map(Weak::upgrade).collect()
    }
}

impl OaDevice for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn oa_units(&self) -> &[OaUnitInfo] {
        &self.units
    }

    fn open_stream(
        &self,
        properties: &[(u64, u64)],
        blocking: bool,
    ) -> Result<Arc<dyn OaStream>, Errno> {
        let mut format = None;
        let mut exponent = None;
        let mut disabled = false;
        let mut exec_queue = None;
        for (key, value) in properties {
            match PropertyKey::from_u64(*key).ok_or(Errno::EINVAL)? {
                PropertyKey::OaFormat => {
                    format = Some(lookup(self.info.family, *value).map_err(|_| Errno::EINVAL)?);
                }
                PropertyKey::OaPeriodExponent => {
                    exponent = Some(u32::try_from(*value).map_err(|_| Errno::EINVAL)?);
                }
                PropertyKey::OaDisabled => disabled = *value != 0,
                PropertyKey::ExecQueueId => {
                    exec_queue = Some(u32::try_from(*value).map_err(|_| Errno::EINVAL)?);
                }
                PropertyKey::OaUnitId
                | PropertyKey::SampleOa
                | PropertyKey::OaMetricSet
                | PropertyKey::OaEngineInstance => {}
            }
        }
        let format = format.ok_or(Errno::EINVAL)?;

        let capacity = if self.options.ring_reports > 0 {
            self.options.ring_reports
        } else {
            MAX_OA_BUF_SIZE / format.size
        };

        let shared = Arc::new(Shared {
            format,
            transport: self.options.transport,
            blocking,
            period: exponent.map(period_ticks),
            ctx_id: exec_queue.unwrap_or(0x1000),
            n_eus: self.info.n_eus,
            timestamp_frequency: self.info.timestamp_frequency.max(1),
            timestamp_width: self.info.timestamp_width(),
            gpu_clock_hz: self.options.gpu_clock_hz,
            ts_origin: self.options.timestamp_start,
            created: Instant::now(),
            capacity,
            ctx_switch_every: Arc::clone(&self.ctx_switch_every),
            state: Mutex::new(SimState {
                enabled: false,
                closed: false,
                next_due: 0,
                timer_count: 0,
                pending: VecDeque::new(),
                pending_samples: 0,
                status: OaStatus::empty(),
                drop_next: false,
                ring: vec![0; capacity * format.size],
                head: 0,
            }),
            cond: Condvar::new(),
        });

        if !disabled {
            let mut state = shared.state.lock();
            shared.start(&mut state, Instant::now());
        }

        self.streams.lock().push(Arc::downgrade(&shared));
        debug!(
            format = format.name,
            ?exponent,
            blocking,
            capacity,
            "simulated stream opened"
        );

        Ok(Arc::new(SimStream { shared }))
    }

    fn add_config(&self, config: &MetricConfigRegs) -> Result<u64, Errno> {
        let id = self.next_config_id.fetch_add(1, Ordering::Relaxed);
        self.configs.lock().insert(id, config.clone());
        Ok(id)
    }

    fn remove_config(&self, id: u64) -> Result<(), Errno> {
        self.configs
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(Errno::ENOENT)
    }
}

enum Pending {
    Sample(Vec<u8>),
    Marker(RecordType),
}

struct SimState {
    enabled: bool,
    closed: bool,
    /// Virtual timestamp of the next timer report.
    next_due: u64,
    timer_count: u64,
    pending: VecDeque<Pending>,
    pending_samples: usize,
    status: OaStatus,
    drop_next: bool,
    ring: Vec<u8>,
    head: usize,
}

struct Shared {
    format: &'static FormatDescriptor,
    transport: Transport,
    blocking: bool,
    period: Option<u64>,
    ctx_id: u32,
    n_eus: u64,
    timestamp_frequency: u64,
    timestamp_width: u32,
    gpu_clock_hz: u64,
    ts_origin: u64,
    created: Instant,
    capacity: usize,
    ctx_switch_every: Arc<AtomicU32>,
    state: Mutex<SimState>,
    cond: Condvar,
}

impl Shared {
    fn virtual_ts(&self, now: Instant) -> u64 {
        let ns = now.saturating_duration_since(self.created).as_nanos();
        self.ts_origin + (ns * u128::from(self.timestamp_frequency) / 1_000_000_000) as u64
    }

    fn instant_of(&self, ts: u64) -> Instant {
        let ticks = ts.saturating_sub(self.ts_origin);
        let ns = u128::from(ticks) * 1_000_000_000 / u128::from(self.timestamp_frequency);
        self.created + Duration::from_nanos(ns as u64)
    }

    fn start(&self, state: &mut SimState, now: Instant) {
        state.enabled = true;
        state.pending.clear();
        state.pending_samples = 0;
        state.status = OaStatus::empty();
        if let Some(period) = self.period {
            let ts = self.virtual_ts(now);
            state.next_due = (ts / period + 1) * period;
        }
    }

    /// Generate every report due up to `now`.
    fn advance(&self, state: &mut SimState, now: Instant) {
        let Some(period) = self.period else {
            return;
        };
        if !state.enabled {
            return;
        }
        let now_ts = self.virtual_ts(now);
        if state.next_due > now_ts {
            return;
        }

        let every = u64::from(self.ctx_switch_every.load(Ordering::Relaxed));
        let due = (now_ts - state.next_due) / period + 1;
        let room = self.capacity.saturating_sub(state.pending_samples) as u64;
        let produced = reports_for(state.timer_count, due, every);
        if produced > room {
            // The ring wrapped before it was drained. Only the newest
            // reports that fit a full ring survive.
            trace!(due, produced, room, "simulated ring overflow");
            state.pending.clear();
            state.pending_samples = 0;
            state.pending.push_back(Pending::Marker(RecordType::BufferLost));

            let capacity = self.capacity as u64;
            let mut keep = due.min(capacity);
            while keep > 0 && reports_for(state.timer_count + due - keep, keep, every) > capacity {
                keep -= 1;
            }
            let skip = due - keep;
            state.next_due += skip * period;
            state.timer_count += skip;
        }

        while state.next_due <= now_ts {
            let ts = state.next_due;
            state.next_due += period;
            state.timer_count += 1;

            if state.drop_next {
                state.drop_next = false;
                state.pending.push_back(Pending::Marker(RecordType::ReportLost));
                continue;
            }
            self.emit(state, ts, ReportReason::TIMER);
            if every > 0 && state.timer_count % every == 0 {
                self.emit(state, ts + period / 2, ReportReason::CONTEXT_SWITCH);
            }
        }
    }

    fn emit(&self, state: &mut SimState, ts: u64, reason: ReportReason) {
        let report = self.build_report(ts, reason);
        if !state.ring.is_empty() {
            let size = self.format.size;
            let off = state.head * size;
            state.ring[off..off + size].copy_from_slice(&report);
            state.head = (state.head + 1) % self.capacity;
        }
        state.pending.push_back(Pending::Sample(report));
        state.pending_samples += 1;
    }

    fn build_report(&self, ts: u64, reason: ReportReason) -> Vec<u8> {
        let fmt = self.format;
        let elapsed = ts - self.ts_origin;
        let ticks =
            (u128::from(elapsed) * u128::from(self.gpu_clock_hz) / u128::from(self.timestamp_frequency)) as u64;
        let ts_mask = if self.timestamp_width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.timestamp_width) - 1
        };
        let per_eu = |i: usize| -> u64 {
            if self.n_eus == 0 {
                0
            } else {
                1 + (i as u64 % self.n_eus.min(4))
            }
        };

        let mut b = ReportBuilder::new(fmt);
        b.reason(reason)
            .timestamp(ts & ts_mask)
            .ticks(ticks & 0xffff_ffff)
            .context_id(Some(self.ctx_id));
        for i in 0..fmt.n_a40 {
            b.counter_40bit(i, ticks.wrapping_mul(per_eu(i)) & ((1 << 40) - 1));
        }
        for i in 0..fmt.n_a64 {
            b.counter_64bit(i, ticks.wrapping_mul(per_eu(i)));
        }
        for i in 0..fmt.n_a {
            b.counter_32bit_a(i, ticks.wrapping_mul(per_eu(i)) as u32);
        }
        const B_RATIOS: [(u64, u64); 8] = [(0, 1), (1, 1), (1, 1), (1, 2), (1, 3), (1, 3), (1, 6), (2, 3)];
        for i in 0..fmt.n_b {
            let (num, den) = B_RATIOS.get(i).copied().unwrap_or((0, 1));
            b.counter_b(i, (ticks * num / den) as u32);
        }
        for i in 0..fmt.n_c {
            b.counter_c(i, (ticks * (i as u64 % 2)) as u32);
        }
        b.into_bytes()
    }

    fn has_data(state: &SimState) -> bool {
        !state.pending.is_empty() || !state.status.is_empty()
    }
}

/// Reports written for the `n` timer periods after `timer_count`, counting
/// the context switches emitted every `every` timer reports.
fn reports_for(timer_count: u64, n: u64, every: u64) -> u64 {
    match every {
        0 => n,
        every => n + (timer_count + n) / every - timer_count / every,
    }
}

/// Stream handle returned by [`SimDevice::open_stream`].
pub struct SimStream {
    shared: Arc<Shared>,
}

impl SimStream {
    fn copy_records(&self, state: &mut SimState, buf: &mut ReadBuf<'_>) -> Result<usize, Errno> {
        let fmt = self.shared.format;
        let mut copied = 0;

        while let Some(front) = state.pending.front() {
            let size = match (front, self.shared.transport) {
                (Pending::Marker(kind), Transport::Raw) => {
                    if copied > 0 {
                        break;
                    }
                    state.status |= match kind {
                        RecordType::BufferLost => OaStatus::BUFFER_OVERFLOW,
                        _ => OaStatus::REPORT_LOST,
                    };
                    state.pending.pop_front();
                    return Err(Errno::EIO);
                }
                (Pending::Marker(_), Transport::Framed) => RECORD_HEADER_SIZE,
                (Pending::Sample(_), transport) => transport.record_size(fmt),
            };

            if copied + size > buf.requested() {
                if copied == 0 {
                    return Err(Errno::ENOSPC);
                }
                break;
            }
            if copied + size > buf.mapped_len() {
                if copied == 0 {
                    return Err(Errno::EFAULT);
                }
                break;
            }

            let dst = &mut buf.mapped_mut()[copied..copied + size];
            match front {
                Pending::Sample(report) => {
                    if self.shared.transport == Transport::Framed {
                        dst[..RECORD_HEADER_SIZE]
                            .copy_from_slice(&RecordHeader::new(RecordType::Sample, fmt.size).encode());
                        dst[RECORD_HEADER_SIZE..].copy_from_slice(report);
                    } else {
                        dst.copy_from_slice(report);
                    }
                    state.pending_samples -= 1;
                }
                Pending::Marker(kind) => {
                    dst.copy_from_slice(&RecordHeader::new(*kind, 0).encode());
                }
            }
            state.pending.pop_front();
            copied += size;
        }

        Ok(copied)
    }
}

impl OaStream for SimStream {
    fn transport(&self) -> Transport {
        self.shared.transport
    }

    fn read(&self, buf: &mut ReadBuf<'_>) -> Result<usize, Errno> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            if state.closed {
                return Err(Errno::EBADF);
            }
            if !state.enabled || shared.period.is_none() {
                return Err(Errno::EIO);
            }
            let now = Instant::now();
            shared.advance(&mut state, now);
            if !state.pending.is_empty() {
                return self.copy_records(&mut state, buf);
            }
            if !state.status.is_empty() {
                return Err(Errno::EIO);
            }
            if !shared.blocking {
                return Err(Errno::EAGAIN);
            }
            let wake = shared.instant_of(state.next_due);
            shared.cond.wait_until(&mut state, wake);
        }
    }

    fn enable(&self) -> Result<(), Errno> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Errno::EBADF);
        }
        if !state.enabled {
            self.shared.start(&mut state, Instant::now());
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    fn disable(&self) -> Result<(), Errno> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Errno::EBADF);
        }
        state.enabled = false;
        self.shared.cond.notify_all();
        Ok(())
    }

    fn status(&self) -> Result<OaStatus, Errno> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Errno::EBADF);
        }
        Ok(std::mem::replace(&mut state.status, OaStatus::empty()))
    }

    fn poll(&self, timeout: Duration) -> Result<bool, Errno> {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;
        let mut state = shared.state.lock();
        loop {
            if state.closed {
                return Err(Errno::EBADF);
            }
            if !state.enabled || shared.period.is_none() {
                return Ok(false);
            }
            let now = Instant::now();
            shared.advance(&mut state, now);
            if Shared::has_data(&state) {
                return Ok(true);
            }
            if now >= deadline {
                return Ok(false);
            }
            let wake = shared.instant_of(state.next_due).min(deadline);
            shared.cond.wait_until(&mut state, wake);
        }
    }

    fn map(&self, prot: MapProt) -> Result<Arc<dyn RingMapping>, Errno> {
        if prot.intersects(MapProt::WRITE | MapProt::EXEC) {
            return Err(Errno::EINVAL);
        }
        if self.shared.state.lock().closed {
            return Err(Errno::EBADF);
        }
        Ok(Arc::new(SimRing {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.enabled = false;
        self.shared.cond.notify_all();
    }
}

struct SimRing {
    shared: Arc<Shared>,
}

impl RingMapping for SimRing {
    fn len(&self) -> usize {
        self.shared.capacity * self.shared.format.size
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let mut state = self.shared.state.lock();
        self.shared.advance(&mut state, Instant::now());
        dst.copy_from_slice(&state.ring[offset..offset + dst.len()]);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::oa::format::FormatId;
    use crate::oa::record::{Record, Records};

    fn device(options: SimOptions) -> SimDevice {
        SimDevice::new(
            DeviceInfo::for_family(HardwareFamily::Gen12, 96, 19_200_000),
            options,
        )
    }

    fn props(exponent: u64, disabled: bool) -> Vec<(u64, u64)> {
        vec![
            (PropertyKey::SampleOa as u64, 1),
            (PropertyKey::OaFormat as u64, FormatId::A32u40A4u32B8C8 as u64),
            (PropertyKey::OaPeriodExponent as u64, exponent),
            (PropertyKey::OaDisabled as u64, u64::from(disabled)),
        ]
    }

    #[test]
    fn test_blocking_read_returns_timer_reports() {
        let dev = device(SimOptions::default());
        let stream = dev.open_stream(&props(10, false), true).unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let n = stream.read(&mut ReadBuf::new(&mut buf)).unwrap();
        assert!(n > 0);
        assert_eq!(n % 264, 0);

        let fmt = crate::oa::format::lookup_id(HardwareFamily::Gen12, FormatId::A32u40A4u32B8C8)
            .unwrap();
        for record in Records::new(&buf[..n], fmt, Transport::Framed) {
            match record.unwrap() {
                Record::Sample(r) => assert!(r.is_periodic()),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_disabled_and_closed_reads() {
        let dev = device(SimOptions::default());
        let stream = dev.open_stream(&props(10, true), false).unwrap();
        let mut buf = vec![0u8; 4096];
        assert_eq!(stream.read(&mut ReadBuf::new(&mut buf)), Err(Errno::EIO));

        stream.enable().unwrap();
        stream.close();
        assert_eq!(stream.read(&mut ReadBuf::new(&mut buf)), Err(Errno::EBADF));
    }

    #[test]
    fn test_overflow_emits_buffer_lost() {
        let dev = device(SimOptions {
            ring_reports: 4,
            ..SimOptions::default()
        });
        let stream = dev.open_stream(&props(5, false), false).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let mut buf = vec![0u8; 64 * 1024];
        let n = stream.read(&mut ReadBuf::new(&mut buf)).unwrap();
        let header = RecordHeader::parse(&buf[..n]).unwrap();
        assert_eq!(header.record_type, RecordType::BufferLost as u32);
    }

    fn count_records(buf: &[u8]) -> (usize, usize) {
        let fmt = crate::oa::format::lookup_id(HardwareFamily::Gen12, FormatId::A32u40A4u32B8C8)
            .unwrap();
        let mut samples = 0;
        let mut lost = 0;
        for record in Records::new(buf, fmt, Transport::Framed) {
            match record.unwrap() {
                Record::Sample(_) => samples += 1,
                Record::BufferLost => lost += 1,
                Record::ReportLost => {}
            }
        }
        (samples, lost)
    }

    #[test]
    fn test_overflow_with_context_switches_fits_ring() {
        let dev = device(SimOptions {
            ring_reports: 4,
            ..SimOptions::default()
        });
        dev.set_context_switch_every(1);
        let stream = dev.open_stream(&props(5, false), false).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let mut buf = vec![0u8; 64 * 1024];
        let n = stream.read(&mut ReadBuf::new(&mut buf)).unwrap();
        let (samples, lost) = count_records(&buf[..n]);
        assert_eq!(lost, 1);
        assert!(samples > 0);
        assert!(samples <= 4, "{samples} samples in a 4 report ring");
    }

    #[test]
    fn test_reports_for_counts_context_switches() {
        assert_eq!(reports_for(0, 10, 0), 10);
        assert_eq!(reports_for(0, 10, 1), 20);
        assert_eq!(reports_for(0, 10, 3), 13);
        assert_eq!(reports_for(2, 1, 3), 2);
        assert_eq!(reports_for(3, 1, 3), 1);
    }

    #[test]
    fn test_blocked_read_wakes_at_next_period() {
        // Exponent 19 is 54.6ms at 19.2MHz.
        let period = Duration::from_nanos(crate::oa::exponent::exponent_to_ns(19, 19_200_000));
        let dev = device(SimOptions::default());
        let stream = dev.open_stream(&props(19, false), true).unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        stream.read(&mut ReadBuf::new(&mut buf)).unwrap();

        // Nothing is due right after a read, so the next one sleeps until
        // the following timer report.
        let start = Instant::now();
        let n = stream.read(&mut ReadBuf::new(&mut buf)).unwrap();
        let waited = start.elapsed();
        assert_eq!(count_records(&buf[..n]), (1, 0));
        assert!(waited >= period / 2, "woke after {waited:?}");
        assert!(waited < period * 20, "woke after {waited:?}");
    }

    #[test]
    fn test_disable_wakes_blocked_reader() {
        // Exponent 24 is about 1.7s between reports.
        let dev = device(SimOptions::default());
        let stream = dev.open_stream(&props(24, false), true).unwrap();
        let reader = {
            let stream = Arc::clone(&stream);
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 4096];
                let start = Instant::now();
                (stream.read(&mut ReadBuf::new(&mut buf)), start.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        stream.disable().unwrap();

        let (result, waited) = reader.join().unwrap();
        assert_eq!(result, Err(Errno::EIO));
        assert!(waited < Duration::from_millis(1_000), "woke after {waited:?}");
    }

    #[test]
    fn test_raw_transport_signals_loss_through_status() {
        let dev = device(SimOptions {
            transport: Transport::Raw,
            ..SimOptions::default()
        });
        let stream = dev.open_stream(&props(10, false), true).unwrap();
        dev.inject_report_lost();
        let mut buf = vec![0u8; 256 * 1024];
        let mut saw_loss = false;
        for _ in 0..1000 {
            match stream.read(&mut ReadBuf::new(&mut buf)) {
                Ok(n) => assert_eq!(n % 256, 0),
                Err(Errno::EIO) => {
                    assert_eq!(stream.status().unwrap(), OaStatus::REPORT_LOST);
                    saw_loss = true;
                    break;
                }
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert!(saw_loss);
        assert_eq!(stream.status().unwrap(), OaStatus::empty());
    }

    #[test]
    fn test_map_rejects_write_and_exec() {
        let dev = device(SimOptions::default());
        let stream = dev.open_stream(&props(10, false), false).unwrap();
        assert!(matches!(stream.map(MapProt::READ | MapProt::WRITE), Err(Errno::EINVAL)));
        assert!(matches!(stream.map(MapProt::READ | MapProt::EXEC), Err(Errno::EINVAL)));
        let ring = stream.map(MapProt::READ).unwrap();
        assert_eq!(ring.len(), MAX_OA_BUF_SIZE);
    }

    #[test]
    fn test_config_ids() {
        let dev = device(SimOptions::default());
        let regs = MetricConfigRegs {
            uuid: "01234567-0123-0123-0123-0123456789ab".to_string(),
            regs: vec![(0x9888, 0)],
        };
        let id = dev.add_config(&regs).unwrap();
        assert!(id > TEST_OA_METRIC_SET);
        dev.remove_config(id).unwrap();
        assert_eq!(dev.remove_config(id), Err(Errno::ENOENT));
    }
}
