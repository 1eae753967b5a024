//! Consumer side of a stream: reading, classifying and pairing records.
//!
//! A single read yields one of three outcomes. Data comes back as records
//! in ring order, transient conditions ask the caller to retry, and
//! everything else ends the drain. Loss resets pairing so no delta is ever
//! computed across a gap.

use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;
use tracing::{debug, warn};

use super::format::FormatDescriptor;
use super::record::{Record, RecordError, Records, Transport};
use super::report::ReportView;
use super::stats::{DrainEvent, DrainStats};
use crate::device::{OaStatus, OaStream, ReadBuf};

/// Records between drain statistics log lines.
const STATS_INTERVAL: u64 = 10_000;

/// How long [`Drainer::run`] waits for data before re-checking its stop
/// condition.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a read should simply be issued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    /// Non-blocking stream with nothing pending.
    WouldBlock,
    /// Interrupted, or only informational status was raised.
    Interrupted,
}

/// Read failures that end a drain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadErrorKind {
    #[error("stream is disabled")]
    Disabled,

    #[error("destination buffer faulted")]
    AccessFault,

    #[error("destination buffer smaller than one record")]
    NoSpace,

    #[error("permission denied")]
    PermissionDenied,

    #[error("stream is closed")]
    Closed,

    #[error("malformed read: {0}")]
    Malformed(#[from] RecordError),

    #[error("device error: {0}")]
    Device(Errno),
}

/// Outcome of a single read.
#[derive(Debug)]
pub enum ReadOutcome<'b> {
    Records(Vec<Record<'b>>),
    Retry(RetryCause),
    Fatal(ReadErrorKind),
}

/// Issue one read into `buf` and classify the result.
///
/// On the raw transport an `EIO` is resolved through the status query:
/// loss flags become loss records, informational flags ask for a retry and
/// no flags at all means the stream was disabled.
pub fn read_records<'b>(
    stream: &dyn OaStream,
    buf: &'b mut [u8],
    format: &'b FormatDescriptor,
) -> ReadOutcome<'b> {
    let transport = stream.transport();
    let n = match stream.read(&mut ReadBuf::new(buf)) {
        Ok(n) => n,
        Err(errno) => return classify_errno(stream, transport, errno),
    };

    let data: &'b [u8] = buf;
    match Records::new(&data[..n], format, transport).collect::<Result<Vec<_>, _>>() {
        Ok(records) => ReadOutcome::Records(records),
        Err(e) => ReadOutcome::Fatal(ReadErrorKind::Malformed(e)),
    }
}

fn classify_errno<'b>(stream: &dyn OaStream, transport: Transport, errno: Errno) -> ReadOutcome<'b> {
    match errno {
        Errno::EAGAIN => ReadOutcome::Retry(RetryCause::WouldBlock),
        Errno::EINTR => ReadOutcome::Retry(RetryCause::Interrupted),
        Errno::EIO if transport == Transport::Raw => status_outcome(stream),
        Errno::EIO => ReadOutcome::Fatal(ReadErrorKind::Disabled),
        Errno::EFAULT => ReadOutcome::Fatal(ReadErrorKind::AccessFault),
        Errno::ENOSPC => ReadOutcome::Fatal(ReadErrorKind::NoSpace),
        Errno::EACCES | Errno::EPERM => ReadOutcome::Fatal(ReadErrorKind::PermissionDenied),
        Errno::EBADF => ReadOutcome::Fatal(ReadErrorKind::Closed),
        other => ReadOutcome::Fatal(ReadErrorKind::Device(other)),
    }
}

fn status_outcome<'b>(stream: &dyn OaStream) -> ReadOutcome<'b> {
    let status = match stream.status() {
        Ok(status) => status,
        Err(Errno::EBADF) => return ReadOutcome::Fatal(ReadErrorKind::Closed),
        Err(e) => return ReadOutcome::Fatal(ReadErrorKind::Device(e)),
    };

    let mut records = Vec::new();
    if status.contains(OaStatus::REPORT_LOST) {
        records.push(Record::ReportLost);
    }
    if status.contains(OaStatus::BUFFER_OVERFLOW) {
        records.push(Record::BufferLost);
    }
    if status.contains(OaStatus::COUNTER_OVERFLOW) {
        warn!("OA counter overflow");
    }
    if status.contains(OaStatus::MMIO_TRG_Q_FULL) {
        warn!("OA MMIO trigger queue full");
    }

    if !records.is_empty() {
        ReadOutcome::Records(records)
    } else if status.is_empty() {
        ReadOutcome::Fatal(ReadErrorKind::Disabled)
    } else {
        ReadOutcome::Retry(RetryCause::Interrupted)
    }
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

/// Tracks the previous sample so consecutive samples form pairs.
pub struct Pairing {
    prev: Vec<u8>,
    has_prev: bool,
    periodic_only: bool,
}

impl Pairing {
    pub fn new(periodic_only: bool) -> Self {
        Self {
            prev: Vec::new(),
            has_prev: false,
            periodic_only,
        }
    }

    /// Feed one sample. Calls `on_pair` with `(previous, current)` when a
    /// previous sample exists.
    pub fn push<F>(&mut self, report: &ReportView<'_>, mut on_pair: F) -> bool
    where
        F: FnMut(&ReportView<'_>, &ReportView<'_>),
    {
        if self.periodic_only && !report.is_periodic() {
            return false;
        }
        let paired = if self.has_prev {
            on_pair(&ReportView::new(&self.prev, report.format()), report);
            true
        } else {
            false
        };
        self.prev.clear();
        self.prev.extend_from_slice(report.as_bytes());
        self.has_prev = true;
        paired
    }

    /// Forget the previous sample.
    pub fn reset(&mut self) {
        self.has_prev = false;
    }

    pub fn has_previous(&self) -> bool {
        self.has_prev
    }
}

// ---------------------------------------------------------------------------
// Drainer
// ---------------------------------------------------------------------------

/// Receives classified records from [`Drainer`].
pub trait DrainHandler {
    fn on_sample(&mut self, _report: &ReportView<'_>) {}

    fn on_pair(&mut self, prev: &ReportView<'_>, cur: &ReportView<'_>);

    fn on_report_lost(&mut self) {}

    fn on_buffer_lost(&mut self) {}

    /// Called once per read with the number of records it returned.
    fn on_batch(&mut self, _records: usize) {}
}

/// What to do when the ring overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Fail,
    Tolerate,
}

/// Errors that end a drain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("read failed: {0}")]
    Read(#[from] ReadErrorKind),

    #[error("OA buffer overflowed")]
    BufferLost,
}

/// Result of one non-blocking drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// One read returned this many records.
    Drained { records: usize },
    /// Nothing pending right now.
    TryLater,
}

/// Reads a stream, splits the bytes and pairs consecutive samples.
pub struct Drainer {
    format: &'static FormatDescriptor,
    buf: Vec<u8>,
    pairing: Pairing,
    stats: Arc<DrainStats>,
    overflow: OverflowPolicy,
    poll_interval: Duration,
    since_report: u64,
}

impl Drainer {
    /// A drainer with a buffer sized for one full ring on `transport`.
    pub fn new(
        format: &'static FormatDescriptor,
        transport: Transport,
        stats: Arc<DrainStats>,
    ) -> Self {
        Self::with_buffer_size(format, transport.read_buffer_size(format), stats)
    }

    pub fn with_buffer_size(
        format: &'static FormatDescriptor,
        buffer_size: usize,
        stats: Arc<DrainStats>,
    ) -> Self {
        Self {
            format,
            buf: vec![0; buffer_size],
            pairing: Pairing::new(false),
            stats,
            overflow: OverflowPolicy::Fail,
            poll_interval: POLL_INTERVAL,
            since_report: 0,
        }
    }

    /// Only timer-triggered samples take part in pairing.
    pub fn periodic_only(mut self, periodic_only: bool) -> Self {
        self.pairing = Pairing::new(periodic_only);
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    /// How long `run` waits for data on a non-blocking stream.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn stats(&self) -> &Arc<DrainStats> {
        &self.stats
    }

    /// Perform one read and dispatch its records.
    ///
    /// Interrupted reads are retried; an empty non-blocking stream returns
    /// [`DrainStatus::TryLater`].
    pub fn drain(
        &mut self,
        stream: &dyn OaStream,
        handler: &mut dyn DrainHandler,
    ) -> Result<DrainStatus, DrainError> {
        let Self {
            format,
            buf,
            pairing,
            stats,
            overflow,
            since_report,
            ..
        } = self;

        loop {
            let records = match read_records(stream, buf, format) {
                ReadOutcome::Records(records) => records,
                ReadOutcome::Retry(RetryCause::Interrupted) => {
                    stats.record(DrainEvent::Retry);
                    continue;
                }
                ReadOutcome::Retry(RetryCause::WouldBlock) => {
                    stats.record(DrainEvent::Retry);
                    return Ok(DrainStatus::TryLater);
                }
                ReadOutcome::Fatal(kind) => return Err(DrainError::Read(kind)),
            };

            let count = records.len();
            handler.on_batch(count);
            for record in records {
                match record {
                    Record::Sample(report) => {
                        stats.record(DrainEvent::Sample);
                        if report.is_periodic() {
                            stats.record(DrainEvent::Periodic);
                        }
                        handler.on_sample(&report);
                        let paired = pairing.push(&report, |prev, cur| handler.on_pair(prev, cur));
                        if paired {
                            stats.record(DrainEvent::Pair);
                        }
                    }
                    Record::ReportLost => {
                        stats.record(DrainEvent::ReportLost);
                        debug!("OA report lost");
                        pairing.reset();
                        handler.on_report_lost();
                    }
                    Record::BufferLost => {
                        stats.record(DrainEvent::BufferLost);
                        warn!("OA buffer overflow detected");
                        pairing.reset();
                        handler.on_buffer_lost();
                        if *overflow == OverflowPolicy::Fail {
                            return Err(DrainError::BufferLost);
                        }
                    }
                }
            }

            *since_report += count as u64;
            if *since_report >= STATS_INTERVAL {
                debug!(
                    samples = stats.total(DrainEvent::Sample),
                    pairs = stats.total(DrainEvent::Pair),
                    report_lost = stats.total(DrainEvent::ReportLost),
                    buffer_lost = stats.total(DrainEvent::BufferLost),
                    "drain stats",
                );
                *since_report = 0;
            }

            return Ok(DrainStatus::Drained { records: count });
        }
    }

    /// Drain until the stream is disabled while `keep_going` is false.
    ///
    /// Returns the number of records dispatched. A disabled stream while
    /// `keep_going` still holds is reported as an error.
    pub fn run<F>(
        &mut self,
        stream: &dyn OaStream,
        handler: &mut dyn DrainHandler,
        keep_going: F,
    ) -> Result<u64, DrainError>
    where
        F: Fn() -> bool,
    {
        let mut total = 0u64;
        loop {
            match self.drain(stream, handler) {
                Ok(DrainStatus::Drained { records }) => total += records as u64,
                Ok(DrainStatus::TryLater) => {
                    if !keep_going() {
                        return Ok(total);
                    }
                    match stream.poll(self.poll_interval) {
                        Ok(_) => {}
                        Err(Errno::EBADF) => return Ok(total),
                        Err(e) => return Err(DrainError::Read(ReadErrorKind::Device(e))),
                    }
                }
                Err(DrainError::Read(ReadErrorKind::Disabled | ReadErrorKind::Closed))
                    if !keep_going() =>
                {
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::device::{MapProt, RingMapping};
    use crate::oa::format::{lookup_id, FormatId, HardwareFamily};
    use crate::oa::record::{encode_marker, encode_sample, RecordType};
    use crate::oa::report::{ReportBuilder, ReportReason};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn fmt() -> &'static FormatDescriptor {
        lookup_id(HardwareFamily::Gen12, FormatId::A32u40A4u32B8C8).unwrap()
    }

    fn sample(ts: u64, reason: ReportReason) -> Vec<u8> {
        let mut b = ReportBuilder::new(fmt());
        b.reason(reason).timestamp(ts);
        b.into_bytes()
    }

    /// Stream double returning a fixed script of read results.
    struct Scripted {
        transport: Transport,
        reads: Mutex<VecDeque<Result<Vec<u8>, Errno>>>,
        status: Mutex<OaStatus>,
    }

    impl Scripted {
        fn new(transport: Transport, reads: Vec<Result<Vec<u8>, Errno>>) -> Self {
            Self {
                transport,
                reads: Mutex::new(reads.into()),
                status: Mutex::new(OaStatus::empty()),
            }
        }
    }

    impl OaStream for Scripted {
        fn transport(&self) -> Transport {
            self.transport
        }

        fn read(&self, buf: &mut ReadBuf<'_>) -> Result<usize, Errno> {
            match self.reads.lock().pop_front() {
                Some(Ok(bytes)) => {
                    buf.mapped_mut()[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(Errno::EAGAIN),
            }
        }

        fn enable(&self) -> Result<(), Errno> {
            Ok(())
        }

        fn disable(&self) -> Result<(), Errno> {
            Ok(())
        }

        fn status(&self) -> Result<OaStatus, Errno> {
            Ok(std::mem::replace(&mut *self.status.lock(), OaStatus::empty()))
        }

        fn poll(&self, _timeout: Duration) -> Result<bool, Errno> {
            Ok(!self.reads.lock().is_empty())
        }

        fn map(&self, _prot: MapProt) -> Result<Arc<dyn RingMapping>, Errno> {
            Err(Errno::ENODEV)
        }

        fn close(&self) {}
    }

    #[derive(Default)]
    struct Collect {
        samples: Vec<u64>,
        pairs: Vec<(u64, u64)>,
        lost: usize,
        overflowed: usize,
    }

    impl DrainHandler for Collect {
        fn on_sample(&mut self, report: &ReportView<'_>) {
            self.samples.push(report.timestamp());
        }

        fn on_pair(&mut self, prev: &ReportView<'_>, cur: &ReportView<'_>) {
            self.pairs.push((prev.timestamp(), cur.timestamp()));
        }

        fn on_report_lost(&mut self) {
            self.lost += 1;
        }

        fn on_buffer_lost(&mut self) {
            self.overflowed += 1;
        }
    }

    fn drainer() -> Drainer {
        Drainer::with_buffer_size(fmt(), 64 * 1024, Arc::new(DrainStats::new()))
    }

    #[test]
    fn test_report_lost_resets_pairing() {
        let mut bytes = Vec::new();
        encode_sample(&mut bytes, &sample(1, ReportReason::TIMER));
        encode_marker(&mut bytes, RecordType::ReportLost);
        encode_sample(&mut bytes, &sample(2, ReportReason::TIMER));
        encode_sample(&mut bytes, &sample(3, ReportReason::TIMER));
        let stream = Scripted::new(Transport::Framed, vec![Ok(bytes)]);

        let mut d = drainer();
        let mut h = Collect::default();
        assert_eq!(
            d.drain(&stream, &mut h).unwrap(),
            DrainStatus::Drained { records: 4 }
        );
        assert_eq!(h.samples, vec![1, 2, 3]);
        assert_eq!(h.pairs, vec![(2, 3)]);
        assert_eq!(h.lost, 1);
        assert_eq!(d.stats().get(DrainEvent::Pair), 1);
    }

    #[test]
    fn test_pairs_span_reads() {
        let mut first = Vec::new();
        encode_sample(&mut first, &sample(10, ReportReason::TIMER));
        let mut second = Vec::new();
        encode_sample(&mut second, &sample(20, ReportReason::TIMER));
        let stream = Scripted::new(Transport::Framed, vec![Ok(first), Err(Errno::EINTR), Ok(second)]);

        let mut d = drainer();
        let mut h = Collect::default();
        d.drain(&stream, &mut h).unwrap();
        d.drain(&stream, &mut h).unwrap();
        assert_eq!(h.pairs, vec![(10, 20)]);
        assert_eq!(d.stats().get(DrainEvent::Retry), 1);
        assert_eq!(d.drain(&stream, &mut h).unwrap(), DrainStatus::TryLater);
    }

    #[test]
    fn test_totals_outlive_window_snapshots() {
        let mut first = Vec::new();
        encode_sample(&mut first, &sample(10, ReportReason::TIMER));
        encode_sample(&mut first, &sample(20, ReportReason::TIMER));
        let mut second = Vec::new();
        encode_sample(&mut second, &sample(30, ReportReason::TIMER));
        let stream = Scripted::new(Transport::Framed, vec![Ok(first), Ok(second)]);

        let mut d = drainer();
        let mut h = Collect::default();
        d.drain(&stream, &mut h).unwrap();
        assert!(d.stats().snapshot().contains(&(DrainEvent::Sample, 2)));
        d.drain(&stream, &mut h).unwrap();

        assert_eq!(d.stats().get(DrainEvent::Sample), 1);
        assert_eq!(d.stats().total(DrainEvent::Sample), 3);
        assert_eq!(d.stats().total(DrainEvent::Pair), 2);
    }

    #[test]
    fn test_periodic_only_pairing() {
        let mut bytes = Vec::new();
        encode_sample(&mut bytes, &sample(1, ReportReason::TIMER));
        encode_sample(&mut bytes, &sample(2, ReportReason::CONTEXT_SWITCH));
        encode_sample(&mut bytes, &sample(3, ReportReason::TIMER));
        let stream = Scripted::new(Transport::Framed, vec![Ok(bytes)]);

        let mut d = drainer().periodic_only(true);
        let mut h = Collect::default();
        d.drain(&stream, &mut h).unwrap();
        assert_eq!(h.samples, vec![1, 2, 3]);
        assert_eq!(h.pairs, vec![(1, 3)]);
    }

    #[test]
    fn test_buffer_lost_policy() {
        let mut bytes = Vec::new();
        encode_sample(&mut bytes, &sample(1, ReportReason::TIMER));
        encode_marker(&mut bytes, RecordType::BufferLost);
        encode_sample(&mut bytes, &sample(2, ReportReason::TIMER));

        let stream = Scripted::new(Transport::Framed, vec![Ok(bytes.clone())]);
        let mut h = Collect::default();
        assert_eq!(drainer().drain(&stream, &mut h), Err(DrainError::BufferLost));

        let stream = Scripted::new(Transport::Framed, vec![Ok(bytes)]);
        let mut h = Collect::default();
        drainer()
            .overflow_policy(OverflowPolicy::Tolerate)
            .drain(&stream, &mut h)
            .unwrap();
        assert_eq!(h.overflowed, 1);
        assert!(h.pairs.is_empty());
    }

    #[test]
    fn test_errno_classification() {
        let cases = [
            (Errno::EIO, ReadErrorKind::Disabled),
            (Errno::EFAULT, ReadErrorKind::AccessFault),
            (Errno::ENOSPC, ReadErrorKind::NoSpace),
            (Errno::EACCES, ReadErrorKind::PermissionDenied),
            (Errno::EBADF, ReadErrorKind::Closed),
            (Errno::ENXIO, ReadErrorKind::Device(Errno::ENXIO)),
        ];
        for (errno, kind) in cases {
            let stream = Scripted::new(Transport::Framed, vec![Err(errno)]);
            let mut buf = vec![0u8; 1024];
            match read_records(&stream, &mut buf, fmt()) {
                ReadOutcome::Fatal(k) => assert_eq!(k, kind),
                other => panic!("{errno}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_raw_eio_consults_status() {
        let stream = Scripted::new(Transport::Raw, vec![Err(Errno::EIO)]);
        *stream.status.lock() = OaStatus::REPORT_LOST | OaStatus::BUFFER_OVERFLOW;
        let mut buf = vec![0u8; 1024];
        match read_records(&stream, &mut buf, fmt()) {
            ReadOutcome::Records(r) => {
                let types: Vec<_> = r.iter().map(Record::record_type).collect();
                assert_eq!(types, vec![RecordType::ReportLost, RecordType::BufferLost]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let stream = Scripted::new(Transport::Raw, vec![Err(Errno::EIO)]);
        *stream.status.lock() = OaStatus::COUNTER_OVERFLOW;
        assert!(matches!(
            read_records(&stream, &mut buf, fmt()),
            ReadOutcome::Retry(RetryCause::Interrupted)
        ));

        let stream = Scripted::new(Transport::Raw, vec![Err(Errno::EIO)]);
        assert!(matches!(
            read_records(&stream, &mut buf, fmt()),
            ReadOutcome::Fatal(ReadErrorKind::Disabled)
        ));
    }

    #[test]
    fn test_malformed_read_is_fatal() {
        let stream = Scripted::new(Transport::Framed, vec![Ok(vec![0xff; 12])]);
        let mut h = Collect::default();
        assert!(matches!(
            drainer().drain(&stream, &mut h),
            Err(DrainError::Read(ReadErrorKind::Malformed(_)))
        ));
    }

    #[test]
    fn test_run_stops_when_disabled() {
        let mut bytes = Vec::new();
        encode_sample(&mut bytes, &sample(1, ReportReason::TIMER));
        encode_sample(&mut bytes, &sample(2, ReportReason::TIMER));
        let stream = Scripted::new(Transport::Framed, vec![Ok(bytes), Err(Errno::EIO)]);

        let mut h = Collect::default();
        let total = drainer().run(&stream, &mut h, || false).unwrap();
        assert_eq!(total, 2);

        let stream = Scripted::new(Transport::Framed, vec![Err(Errno::EIO)]);
        assert_eq!(
            drainer().run(&stream, &mut h, || true),
            Err(DrainError::Read(ReadErrorKind::Disabled))
        );
    }
}
