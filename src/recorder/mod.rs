use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Backend, Config};
use crate::device::sim::{SimDevice, SimOptions};
use crate::device::OaDevice;
use crate::export::health::HealthMetrics;
use crate::load::{ContextSwitchLoad, LoadGenerator, NoLoad};
use crate::oa::delta::{sanity_check, Accumulator};
use crate::oa::devinfo::DeviceInfo;
use crate::oa::drain::{DrainHandler, Drainer, OverflowPolicy};
use crate::oa::format::FormatDescriptor;
use crate::oa::record::RecordType;
use crate::oa::report::ReportView;
use crate::oa::stats::{DrainEvent, DrainStats};
use crate::recording::{Correlation, DeviceRecord, RecordingError, RecordingWriter};
use crate::session::{OaContext, StreamControl, StreamSession};

/// Totals of a finished recorder run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub records: u64,
    pub pairs: u64,
    pub windows: u64,
    pub samples_written: u64,
}

/// Recorder orchestrates one OA session: device, drain loop, accumulation
/// windows, recording file and health metrics.
pub struct Recorder {
    cfg: Config,
    health: Arc<HealthMetrics>,
    stats: Arc<DrainStats>,
    load: Arc<dyn LoadGenerator>,
    control: Option<StreamControl>,
    task: Option<JoinHandle<Result<RunSummary>>>,
    cancel: CancellationToken,
}

/// Build the device named by the configuration.
///
/// The simulated device is returned separately so callers can drive it.
pub fn build_device(cfg: &Config) -> Result<(Arc<dyn OaDevice>, Option<Arc<SimDevice>>)> {
    match cfg.device.backend {
        Backend::Simulated => {
            let options = SimOptions {
                transport: cfg.device.transport,
                ..SimOptions::default()
            };
            let sim = Arc::new(SimDevice::new(cfg.device.device_info(), options));
            let device: Arc<dyn OaDevice> = sim.clone();
            Ok((device, Some(sim)))
        }
        #[cfg(feature = "xe")]
        Backend::Xe => {
            let device =
                crate::device::xe::XeDevice::open(&cfg.device.path, cfg.device.device_info())
                    .with_context(|| format!("opening {}", cfg.device.path.display()))?;
            Ok((Arc::new(device), None))
        }
        #[cfg(not(feature = "xe"))]
        Backend::Xe => anyhow::bail!("device.backend xe requires the \"xe\" feature"),
    }
}

impl Recorder {
    /// Creates a new Recorder, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            stats: Arc::new(DrainStats::new()),
            load: Arc::new(NoLoad),
            control: None,
            task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the background load started with the stream.
    pub fn with_load(mut self, load: Arc<dyn LoadGenerator>) -> Self {
        self.load = load;
        self
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Open the stream and start draining it.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server.
        if !self.cfg.health.addr.is_empty() {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Device and context.
        let (device, sim) = build_device(&self.cfg)?;
        if let Some(sim) = sim {
            if self.cfg.device.context_switch_every > 0 {
                self.load = Arc::new(ContextSwitchLoad::new(
                    sim,
                    self.cfg.device.context_switch_every,
                ));
            }
        }
        let ctx = OaContext::new(device, self.cfg.policy.paths());
        let family = ctx.family();
        info!(
            family = %family,
            graphics_version = %ctx.info().graphics_version,
            privilege = ?ctx.privilege(),
            "OA device ready",
        );

        // 2. Open the stream disabled, then enable it once the drain loop exists.
        let params = self.cfg.stream.open_params(family)?;
        let session = ctx.open(&params).context("opening OA stream")?;

        let writer = if self.cfg.recording.enabled {
            Some(self.create_writer(&ctx, &session)?)
        } else {
            None
        };

        let drainer = if self.cfg.stream.read_buffer_size > 0 {
            Drainer::with_buffer_size(
                session.format(),
                self.cfg.stream.read_buffer_size,
                Arc::clone(&self.stats),
            )
        } else {
            session.drainer(Arc::clone(&self.stats))
        };
        let mut drainer = drainer
            .periodic_only(true)
            .overflow_policy(OverflowPolicy::Tolerate)
            .poll_interval(self.cfg.stream.poll_timeout);

        let control = session.control();
        control.enable().context("enabling OA stream")?;
        self.health.stream_enabled.set(1.0);
        self.load.start();

        // 3. Drain on a blocking thread until cancelled.
        let mut handler = WindowHandler::new(
            session.device_info().clone(),
            session.format(),
            Arc::clone(&self.health),
            Arc::clone(&self.stats),
            self.cfg.window,
            writer,
        );
        let cancel = self.cancel.clone();

        self.task = Some(tokio::task::spawn_blocking(move || {
            let result = drainer.run(session.stream(), &mut handler, || !cancel.is_cancelled());
            let records = match result {
                Ok(records) => records,
                Err(e) => {
                    session.close();
                    return Err(e).context("draining OA stream");
                }
            };
            session.close();
            handler.finish(records)
        }));
        self.control = Some(control);

        info!(
            format = %params.format,
            exponent = ?params.exponent,
            window = ?self.cfg.window,
            "recorder started",
        );

        Ok(())
    }

    fn create_writer(
        &self,
        ctx: &OaContext,
        session: &StreamSession,
    ) -> Result<RecordingWriter<BufWriter<File>>> {
        let path = &self.cfg.recording.path;
        let file =
            File::create(path).with_context(|| format!("creating recording {}", path.display()))?;
        let name = ctx
            .metric_set_name(session.params().metric_set)
            .unwrap_or_default();
        let mut device = DeviceRecord::new(session.device_info(), session.format(), &name);
        if let Some(engine) = session.params().engine_instance {
            device.engine_instance = u32::from(engine);
        }
        let correlation = Correlation {
            cpu_timestamp: cpu_timestamp_ns(),
            gpu_timestamp: 0,
        };
        let writer =
            RecordingWriter::new(BufWriter::new(file), &device, session.format(), correlation)
                .with_context(|| format!("writing recording header {}", path.display()))?;
        info!(path = %path.display(), "recording to file");
        Ok(writer)
    }

    /// Stop draining, close the stream and return the run totals.
    pub async fn stop(&mut self) -> Result<RunSummary> {
        self.cancel.cancel();

        // A blocked reader only wakes once the stream is disabled.
        if let Some(control) = self.control.take() {
            if let Err(e) = control.disable() {
                debug!(error = %e, "disabling stream on stop");
            }
        }
        self.health.stream_enabled.set(0.0);
        self.load.stop();

        let summary = match self.task.take() {
            Some(task) => task.await.context("joining drain task")??,
            None => RunSummary::default(),
        };

        self.health.observe_drain(&self.stats.snapshot());
        self.health.stop().await?;

        info!(
            records = summary.records,
            pairs = summary.pairs,
            windows = summary.windows,
            samples_written = summary.samples_written,
            "recorder stopped",
        );

        Ok(summary)
    }
}

fn cpu_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Accumulates report pairs into fixed wall-clock windows.
struct WindowHandler {
    info: DeviceInfo,
    accumulator: Accumulator,
    health: Arc<HealthMetrics>,
    stats: Arc<DrainStats>,
    window: Duration,
    window_start: Instant,
    windows: u64,
    pairs: u64,
    writer: Option<RecordingWriter<BufWriter<File>>>,
    correlated: bool,
}

impl WindowHandler {
    fn new(
        info: DeviceInfo,
        format: &'static FormatDescriptor,
        health: Arc<HealthMetrics>,
        stats: Arc<DrainStats>,
        window: Duration,
        writer: Option<RecordingWriter<BufWriter<File>>>,
    ) -> Self {
        Self {
            accumulator: Accumulator::new(format, info.timestamp_width()),
            info,
            health,
            stats,
            window,
            window_start: Instant::now(),
            windows: 0,
            pairs: 0,
            writer,
            correlated: false,
        }
    }

    fn write<F>(&mut self, f: F)
    where
        F: FnOnce(&mut RecordingWriter<BufWriter<File>>) -> Result<(), RecordingError>,
    {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = f(writer) {
            warn!(error = %e, "recording write failed, recording stopped");
            self.writer = None;
        }
    }

    fn maybe_close_window(&mut self) {
        if self.window_start.elapsed() < self.window {
            return;
        }
        self.close_window();
    }

    fn close_window(&mut self) {
        let pairs = self.accumulator.pairs();
        if pairs > 0 {
            let ticks = self.accumulator.ticks();
            let elapsed_ns = self.info.timebase_scale(self.accumulator.timestamp());
            let freq_mhz = if elapsed_ns > 0 { ticks * 1000 / elapsed_ns } else { 0 };
            info!(
                window = self.windows,
                pairs,
                elapsed_ns,
                ticks,
                gpu_mhz = freq_mhz,
                "OA window",
            );
            self.health.accumulated_ticks.set(ticks as f64);
        }
        self.health.observe_drain(&self.stats.snapshot());
        self.accumulator.reset();
        self.window_start = Instant::now();
        self.windows += 1;
    }

    fn finish(mut self, records: u64) -> Result<RunSummary> {
        self.close_window();
        let samples_written = match self.writer.take() {
            Some(writer) => {
                let samples = writer.samples();
                writer.finish().context("flushing recording")?;
                samples
            }
            None => 0,
        };
        Ok(RunSummary {
            records,
            pairs: self.pairs,
            windows: self.windows,
            samples_written,
        })
    }
}

impl DrainHandler for WindowHandler {
    fn on_sample(&mut self, report: &ReportView<'_>) {
        if !self.correlated {
            self.correlated = true;
            let correlation = Correlation {
                cpu_timestamp: cpu_timestamp_ns(),
                gpu_timestamp: report.timestamp(),
            };
            self.write(|w| w.write_correlation(correlation));
        }
        self.write(|w| w.write_sample(report.as_bytes()));
    }

    fn on_pair(&mut self, prev: &ReportView<'_>, cur: &ReportView<'_>) {
        if let Err(e) = sanity_check(prev, cur, &self.info) {
            warn!(error = %e, "OA report pair failed sanity check");
            self.stats.record(DrainEvent::SanityFailure);
        }
        self.accumulator.accumulate(prev, cur);
        self.pairs += 1;
        self.maybe_close_window();
    }

    fn on_report_lost(&mut self) {
        self.write(|w| w.write_marker(RecordType::ReportLost));
    }

    fn on_buffer_lost(&mut self) {
        self.write(|w| w.write_marker(RecordType::BufferLost));
    }

    fn on_batch(&mut self, records: usize) {
        self.health.read_batch_records.observe(records as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    use crate::config::{HealthConfig, RecordingConfig, StreamConfig};
    use crate::recording::{replay, RecordingReader};

    fn test_config(dir: &std::path::Path) -> Config {
        let paranoid = dir.join("paranoid");
        let max_rate = dir.join("max_rate");
        std::fs::write(&paranoid, "0\n").unwrap();
        std::fs::write(&max_rate, "1000000\n").unwrap();

        let mut cfg = Config {
            health: HealthConfig {
                addr: String::new(),
            },
            stream: StreamConfig {
                exponent: Some(8),
                ..Default::default()
            },
            window: Duration::from_millis(20),
            ..Default::default()
        };
        cfg.policy.paranoid_path = paranoid;
        cfg.policy.max_sample_rate_path = max_rate;
        cfg
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recorder_drains_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        let path = dir.path().join("oa.rec");
        cfg.recording = RecordingConfig {
            enabled: true,
            path: path.clone(),
        };

        let mut recorder = Recorder::new(cfg).unwrap();
        recorder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let summary = recorder.stop().await.unwrap();

        assert!(summary.records > 0);
        assert!(summary.pairs > 0);
        assert!(summary.windows >= 1);
        assert!(recorder.health().reports.get() > 0.0);
        assert_eq!(recorder.health().sanity_failures.get(), 0.0);

        let replayed = replay(RecordingReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(replayed.samples, summary.samples_written);
        assert!(replayed.accumulator.pairs() > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recorder_with_context_switches() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.device.context_switch_every = 2;
        cfg.stream.blocking = false;

        let mut recorder = Recorder::new(cfg).unwrap();
        recorder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = recorder.stop().await.unwrap();

        assert!(summary.records > summary.pairs);
        assert_eq!(recorder.health().sanity_failures.get(), 0.0);
    }

    #[cfg(not(feature = "xe"))]
    #[test]
    fn test_xe_backend_requires_feature() {
        let cfg = Config {
            device: crate::config::DeviceConfig {
                backend: Backend::Xe,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = build_device(&cfg).err().unwrap();
        assert!(err.to_string().contains("xe"));
    }
}
