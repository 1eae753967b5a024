use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use oastream::config::Config;
use oastream::oa::format::{formats, HardwareFamily};
use oastream::recorder::Recorder;
use oastream::recording::{replay, RecordingReader};

/// GPU OA performance-counter stream recorder.
#[derive(Parser)]
#[command(name = "oastream", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a stream and drain it until interrupted.
    Record,
    /// Print the report format registry.
    Formats {
        /// Only print this family (gen12, dg2, mtl, lnl).
        #[arg(long)]
        family: Option<String>,
    },
    /// Accumulate a recording and print the totals.
    Report {
        /// Recording file written by `record`.
        file: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = &cli.command {
        println!("oastream {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    match cli.command {
        Command::Formats { family } => print_formats(family.as_deref()),
        Command::Report { file } => print_report(&file),
        Command::Record => {
            // Config is required for recording.
            let config_path = cli
                .config
                .context("--config is required (use --help for usage)")?;

            let cfg = Config::load(&config_path)
                .with_context(|| format!("loading config from {}", config_path.display()))?;

            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting oastream",
            );

            // Build and run the tokio runtime.
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;

            rt.block_on(async { run(cfg).await })
        }
        Command::Version => Ok(()),
    }
}

async fn run(cfg: Config) -> Result<()> {
    let duration = cfg.duration;

    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let deadline = async {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
            _ = deadline => {
                tracing::info!("recording duration elapsed, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the recorder.
    let mut recorder = Recorder::new(cfg)?;
    recorder.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    let summary = recorder.stop().await?;

    println!(
        "records: {}  pairs: {}  windows: {}  samples written: {}",
        summary.records, summary.pairs, summary.windows, summary.samples_written,
    );

    tracing::info!("oastream stopped");

    Ok(())
}

fn print_formats(family: Option<&str>) -> Result<()> {
    let families: Vec<HardwareFamily> = match family {
        Some(name) => vec![HardwareFamily::from_str(name)
            .with_context(|| format!("unknown family {name:?}"))?],
        None => HardwareFamily::all().to_vec(),
    };

    for family in families {
        println!("{family} (graphics {}):", family.graphics_version());
        for desc in formats(family) {
            println!(
                "  {:>2} {:<24} {:>4}B {:<8} a40={:<2} a64={:<2} a32={:<2} b={} c={} hdr={}",
                desc.id as u16,
                desc.name,
                desc.size,
                desc.oa_type.as_str(),
                desc.n_a40,
                desc.n_a64,
                desc.n_a,
                desc.n_b,
                desc.n_c,
                if desc.report_hdr_64bit { 64 } else { 32 },
            );
        }
    }

    Ok(())
}

fn print_report(path: &PathBuf) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let summary = replay(RecordingReader::new(BufReader::new(file)))
        .with_context(|| format!("reading recording {}", path.display()))?;

    println!(
        "device {:#06x} rev {} format {} metric set {:?}",
        summary.device.device_id,
        summary.device.revision,
        summary.format.name,
        summary.device.metric_set_name,
    );
    println!(
        "samples: {}  pairs: {}  report lost: {}  buffer lost: {}  correlations: {}",
        summary.samples,
        summary.accumulator.pairs(),
        summary.report_lost,
        summary.buffer_lost,
        summary.correlations,
    );

    let acc = &summary.accumulator;
    for (label, value) in acc.labels().iter().zip(acc.deltas()) {
        println!("  {label:<12} {value}");
    }

    Ok(())
}
