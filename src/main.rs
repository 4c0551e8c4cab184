use clap::Parser;
use ddalab_acquisition::spectrum::TransformCache;
use ddalab_acquisition::streaming::source::{FaultScript, SimulatedSource, Waveform};
use ddalab_acquisition::streaming::{AcquisitionLoop, SubscriberRegistry};
use ddalab_acquisition::AppConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "ddalab-acquire",
    version,
    about = "Acquire blocks from the simulated instrument and fan them out to spectrum consumers"
)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "DDALAB_ACQUIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to acquire before stopping
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,

    /// Delivery intervals in milliseconds, one spectrum consumer each
    #[arg(long, num_args = 1.., default_values_t = vec![1000u64])]
    interval_ms: Vec<u64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(log_level).init();

    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let run_time = run_duration(cli.seconds)?;
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    if config.acquisition.generator.waveform == Waveform::Off {
        config.acquisition.generator.waveform = Waveform::Sine;
    }

    let acquisition = config.acquisition.clone();
    let transform = config.transform.clone();

    let cache = Arc::new(TransformCache::new(
        acquisition.sample_rate,
        transform.transform_size,
        acquisition.block_duration(),
        transform.target_resolution_hz,
    )?);

    let mut registry =
        SubscriberRegistry::new(acquisition.block_duration(), tokio::runtime::Handle::current());

    for interval_ms in &cli.interval_ms {
        let cache = Arc::clone(&cache);
        let fill = transform.fill_policy;
        let label = format!("{}ms", interval_ms);
        let subscription = registry.subscribe(Duration::from_millis(*interval_ms), move |block| {
            match cache.get(block, fill)? {
                Some(spectrum) => log::info!(
                    "[{}] block {} ({} samples{}): peak {:.2} Hz",
                    label,
                    block.end_index,
                    block.len(),
                    if block.is_degraded() { ", degraded" } else { "" },
                    spectrum.peak_frequency().unwrap_or(0.0)
                ),
                None => log::info!("[{}] block {} skipped", label, block.end_index),
            }
            Ok(())
        })?;
        log::info!(
            "Consumer every {:?} ({} blocks)",
            subscription.effective,
            subscription.multiple
        );
    }

    registry.on_buffer_error(|quality| {
        log::warn!(
            "Degraded read: {} lost, {} corrupted of {}",
            quality.lost,
            quality.corrupted,
            quality.total
        );
        Ok(())
    });

    let registry = Arc::new(registry);

    // Offer roughly one poll interval worth of samples per poll
    let chunk_size = ((acquisition.sample_rate * acquisition.poll_interval_ms as f64 / 1000.0)
        .round() as usize)
        .max(1);
    let (source, _source_stats) = SimulatedSource::new(FaultScript {
        chunk_size,
        ..Default::default()
    });

    let mut acq = AcquisitionLoop::new(acquisition, Box::new(source), Arc::clone(&registry))?;
    acq.set_state_callback(|state| log::info!("Acquisition state: {:?}", state));

    let handle = acq.spawn()?;

    let reports = handle.quality_reports();
    let report_task = tokio::task::spawn_blocking(move || {
        for report in reports.iter() {
            let (good, corrupted, lost) = report.ratios();
            log::info!(
                "Quality after {} iterations: {:.1}% good, {:.1}% corrupted, {:.1}% lost",
                report.iterations,
                good * 100.0,
                corrupted * 100.0,
                lost * 100.0
            );
        }
    });

    tokio::time::sleep(run_time).await;

    let summary = tokio::task::spawn_blocking(move || handle.stop()).await??;
    registry.drain().await;
    if let Err(e) = report_task.await {
        log::warn!("Quality report task failed: {}", e);
    }

    let stats = cache.stats();
    log::info!(
        "Summary: {}",
        serde_json::to_string(&summary).unwrap_or_else(|_| format!("{:?}", summary))
    );
    log::info!(
        "Spectrum cache: {} entries, {} hits, {} misses, {} skipped; {} dispatch failures",
        stats.entries,
        stats.hits,
        stats.misses,
        stats.skipped,
        registry.failure_count()
    );

    Ok(())
}

fn run_duration(seconds: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| anyhow::anyhow!("invalid --seconds value {}: {}", seconds, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_duration() {
        assert_eq!(run_duration(2.5).unwrap(), Duration::from_millis(2500));
        assert_eq!(run_duration(0.0).unwrap(), Duration::ZERO);
        assert!(run_duration(f64::INFINITY).is_err());
        assert!(run_duration(f64::NAN).is_err());
        assert!(run_duration(-1.0).is_err());
    }

    #[test]
    fn test_cli_parses_intervals() {
        let cli = Cli::try_parse_from([
            "ddalab-acquire",
            "--seconds",
            "1",
            "--interval-ms",
            "200",
            "1000",
        ])
        .unwrap();
        assert_eq!(cli.interval_ms, vec![200, 1000]);
        assert!(run_duration(cli.seconds).is_ok());
    }
}
