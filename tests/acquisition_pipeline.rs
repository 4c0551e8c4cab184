use ddalab_acquisition::spectrum::{FillPolicy, TransformCache};
use ddalab_acquisition::streaming::source::{FaultScript, SimulatedSource, Waveform};
use ddalab_acquisition::streaming::{
    AcquisitionLoop, AcquisitionState, Block, QualityCounters, ShiftingBuffer, StepOutcome,
    StreamError, SubscriberRegistry,
};
use ddalab_acquisition::AcquisitionConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// 1000 Hz with 1 s blocks and a 5 s buffer: 1000-sample blocks, 5 per cycle
fn cycle_config() -> AcquisitionConfig {
    let mut config = AcquisitionConfig {
        run_id: "pipeline".to_string(),
        sample_rate: 1000.0,
        block_duration_ms: 1000,
        buffer_duration_ms: 5000,
        open_retry_delay_ms: 0,
        reset_delay_ms: 0,
        poll_interval_ms: 0,
        report_every_iterations: 0,
        elevate_priority: false,
        ..Default::default()
    };
    config.generator.waveform = Waveform::Sine;
    config
}

/// Records every window a subscription receives
#[derive(Clone, Default)]
struct Recorder {
    windows: Arc<Mutex<Vec<(u64, usize, QualityCounters)>>>,
}

impl Recorder {
    fn handler(&self) -> impl Fn(&Block) -> anyhow::Result<()> + Send + Sync + 'static {
        let windows = Arc::clone(&self.windows);
        move |block: &Block| {
            windows
                .lock()
                .push((block.end_index, block.len(), block.quality));
            Ok(())
        }
    }

    /// Windows in the order the handler was entered
    fn received(&self) -> Vec<(u64, usize, QualityCounters)> {
        self.windows.lock().clone()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ten_cycles_through_buffer() {
    let every_block = Recorder::default();
    let every_cycle = Recorder::default();

    let mut registry = SubscriberRegistry::new(Duration::from_secs(1), Handle::current());
    registry
        .subscribe(Duration::from_secs(1), every_block.handler())
        .unwrap();
    registry
        .subscribe(Duration::from_secs(5), every_cycle.handler())
        .unwrap();
    let registry = Arc::new(registry);

    let buffer = ShiftingBuffer::new(5000, 1000, 1000.0).unwrap();
    buffer.set_listener(registry.clone());

    // Uneven chunk size so blocks close mid-write
    let stream: Vec<f64> = (0..50_000).map(|i| i as f64).collect();
    for chunk in stream.chunks(700) {
        buffer.write(chunk);
    }
    registry.drain().await;

    assert_eq!(buffer.end_index(), 50);
    assert_eq!(registry.dispatch_count(1), 50);
    assert_eq!(registry.dispatch_count(5), 10);

    let blocks = every_block.received();
    let ends: Vec<u64> = blocks.iter().map(|b| b.0).collect();
    assert_eq!(ends, (1..=50).collect::<Vec<_>>());
    assert!(blocks.iter().all(|(_, len, _)| *len == 1000));

    let cycles = every_cycle.received();
    assert_eq!(cycles.len(), 10);
    let ends: Vec<u64> = cycles.iter().map(|c| c.0).collect();
    assert_eq!(ends, (1..=10).map(|c| c * 5).collect::<Vec<_>>());
    assert!(cycles.iter().all(|(_, len, _)| *len == 5000));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ten_cycles_through_loop() {
    let every_block = Recorder::default();
    let every_cycle = Recorder::default();

    let mut registry = SubscriberRegistry::new(Duration::from_secs(1), Handle::current());
    registry
        .subscribe(Duration::from_secs(1), every_block.handler())
        .unwrap();
    registry
        .subscribe(Duration::from_secs(5), every_cycle.handler())
        .unwrap();
    let registry = Arc::new(registry);

    let (source, source_stats) = SimulatedSource::new(FaultScript {
        chunk_size: 1000,
        ..Default::default()
    });
    let mut acq =
        AcquisitionLoop::new(cycle_config(), Box::new(source), Arc::clone(&registry)).unwrap();
    acq.open().unwrap();

    for _ in 0..50 {
        assert!(matches!(acq.step(), StepOutcome::Wrote { blocks: 1, .. }));
    }
    registry.drain().await;

    let block_ends: Vec<u64> = every_block.received().iter().map(|b| b.0).collect();
    let cycle_ends: Vec<u64> = every_cycle.received().iter().map(|c| c.0).collect();
    assert_eq!(block_ends, (1..=50).collect::<Vec<_>>());
    assert_eq!(cycle_ends, (1..=10).map(|c| c * 5).collect::<Vec<_>>());
    assert_eq!(source_stats.samples_emitted(), 50_000);

    let summary = acq.shutdown();
    assert_eq!(summary.blocks_completed, 50);
    assert_eq!(summary.resets, 0);
    assert_eq!(acq.state(), AcquisitionState::Stopped);
    assert_eq!(source_stats.close_calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_failure_is_bounded() {
    let (source, source_stats) = SimulatedSource::new(FaultScript {
        failing_opens: u32::MAX,
        ..Default::default()
    });
    let registry = Arc::new(SubscriberRegistry::new(
        Duration::from_secs(1),
        Handle::current(),
    ));
    let config = AcquisitionConfig {
        open_retries: 5,
        ..cycle_config()
    };
    let acq = AcquisitionLoop::new(config, Box::new(source), registry).unwrap();

    let result = acq.spawn();

    assert!(matches!(
        result,
        Err(StreamError::SourceOpen { attempts: 5, .. })
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(source_stats.open_calls(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_degraded_block_reaches_consumers() {
    let recorder = Recorder::default();
    let reported: Arc<Mutex<Vec<QualityCounters>>> = Arc::default();

    let mut registry = SubscriberRegistry::new(Duration::from_secs(1), Handle::current());
    registry
        .subscribe(Duration::from_secs(1), recorder.handler())
        .unwrap();
    let sink = Arc::clone(&reported);
    registry.on_buffer_error(move |quality| {
        sink.lock().push(quality);
        Ok(())
    });
    let registry = Arc::new(registry);

    let (source, _source_stats) = SimulatedSource::new(FaultScript {
        chunk_size: 1000,
        degraded: HashMap::from([(3, (12, 4))]),
        ..Default::default()
    });
    let mut acq =
        AcquisitionLoop::new(cycle_config(), Box::new(source), Arc::clone(&registry)).unwrap();
    acq.open().unwrap();

    for _ in 0..4 {
        acq.step();
    }
    registry.drain().await;

    let blocks = recorder.received();
    assert_eq!(blocks.len(), 4);
    for (end_index, _, quality) in &blocks {
        if *end_index == 3 {
            assert!(quality.is_degraded());
            assert_eq!(quality.lost, 12);
            assert_eq!(quality.corrupted, 4);
        } else {
            assert!(!quality.is_degraded(), "block {} flagged", end_index);
        }
    }

    let reported = reported.lock();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].lost, 12);
    assert_eq!(reported[0].corrupted, 4);
    assert_eq!(acq.summary().degraded_reads, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shared_spectrum_cache() {
    let cache = Arc::new(
        TransformCache::new(1000.0, 1024, Duration::from_secs(1), 0.0).unwrap(),
    );
    let peaks: Arc<Mutex<Vec<(u64, f64)>>> = Arc::default();

    let mut registry = SubscriberRegistry::new(Duration::from_secs(1), Handle::current());
    for _ in 0..2 {
        let cache = Arc::clone(&cache);
        let peaks = Arc::clone(&peaks);
        registry
            .subscribe(Duration::from_secs(1), move |block| {
                if let Some(spectrum) = cache.get(block, FillPolicy::ZeroFill)? {
                    peaks
                        .lock()
                        .push((block.end_index, spectrum.peak_frequency().unwrap_or(0.0)));
                }
                Ok(())
            })
            .unwrap();
    }
    let registry = Arc::new(registry);

    let (source, _source_stats) = SimulatedSource::new(FaultScript {
        chunk_size: 1000,
        ..Default::default()
    });
    let mut acq =
        AcquisitionLoop::new(cycle_config(), Box::new(source), Arc::clone(&registry)).unwrap();
    acq.open().unwrap();
    for _ in 0..3 {
        acq.step();
    }
    registry.drain().await;

    // Two consumers per block, one computation per block
    let stats = cache.stats();
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.hits, 3);

    let peaks = peaks.lock();
    assert_eq!(peaks.len(), 6);
    // 10 Hz default generator tone, within one 1000/1024 Hz bin
    let step = 1000.0 / 1024.0;
    assert!(peaks.iter().all(|(_, f)| (f - 10.0).abs() < step), "{:?}", peaks);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_consumer_does_not_stop_acquisition() {
    let healthy = Recorder::default();

    let mut registry = SubscriberRegistry::new(Duration::from_secs(1), Handle::current());
    registry
        .subscribe(Duration::from_secs(1), |_| anyhow::bail!("disk full"))
        .unwrap();
    registry
        .subscribe(Duration::from_secs(1), |_| panic!("consumer bug"))
        .unwrap();
    registry
        .subscribe(Duration::from_secs(1), healthy.handler())
        .unwrap();
    let registry = Arc::new(registry);

    let (source, _source_stats) = SimulatedSource::new(FaultScript {
        chunk_size: 1000,
        ..Default::default()
    });
    let config = AcquisitionConfig {
        poll_interval_ms: 10,
        ..cycle_config()
    };
    let acq = AcquisitionLoop::new(config, Box::new(source), Arc::clone(&registry)).unwrap();
    let handle = acq.spawn().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = tokio::task::spawn_blocking(move || handle.stop())
        .await
        .unwrap()
        .unwrap();
    registry.drain().await;

    assert!(summary.blocks_completed > 0);
    assert_eq!(healthy.received().len() as u64, summary.blocks_completed);
    assert_eq!(registry.failure_count(), 2 * summary.blocks_completed);
}
