//! Pipeline progress and cadence metrics.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug)]
pub struct Metrics {
    /// Items admitted by the controller
    pub items_submitted: AtomicU64,

    /// Items whose sink emitted and released the sequencer
    pub items_emitted: AtomicU64,

    /// Items lost to a stage failure or aborted task
    pub failures: AtomicU64,

    /// Sinks that gave up waiting behind a failed index
    pub stalls: AtomicU64,

    /// Watchdog warnings about an idle sequencer
    pub stall_warnings: AtomicU64,

    /// Pipelines currently between submission and sink completion
    pub in_flight: AtomicU64,

    /// Highest value `in_flight` has reached
    pub peak_in_flight: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    /// Time spent inside stage functions (microseconds, summed across threads)
    pub stage_busy_us: AtomicU64,

    /// Time sinks spent waiting for their turn (microseconds)
    pub sink_wait_us: AtomicU64,

    /// Smallest gap between consecutive emissions (microseconds)
    pub min_emission_gap_us: AtomicU64,

    /// Largest gap between consecutive emissions (microseconds)
    pub max_emission_gap_us: AtomicU64,

    /// Elapsed time of the previous emission (microseconds since start)
    last_emission_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            items_submitted: AtomicU64::new(0),
            items_emitted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            stall_warnings: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            peak_in_flight: AtomicU64::new(0),
            start_time: None,
            stage_busy_us: AtomicU64::new(0),
            sink_wait_us: AtomicU64::new(0),
            min_emission_gap_us: AtomicU64::new(u64::MAX),
            max_emission_gap_us: AtomicU64::new(0),
            last_emission_us: AtomicU64::new(u64::MAX),
        }
    }
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record an admitted item; it counts as in flight until completed.
    pub fn add_submitted(&self) {
        self.items_submitted.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    /// Record the end of an item's pipeline, successful or not.
    pub fn add_completed(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record an emission at `elapsed` since the pipeline start.
    pub fn add_emitted(&self, elapsed: Duration) {
        self.items_emitted.fetch_add(1, Ordering::Relaxed);

        let now_us = elapsed.as_micros() as u64;
        let previous = self.last_emission_us.swap(now_us, Ordering::AcqRel);
        if previous != u64::MAX {
            let gap = now_us.saturating_sub(previous);
            self.min_emission_gap_us.fetch_min(gap, Ordering::Relaxed);
            self.max_emission_gap_us.fetch_max(gap, Ordering::Relaxed);
        }
    }

    /// Record a failure.
    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stalled sink.
    pub fn add_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a watchdog warning.
    pub fn add_stall_warning(&self) {
        self.stall_warnings.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in a stage function.
    pub fn add_stage_time(&self, duration: Duration) {
        self.stage_busy_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time a sink spent waiting for its turn.
    pub fn add_sink_wait_time(&self, duration: Duration) {
        self.sink_wait_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get emissions per second.
    pub fn items_per_second(&self) -> f64 {
        let items = self.items_emitted.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            items as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let min_gap = self.min_emission_gap_us.load(Ordering::Relaxed);
        let min_gap = if min_gap == u64::MAX { 0 } else { min_gap };

        MetricsSnapshot {
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            items_emitted: self.items_emitted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            stall_warnings: self.stall_warnings.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            items_per_second: self.items_per_second(),
            stage_busy_secs: self.stage_busy_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            sink_wait_secs: self.sink_wait_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            min_emission_gap_ms: min_gap as f64 / 1000.0,
            max_emission_gap_ms: self.max_emission_gap_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub items_submitted: u64,
    pub items_emitted: u64,
    pub failures: u64,
    pub stalls: u64,
    pub stall_warnings: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub items_per_second: f64,
    /// Total time spent in stage functions (seconds, summed across threads)
    pub stage_busy_secs: f64,
    /// Total time sinks waited for their turn (seconds, summed across tasks)
    pub sink_wait_secs: f64,
    pub min_emission_gap_ms: f64,
    pub max_emission_gap_ms: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Spread between the slowest and fastest emission gap.
    pub fn jitter_ms(&self) -> f64 {
        if self.items_emitted < 2 {
            0.0
        } else {
            self.max_emission_gap_ms - self.min_emission_gap_ms
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Items: {} submitted, {} emitted | In flight: {} (peak {}) | \
             Rate: {:.2} items/s | Gap: {:.0}-{:.0} ms | \
             Failures: {} | Stalls: {} ({} warnings) | Elapsed: {:.1}s",
            self.items_submitted,
            self.items_emitted,
            self.in_flight,
            self.peak_in_flight,
            self.items_per_second,
            self.min_emission_gap_ms,
            self.max_emission_gap_ms,
            self.failures,
            self.stalls,
            self.stall_warnings,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_items: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_items: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_items,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_items > 0 {
                        snapshot.items_emitted as f64 / self.total_items as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Items submitted: {}", snapshot.items_submitted);
        println!("Items emitted: {}", snapshot.items_emitted);
        println!("Failures: {}", snapshot.failures);
        println!("Stalls: {}", snapshot.stalls);
        println!("Stall warnings: {}", snapshot.stall_warnings);
        println!("Peak in flight: {}", snapshot.peak_in_flight);
        println!("Emission rate: {:.2} items/s", snapshot.items_per_second);

        if snapshot.items_emitted > 1 {
            println!("\n--- Cadence ---");
            println!("Min gap:  {:>8.1} ms", snapshot.min_emission_gap_ms);
            println!("Max gap:  {:>8.1} ms", snapshot.max_emission_gap_ms);
            println!("Jitter:   {:>8.1} ms", snapshot.jitter_ms());
        }

        println!("\n--- Time Breakdown ---");
        println!("Stage work: {:>7.1}s", snapshot.stage_busy_secs);
        println!("Sink wait:  {:>7.1}s", snapshot.sink_wait_secs);
        println!("========================\n");
    }
}
