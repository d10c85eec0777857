//! Submission, admission control and draining.
//!
//! The controller assigns indices, wires each item through the stage
//! executors into a sink task, and keeps the sink handles in a bounded queue.
//! When the queue grows past `depth`, `submit` awaits the oldest handle before
//! returning, so at most `depth + 1` item pipelines are ever active and a
//! burst of submissions turns into backpressure on the caller.

use crate::clock::{Clock, SystemClock};
use crate::error::PipelineError;
use crate::pipeline::{
    run_sink, Emitter, Item, Metrics, Pending, Sequencer, SinkContext, Stage, StageExecutor,
    WaitStrategy,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Configuration for the pipeline controller.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of pipelines allowed to stay in flight beyond the newest one
    pub depth: usize,

    /// Pause held by each sink after emitting, before releasing its turn
    pub pace_interval: Duration,

    /// Warn whenever the sequencer has not moved for this long; waiters
    /// behind a failed index give up after it
    pub stall_timeout: Option<Duration>,

    /// How sinks wait for their turn
    pub wait_strategy: WaitStrategy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            pace_interval: Duration::from_millis(1000),
            stall_timeout: None,
            wait_strategy: WaitStrategy::Notify,
        }
    }
}

struct InFlight {
    index: u64,
    handle: JoinHandle<Result<u64, PipelineError>>,
}

/// Bounded-depth pipeline with an ordered, paced sink.
pub struct Pipeline<T> {
    executors: Vec<StageExecutor<T>>,
    sink: Arc<SinkContext<T>>,
    in_flight: VecDeque<InFlight>,
    next_index: u64,
    config: PipelineConfig,
    metrics: Arc<Metrics>,
    stats: PipelineStats,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Create a pipeline using the system clock.
    pub fn new(
        stages: Vec<Arc<dyn Stage<T>>>,
        emitter: Arc<dyn Emitter<T>>,
        config: PipelineConfig,
    ) -> Self {
        Self::with_clock(stages, emitter, Arc::new(SystemClock), Metrics::new(), config)
    }

    /// Create a pipeline with an explicit clock and metrics sink.
    ///
    /// The clock reading taken here is the start time emissions are measured
    /// against.
    pub fn with_clock(
        stages: Vec<Arc<dyn Stage<T>>>,
        emitter: Arc<dyn Emitter<T>>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        config: PipelineConfig,
    ) -> Self {
        let executors = stages
            .into_iter()
            .map(|stage| StageExecutor::new(stage, metrics.clone()))
            .collect();

        let sequencer = Sequencer::new(config.wait_strategy)
            .with_stall_timeout(config.stall_timeout)
            .with_metrics(metrics.clone());
        let start_time = clock.now();
        let sink = Arc::new(SinkContext {
            sequencer: Arc::new(sequencer),
            emitter,
            clock,
            start_time,
            pace_interval: config.pace_interval,
            metrics: metrics.clone(),
        });

        Self {
            executors,
            sink,
            in_flight: VecDeque::with_capacity(config.depth + 1),
            next_index: 0,
            config,
            metrics,
            stats: PipelineStats::default(),
        }
    }

    /// Admit one item.
    ///
    /// Returns the index assigned to `payload`. If admitting it pushed the
    /// queue past `depth`, the oldest pipeline is awaited first; when that
    /// pipeline failed its error is returned instead. The new item is admitted
    /// either way.
    pub async fn submit(&mut self, payload: T) -> Result<u64, PipelineError> {
        let index = self.next_index;
        self.next_index += 1;

        let mut pending = Pending::ready(Item::new(index, payload));
        for executor in &self.executors {
            pending = executor.run(pending);
        }

        self.metrics.add_submitted();
        self.stats.submitted += 1;

        let sink = self.sink.clone();
        let metrics = self.metrics.clone();
        let handle = tokio::spawn(async move {
            let result = run_sink(pending, sink).await;
            metrics.add_completed();
            result
        });

        self.in_flight.push_back(InFlight { index, handle });
        tracing::info!("Enqueued sample: {} ({} in flight)", index, self.in_flight.len());

        let mut first_error = None;
        while self.in_flight.len() > self.config.depth {
            let Some(oldest) = self.in_flight.pop_front() else {
                break;
            };
            if let Err(e) = self.reclaim(oldest).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(index),
        }
    }

    /// Await every admitted pipeline in submission order.
    ///
    /// All handles are awaited even after a failure; the first failure is
    /// returned.
    pub async fn drain(&mut self) -> Result<(), PipelineError> {
        tracing::debug!("Draining {} in-flight items", self.in_flight.len());

        let mut first_error = None;
        while let Some(oldest) = self.in_flight.pop_front() {
            if let Err(e) = self.reclaim(oldest).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Submit every input, then drain.
    ///
    /// Failures are logged and counted rather than returned.
    pub async fn run<I>(mut self, inputs: I) -> PipelineStats
    where
        I: IntoIterator<Item = T>,
    {
        for payload in inputs {
            if let Err(e) = self.submit(payload).await {
                tracing::error!("{}", e);
            }
        }

        tracing::info!("Waiting to finish...");
        if let Err(e) = self.drain().await {
            tracing::error!("{}", e);
        }

        tracing::info!("Finished: {}", self.stats);
        self.stats
    }

    async fn reclaim(&mut self, entry: InFlight) -> Result<u64, PipelineError> {
        let result = match entry.handle.await {
            Ok(result) => result,
            Err(e) => {
                // Sink task died before it could record completion.
                self.metrics.add_completed();
                Err(PipelineError::TaskAborted {
                    index: entry.index,
                    reason: e.to_string(),
                })
            }
        };

        match &result {
            Ok(_) => self.stats.emitted += 1,
            Err(e) if e.is_stall() => {
                self.metrics.add_stall();
                self.stats.stalled += 1;
            }
            Err(e) => {
                tracing::warn!("Item {} failed: {}", entry.index, e);
                self.metrics.add_failure();
                self.stats.failed += 1;
            }
        }

        result
    }

    /// Number of admitted pipelines not yet reclaimed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Index the next submission will receive.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sink.sequencer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }
}

/// Outcome counts for reclaimed pipelines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// Items admitted
    pub submitted: u64,

    /// Items that emitted
    pub emitted: u64,

    /// Items lost to a stage failure or aborted task
    pub failed: u64,

    /// Items that gave up behind a failed index
    pub stalled: u64,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Emitted: {}, Failed: {}, Stalled: {}, Submitted: {}",
            self.emitted, self.failed, self.stalled, self.submitted
        )
    }
}
