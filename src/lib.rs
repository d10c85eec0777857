//! Paced Pipeline
//!
//! Bounded-depth, multi-stage concurrent pipeline whose sink emits results in
//! submission order at a fixed cadence, however unevenly the upstream stages
//! finish.
//!
//! # Architecture
//!
//! - **Stages**: every item's transform stages run as independent tasks on the
//!   tokio blocking pool, chained through [`pipeline::Pending`] results
//! - **Sequencer**: a shared cursor that lets exactly one sink emit at a time,
//!   in strictly increasing index order
//! - **Sink**: waits for its turn, emits, sleeps the pacing interval, then
//!   hands the cursor on
//! - **Controller**: assigns indices and bounds the number of in-flight item
//!   pipelines to `depth + 1`, blocking submission when the bound is reached
//!
//! # Usage
//!
//! ```no_run
//! use paced_pipeline::{run_pipeline, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod workload;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{
    Emission, Emitter, Item, Metrics, Pipeline, PipelineConfig, PipelineStats, Sequencer, Stage,
    TracingEmitter,
};

use anyhow::Result;
use pipeline::MetricsReporter;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Run the demo workload described by `config`.
pub async fn run_pipeline(config: Config) -> Result<PipelineStats> {
    config.validate()?;

    tracing::info!("Starting paced pipeline");
    tracing::info!(
        "Depth: {}, pace: {} ms, stages: {}, items: {}",
        config.pipeline.depth,
        config.pipeline.pace_interval_ms,
        config.workload.stages.len(),
        config.workload.items
    );

    let metrics = Metrics::new();
    let pipeline = Pipeline::with_clock(
        workload::build_stages(&config.workload),
        Arc::new(TracingEmitter),
        Arc::new(SystemClock),
        metrics.clone(),
        PipelineConfig::from(&config.pipeline),
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = if config.metrics.enabled {
        let reporter = MetricsReporter::new(
            metrics.clone(),
            config.metrics.interval_secs,
            config.workload.items,
        );
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        drop(shutdown_rx);
        None
    };

    let stats = pipeline.run(workload::inputs(&config.workload)).await;

    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    if config.metrics.enabled {
        let reporter = MetricsReporter::new(
            metrics.clone(),
            config.metrics.interval_secs,
            config.workload.items,
        );
        reporter.print_summary();

        if let Some(ref path) = config.metrics.output_path {
            if let Err(e) = metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }
    }

    tracing::info!("Pipeline complete: {}", stats);
    Ok(stats)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(
    worker_threads: Option<usize>,
    max_blocking_threads: Option<usize>,
) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }
    if let Some(threads) = max_blocking_threads {
        builder.max_blocking_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.pipeline.pace_interval_ms = 20;
        config.workload.items = 4;
        config.workload.stages = vec![
            StageConfig { name: "func1".to_string(), latency_ms: 5 },
            StageConfig { name: "func2".to_string(), latency_ms: 6 },
        ];
        config.metrics.enabled = false;
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_pipeline_small_workload() {
        let stats = run_pipeline(small_config()).await.unwrap();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.emitted, 4);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_pipeline_saves_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let mut config = small_config();
        config.metrics.enabled = true;
        config.metrics.interval_secs = 1;
        config.metrics.output_path = Some(path.to_str().unwrap().to_string());

        run_pipeline(config).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["items_emitted"], 4);
        assert_eq!(json["peak_in_flight"], 3);
    }

    #[tokio::test]
    async fn test_run_pipeline_rejects_invalid_config() {
        let mut config = small_config();
        config.pipeline.pace_interval_ms = 0;
        assert!(run_pipeline(config).await.is_err());
    }

    #[test]
    fn test_build_runtime() {
        let runtime = build_runtime(Some(2), Some(8)).unwrap();
        let value = runtime.block_on(async { 7 });
        assert_eq!(value, 7);
    }
}
