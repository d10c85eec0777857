//! Configuration for the paced pipeline.

use crate::pipeline::{PipelineConfig, WaitStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline shape and cadence
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Demo workload driven through the pipeline
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Tokio runtime sizing
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Progress reporting
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Pipeline shape and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Pipelines kept in flight beyond the newest one (0 = fully serial)
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Time each sink holds its turn after emitting, in milliseconds.
    /// Should exceed the summed latency of all stages, otherwise the
    /// emission cadence follows compute time instead.
    #[serde(default = "default_pace_interval_ms")]
    pub pace_interval_ms: u64,

    /// Warn whenever the sequencer has not moved for this long; sinks
    /// queued behind a failed item give up after it. `null` waits forever
    /// without warnings.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: Option<u64>,

    /// How sinks wait for their turn
    #[serde(default)]
    pub sequencer: WaitStrategy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            pace_interval_ms: default_pace_interval_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            sequencer: WaitStrategy::default(),
        }
    }
}

impl PipelineSettings {
    pub fn pace_interval(&self) -> Duration {
        Duration::from_millis(self.pace_interval_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            depth: settings.depth,
            pace_interval: settings.pace_interval(),
            stall_timeout: settings.stall_timeout(),
            wait_strategy: settings.sequencer,
        }
    }
}

/// Demo workload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Number of items to submit
    #[serde(default = "default_items")]
    pub items: u64,

    /// Input payloads are `<input_prefix><index>`
    #[serde(default = "default_input_prefix")]
    pub input_prefix: String,

    /// Transform stages, applied in this order
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            items: default_items(),
            input_prefix: default_input_prefix(),
            stages: default_stages(),
        }
    }
}

impl WorkloadConfig {
    /// Summed latency of every stage.
    pub fn total_stage_latency(&self) -> Duration {
        self.stages
            .iter()
            .map(|s| Duration::from_millis(s.latency_ms))
            .sum()
    }
}

/// One demo stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, appended to the payload
    pub name: String,

    /// Simulated work per item in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

/// Tokio runtime sizing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Async worker threads (None = num CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Upper bound on the blocking pool that runs stage functions
    #[serde(default)]
    pub max_blocking_threads: Option<usize>,
}

/// Progress reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable periodic progress logs and the final summary
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub output_path: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_metrics_interval(),
            output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.pace_interval_ms == 0 {
            anyhow::bail!("Pace interval must be > 0");
        }
        if let Some(stall) = self.pipeline.stall_timeout_ms {
            if stall <= self.pipeline.pace_interval_ms {
                anyhow::bail!(
                    "Stall timeout ({} ms) must exceed the pace interval ({} ms)",
                    stall,
                    self.pipeline.pace_interval_ms
                );
            }
        }
        if let WaitStrategy::Poll { interval } = self.pipeline.sequencer {
            if interval.is_zero() {
                anyhow::bail!("Sequencer poll interval must be > 0");
            }
        }
        if let Some(stage) = self.workload.stages.iter().find(|s| s.name.trim().is_empty()) {
            anyhow::bail!("Stage names must not be empty (latency {} ms)", stage.latency_ms);
        }
        if self.runtime.worker_threads == Some(0) {
            anyhow::bail!("Worker threads must be > 0");
        }
        if self.runtime.max_blocking_threads == Some(0) {
            anyhow::bail!("Max blocking threads must be > 0");
        }
        if self.metrics.enabled && self.metrics.interval_secs == 0 {
            anyhow::bail!("Metrics interval must be > 0");
        }

        let upstream = self.workload.total_stage_latency();
        if upstream >= self.pipeline.pace_interval() {
            tracing::warn!(
                "Stage latency ({:?}) is not below the pace interval ({:?}); emission cadence will be uneven",
                upstream,
                self.pipeline.pace_interval()
            );
        }
        if let Some(stall) = self.pipeline.stall_timeout() {
            let healthy_turn = self.pipeline.pace_interval() + upstream;
            if stall <= healthy_turn {
                tracing::warn!(
                    "Stall timeout ({:?}) does not exceed pace plus stage latency ({:?}); expect stall warnings on a healthy run",
                    stall,
                    healthy_turn
                );
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_depth() -> usize { 2 }
fn default_pace_interval_ms() -> u64 { 1000 }
fn default_stall_timeout_ms() -> Option<u64> { Some(30_000) }
fn default_items() -> u64 { 100 }
fn default_input_prefix() -> String { "Input String ".to_string() }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }

fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig { name: "func1".to_string(), latency_ms: 900 },
        StageConfig { name: "func2".to_string(), latency_ms: 950 },
    ]
}
