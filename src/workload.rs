//! Demo workload: string payloads through fixed-latency labelling stages.

use crate::config::{StageConfig, WorkloadConfig};
use crate::pipeline::Stage;
use std::sync::Arc;
use std::time::Duration;

/// Simulates work by blocking for `latency`, then appends ` <name>`.
#[derive(Debug, Clone)]
pub struct LabelStage {
    name: String,
    latency: Duration,
}

impl LabelStage {
    pub fn new(name: impl Into<String>, latency: Duration) -> Self {
        Self {
            name: name.into(),
            latency,
        }
    }
}

impl From<&StageConfig> for LabelStage {
    fn from(config: &StageConfig) -> Self {
        Self::new(config.name.clone(), Duration::from_millis(config.latency_ms))
    }
}

impl Stage<String> for LabelStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _index: u64, payload: String) -> anyhow::Result<String> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        Ok(format!("{} {}", payload, self.name))
    }
}

/// Stages described by the workload, in order.
pub fn build_stages(config: &WorkloadConfig) -> Vec<Arc<dyn Stage<String>>> {
    config
        .stages
        .iter()
        .map(|s| Arc::new(LabelStage::from(s)) as Arc<dyn Stage<String>>)
        .collect()
}

/// Payloads for every item of the workload.
pub fn inputs(config: &WorkloadConfig) -> impl Iterator<Item = String> + '_ {
    (0..config.items).map(move |i| format!("{}{}", config.input_prefix, i))
}
