//! Ordered concurrent pipeline: stages, order gate, paced sink and controller.

mod controller;
mod item;
mod metrics;
mod sequencer;
mod sink;
mod stage;

#[cfg(test)]
mod controller_integration_tests;

pub use controller::{Pipeline, PipelineConfig, PipelineStats};
pub use item::Item;
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use sequencer::{Sequencer, Turn, WaitStrategy};
pub use sink::{run_sink, ChannelEmitter, Emission, Emitter, SinkContext, TracingEmitter};
pub use stage::{stage_fn, FnStage, Pending, Stage, StageExecutor};
