//! Error types for pipeline execution.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single item's pipeline.
///
/// A failed item never reaches its sink emission. Because the sequencer is
/// strictly ordered, every later item then waits on an index that will never
/// advance. With a stall timeout configured, those waiters give up with
/// [`PipelineError::Stalled`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A transform stage returned an error for this item.
    #[error("stage '{stage}' failed for item {index}: {source}")]
    StageFailed {
        index: u64,
        stage: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A stage or sink task panicked or was cancelled.
    #[error("task for item {index} aborted: {reason}")]
    TaskAborted { index: u64, reason: String },

    /// The sequencer is parked on a failed index below this item's.
    #[error(
        "item {index} stalled after {waited:?}: sequencer stuck at index {next_index} \
         (waiting: {waiting:?})"
    )]
    Stalled {
        index: u64,
        next_index: u64,
        waiting: Vec<u64>,
        waited: Duration,
    },
}

impl PipelineError {
    /// Index of the item this failure belongs to.
    pub fn index(&self) -> u64 {
        match self {
            Self::StageFailed { index, .. }
            | Self::TaskAborted { index, .. }
            | Self::Stalled { index, .. } => *index,
        }
    }

    /// Wrap a stage's error.
    pub fn stage_failed(index: u64, stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::StageFailed {
            index,
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// True for sequencer starvation.
    pub fn is_stall(&self) -> bool {
        matches!(self, Self::Stalled { .. })
    }
}
