//! Transform stages and their concurrent executor.
//!
//! Every stage invocation runs as its own task. A stage task first awaits the
//! [`Pending`] result of the previous stage, then runs the stage function on
//! the tokio blocking pool (stages may block for arbitrary time), and
//! resolves to the transformed item:
//!
//! ```text
//! Pending::ready ──▶ stage 1 task ──▶ stage 2 task ──▶ ... ──▶ sink
//!                  (await, apply)   (await, apply)
//! ```
//!
//! Chains of different items are independent, so their stages overlap freely
//! and finish in any order.

use crate::error::PipelineError;
use crate::pipeline::{Item, Metrics};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// A transform applied to every item's payload.
///
/// Implementations must be safe to call concurrently for different items.
pub trait Stage<T>: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Transform the payload of item `index`.
    fn apply(&self, index: u64, payload: T) -> anyhow::Result<T>;
}

/// [`Stage`] backed by a closure.
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> FnStage<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<T, F> Stage<T> for FnStage<F>
where
    F: Fn(u64, T) -> anyhow::Result<T> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, index: u64, payload: T) -> anyhow::Result<T> {
        (self.f)(index, payload)
    }
}

/// Shorthand for a shared closure stage.
pub fn stage_fn<T, F>(name: impl Into<String>, f: F) -> Arc<dyn Stage<T>>
where
    T: 'static,
    F: Fn(u64, T) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(FnStage::new(name, f))
}

enum PendingState<T> {
    Resolved(Result<Item<T>, PipelineError>),
    Running(JoinHandle<Result<Item<T>, PipelineError>>),
}

/// Result of a stage that may still be running.
pub struct Pending<T> {
    index: u64,
    state: PendingState<T>,
}

impl<T: Send + 'static> Pending<T> {
    /// An already available input.
    pub fn ready(item: Item<T>) -> Self {
        Self {
            index: item.index(),
            state: PendingState::Resolved(Ok(item)),
        }
    }

    /// Index of the item this result belongs to.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Wait for the result.
    pub async fn resolve(self) -> Result<Item<T>, PipelineError> {
        match self.state {
            PendingState::Resolved(result) => result,
            PendingState::Running(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::TaskAborted {
                    index: self.index,
                    reason: e.to_string(),
                }),
            },
        }
    }
}

/// Runs one stage for many items concurrently.
pub struct StageExecutor<T> {
    stage: Arc<dyn Stage<T>>,
    metrics: Arc<Metrics>,
}

impl<T: Send + 'static> StageExecutor<T> {
    pub fn new(stage: Arc<dyn Stage<T>>, metrics: Arc<Metrics>) -> Self {
        Self { stage, metrics }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    /// Schedule this stage on `input` and return immediately.
    ///
    /// The returned [`Pending`] carries the stage output, or the upstream or
    /// stage failure. A failed input is forwarded without calling the stage.
    pub fn run(&self, input: Pending<T>) -> Pending<T> {
        let index = input.index();
        let stage = self.stage.clone();
        let metrics = self.metrics.clone();

        let handle = tokio::spawn(async move {
            let item = input.resolve().await?;
            let name = stage.name().to_string();

            let result = tokio::task::spawn_blocking(move || {
                let start = Instant::now();
                let result = item.try_map(|index, payload| stage.apply(index, payload));
                metrics.add_stage_time(start.elapsed());
                result
            })
            .await;

            match result {
                Ok(Ok(item)) => Ok(item),
                Ok(Err(e)) => {
                    tracing::warn!("Stage '{}' failed for item {}: {:#}", name, index, e);
                    Err(PipelineError::stage_failed(index, name, e))
                }
                Err(e) => {
                    tracing::warn!("Stage '{}' task for item {} aborted: {}", name, index, e);
                    Err(PipelineError::TaskAborted {
                        index,
                        reason: format!("stage '{}': {}", name, e),
                    })
                }
            }
        });

        Pending {
            index,
            state: PendingState::Running(handle),
        }
    }
}
