//! Ordered, paced sink stage.
//!
//! The sink is the last step of every item's pipeline. Sinks for different
//! items start as soon as their upstream stages finish, but each one waits on
//! the [`Sequencer`] so emissions leave in index order, one at a time. After
//! emitting, a sink holds its turn for the pacing interval before releasing
//! it, which spaces consecutive emissions at least `pace_interval` apart no
//! matter how unevenly upstream work completes.

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::pipeline::{Metrics, Pending, Sequencer};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// One visible result.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission<T> {
    pub index: u64,
    pub payload: T,
    /// Time since the pipeline started.
    pub elapsed: Duration,
}

/// Receiver of emissions, called in strictly increasing index order.
pub trait Emitter<T>: Send + Sync {
    fn emit(&self, emission: &Emission<T>);
}

/// Logs each emission as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl<T: Display> Emitter<T> for TracingEmitter {
    fn emit(&self, emission: &Emission<T>) {
        tracing::info!(
            index = emission.index,
            elapsed_ms = emission.elapsed.as_millis() as u64,
            "Sample {} result: {} finished at {} ms",
            emission.index,
            emission.payload,
            emission.elapsed.as_millis()
        );
    }
}

/// Forwards emissions into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter<T> {
    tx: mpsc::UnboundedSender<Emission<T>>,
}

impl<T> ChannelEmitter<T> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Emission<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<T: Clone + Send> Emitter<T> for ChannelEmitter<T> {
    fn emit(&self, emission: &Emission<T>) {
        if self.tx.send(emission.clone()).is_err() {
            tracing::debug!("Emission receiver dropped, discarding item {}", emission.index);
        }
    }
}

/// Everything a sink invocation shares with its siblings.
pub struct SinkContext<T> {
    pub sequencer: Arc<Sequencer>,
    pub emitter: Arc<dyn Emitter<T>>,
    pub clock: Arc<dyn Clock>,
    pub start_time: Instant,
    pub pace_interval: Duration,
    pub metrics: Arc<Metrics>,
}

/// Run the sink for one item.
///
/// Resolves the final stage output, waits for the item's turn, emits, sleeps
/// the pacing interval and only then advances the sequencer. A failed item is
/// marked failed on the sequencer and returns its failure without taking a
/// turn. Returns the emitted index.
pub async fn run_sink<T: Send + 'static>(
    input: Pending<T>,
    ctx: Arc<SinkContext<T>>,
) -> Result<u64, PipelineError> {
    let index = input.index();
    let item = match input.resolve().await {
        Ok(item) => item,
        Err(e) => {
            ctx.sequencer.mark_failed(index);
            return Err(e);
        }
    };

    let wait_start = Instant::now();
    let turn = ctx.sequencer.await_turn(index).await?;
    ctx.metrics.add_sink_wait_time(wait_start.elapsed());

    let (index, payload) = item.into_parts();
    let emission = Emission {
        index,
        payload,
        elapsed: ctx.clock.elapsed_since(ctx.start_time),
    };
    ctx.emitter.emit(&emission);
    ctx.metrics.add_emitted(emission.elapsed);

    tokio::time::sleep(ctx.pace_interval).await;
    turn.advance();

    Ok(index)
}
