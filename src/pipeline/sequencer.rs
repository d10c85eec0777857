//! Order gate in front of the sink.
//!
//! The sequencer holds a single cursor, `next_index`. A sink for index `k`
//! may emit only while the cursor equals `k`, and moves it to `k + 1` once its
//! emission and pacing are complete. Since indices are assigned in order and
//! never reused, at most one waiter matches the cursor at any time, which
//! makes the emission section exclusive without holding a lock across it.
//!
//! Every submitted index must eventually take and release its turn. An index
//! that never does (its pipeline failed or hung) blocks all greater indices
//! forever. The sequencer never repairs this. With a stall timeout, waiters
//! log a warning each time the cursor sits idle for that long and keep
//! waiting. They only give up, with [`PipelineError::Stalled`], once the
//! cursor is parked on an index marked through [`Sequencer::mark_failed`].

use crate::error::PipelineError;
use crate::pipeline::Metrics;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// How waiters learn that the cursor moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Re-check the cursor after sleeping `interval` between checks.
    Poll {
        #[serde(rename = "interval_us", with = "micros", default = "default_poll_interval")]
        interval: Duration,
    },
    /// Sleep until the cursor is advanced.
    Notify,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::Notify
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_micros(1)
}

mod micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

/// Shared cursor deciding which sink may emit next.
#[derive(Debug)]
pub struct Sequencer {
    next_index: AtomicU64,
    notify: Notify,
    strategy: WaitStrategy,
    stall_timeout: Option<Duration>,
    /// Indices currently waiting for their turn.
    waiting: DashSet<u64>,
    /// Indices whose pipeline failed before reaching the sink.
    failed: DashSet<u64>,
    epoch: Instant,
    /// Microseconds since `epoch` at which the cursor last moved.
    last_advance_us: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl Sequencer {
    pub fn new(strategy: WaitStrategy) -> Self {
        Self {
            next_index: AtomicU64::new(0),
            notify: Notify::new(),
            strategy,
            stall_timeout: None,
            waiting: DashSet::new(),
            failed: DashSet::new(),
            epoch: Instant::now(),
            last_advance_us: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Warn whenever the cursor has not moved for `timeout`.
    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Count stall warnings in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Record that `index` will never take its turn.
    pub fn mark_failed(&self, index: u64) {
        self.failed.insert(index);
        self.notify.notify_waiters();
    }

    /// Indices marked as failed, ascending.
    pub fn failed(&self) -> Vec<u64> {
        let mut failed: Vec<u64> = self.failed.iter().map(|i| *i).collect();
        failed.sort_unstable();
        failed
    }

    /// Index allowed to emit next.
    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }

    /// Indices blocked in [`Sequencer::await_turn`], ascending.
    pub fn waiting(&self) -> Vec<u64> {
        let mut waiting: Vec<u64> = self.waiting.iter().map(|i| *i).collect();
        waiting.sort_unstable();
        waiting
    }

    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Wait until `index` is the next index to emit.
    ///
    /// The returned [`Turn`] must be released with [`Turn::advance`] once the
    /// caller's emission work is finished.
    pub async fn await_turn(&self, index: u64) -> Result<Turn<'_>, PipelineError> {
        if self.next_index() == index {
            return Ok(Turn { sequencer: self, index });
        }

        let _waiting = WaitingGuard::new(&self.waiting, index);
        let started = Instant::now();
        match self.strategy {
            WaitStrategy::Poll { interval } => self.poll_until(index, interval, started).await?,
            WaitStrategy::Notify => self.notified_until(index, started).await?,
        }

        Ok(Turn { sequencer: self, index })
    }

    async fn poll_until(
        &self,
        index: u64,
        interval: Duration,
        started: Instant,
    ) -> Result<(), PipelineError> {
        let mut reported = started;
        while self.next_index() != index {
            self.check_stall(index, started, &mut reported)?;
            tokio::time::sleep(interval).await;
        }
        Ok(())
    }

    async fn notified_until(&self, index: u64, started: Instant) -> Result<(), PipelineError> {
        let mut reported = started;
        loop {
            // Register before checking so an advance between the check and
            // the await still wakes us.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if self.next_index() == index {
                return Ok(());
            }
            self.check_stall(index, started, &mut reported)?;

            match self.stall_timeout {
                Some(timeout) => {
                    let _ = tokio::time::timeout(timeout, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Watchdog for a waiter that has seen the cursor idle for the stall
    /// timeout.
    ///
    /// Idle time counts from the latest of the last advance, the start of
    /// this wait and this waiter's previous warning. A cursor parked on a
    /// failed index ends the wait with [`PipelineError::Stalled`]; any other
    /// idle cursor is only reported.
    fn check_stall(
        &self,
        index: u64,
        started: Instant,
        reported: &mut Instant,
    ) -> Result<(), PipelineError> {
        let Some(timeout) = self.stall_timeout else {
            return Ok(());
        };

        let last_advance = self.epoch
            + Duration::from_micros(self.last_advance_us.load(Ordering::Acquire));
        let idle_since = last_advance.max(*reported);
        if idle_since.elapsed() < timeout {
            return Ok(());
        }

        let next_index = self.next_index();
        if next_index == index {
            return Ok(());
        }

        let waiting = self.waiting();
        if self.failed.contains(&next_index) {
            tracing::warn!(
                "Item {} abandoned: index {} failed and will never emit (waiting: {:?})",
                index,
                next_index,
                waiting
            );
            return Err(PipelineError::Stalled {
                index,
                next_index,
                waiting,
                waited: started.elapsed(),
            });
        }

        tracing::warn!(
            "Item {} still waiting: sequencer at index {} for {:?} (waiting: {:?})",
            index,
            next_index,
            idle_since.elapsed(),
            waiting
        );
        if let Some(metrics) = &self.metrics {
            metrics.add_stall_warning();
        }
        *reported = Instant::now();
        Ok(())
    }

    fn release(&self, index: u64) {
        let moved = self
            .next_index
            .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(moved.is_ok(), "turn {index} released out of order: {moved:?}");

        self.last_advance_us
            .store(self.epoch.elapsed().as_micros() as u64, Ordering::Release);
        self.notify.notify_waiters();
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(WaitStrategy::default())
    }
}

/// Keeps `index` in the waiting set until dropped, including on cancellation.
struct WaitingGuard<'a> {
    set: &'a DashSet<u64>,
    index: u64,
}

impl<'a> WaitingGuard<'a> {
    fn new(set: &'a DashSet<u64>, index: u64) -> Self {
        set.insert(index);
        Self { set, index }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.index);
    }
}

/// Exclusive right to emit for one index.
#[must_use = "a turn that is never advanced blocks every later index"]
#[derive(Debug)]
pub struct Turn<'a> {
    sequencer: &'a Sequencer,
    index: u64,
}

impl Turn<'_> {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Hand the sequencer to `index + 1`.
    pub fn advance(self) {
        self.sequencer.release(self.index);
    }
}
