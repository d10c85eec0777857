//! End-to-end tests of the controller, sequencer and sink working together.
//!
//! Tests cover:
//! 1. Emission order and pacing with the default three-stage workload
//! 2. Fully serial execution at depth 0
//! 3. Upstream work finishing out of order
//! 4. A stage failure wedging every later index
//! 5. A slow item outlasting the stall timeout without losing anything
//! 6. The admission bound and independent pipelines in one process
//!
//! Durations are scaled down from the production cadence; assertions only use
//! lower bounds on elapsed time.

use crate::error::PipelineError;
use crate::pipeline::{
    stage_fn, Emission, Emitter, Pipeline, PipelineConfig, Stage, WaitStrategy,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Records every emission and counts overlapping emit calls.
#[derive(Default)]
struct RecordingEmitter {
    log: Mutex<Vec<(u64, String, Instant)>>,
    inside: AtomicBool,
    overlaps: AtomicUsize,
}

impl RecordingEmitter {
    fn indices(&self) -> Vec<u64> {
        self.log.lock().unwrap().iter().map(|(i, _, _)| *i).collect()
    }

    fn payloads(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, p, _)| p.clone()).collect()
    }

    fn times(&self) -> Vec<Instant> {
        self.log.lock().unwrap().iter().map(|(_, _, t)| *t).collect()
    }

    fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

impl Emitter<String> for RecordingEmitter {
    fn emit(&self, emission: &Emission<String>) {
        if self.inside.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.log
            .lock()
            .unwrap()
            .push((emission.index, emission.payload.clone(), Instant::now()));
        std::thread::sleep(Duration::from_millis(2));
        self.inside.store(false, Ordering::SeqCst);
    }
}

fn sleeping_stage(name: &'static str, latency: Duration) -> Arc<dyn Stage<String>> {
    stage_fn(name, move |_, payload: String| {
        std::thread::sleep(latency);
        Ok(format!("{payload} {name}"))
    })
}

fn inputs(count: u64) -> impl Iterator<Item = String> {
    (0..count).map(|i| format!("Input String {i}"))
}

fn assert_gaps_at_least(times: &[Instant], pace: Duration) {
    // tokio timers never fire early; allow for clock granularity only.
    let floor = pace - Duration::from_millis(1);
    for pair in times.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= floor, "emission gap {gap:?} shorter than pace {pace:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_stage_workload_emits_in_order_and_paced() {
    let pace = Duration::from_millis(100);
    let emitter = Arc::new(RecordingEmitter::default());
    let stages = vec![
        sleeping_stage("func1", Duration::from_millis(90)),
        sleeping_stage("func2", Duration::from_millis(95)),
        stage_fn("tag", |_, payload: String| Ok(payload)),
    ];
    let config = PipelineConfig {
        depth: 2,
        pace_interval: pace,
        ..Default::default()
    };

    let stats = Pipeline::new(stages, emitter.clone(), config)
        .run(inputs(5))
        .await;

    assert_eq!(stats.emitted, 5);
    assert_eq!(emitter.indices(), vec![0, 1, 2, 3, 4]);
    assert_eq!(emitter.payloads()[3], "Input String 3 func1 func2");
    assert_gaps_at_least(&emitter.times(), pace);
    assert_eq!(emitter.overlaps(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_depth_zero_runs_fully_serial() {
    let pace = Duration::from_millis(40);
    let emitter = Arc::new(RecordingEmitter::default());
    let starts = Arc::new(Mutex::new(Vec::new()));
    let log = starts.clone();
    let stages = vec![stage_fn("record", move |index, payload: String| {
        log.lock().unwrap().push((index, Instant::now()));
        std::thread::sleep(Duration::from_millis(10));
        Ok(payload)
    })];
    let config = PipelineConfig {
        depth: 0,
        pace_interval: pace,
        ..Default::default()
    };

    let mut pipeline = Pipeline::new(stages, emitter.clone(), config);
    for payload in inputs(4) {
        pipeline.submit(payload).await.unwrap();
        // Each submit returns only once its own sink has finished.
        assert_eq!(pipeline.in_flight(), 0);
    }
    pipeline.drain().await.unwrap();

    let starts = starts.lock().unwrap().clone();
    let emitted = emitter.times();
    assert_eq!(starts.len(), 4);
    for k in 1..4 {
        let (index, started) = starts[k];
        assert_eq!(index, k as u64);
        // Stage k starts after sink k-1 emitted and paced.
        assert!(started.duration_since(emitted[k - 1]) >= pace - Duration::from_millis(1));
    }
    assert_eq!(pipeline.metrics().snapshot().peak_in_flight, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_order_upstream_still_emits_in_order() {
    let emitter = Arc::new(RecordingEmitter::default());
    let finished = Arc::new(Mutex::new(Vec::new()));
    let log = finished.clone();
    let stages = vec![stage_fn("skewed", move |index, payload: String| {
        let latency = if index == 1 { 150 } else { 10 };
        std::thread::sleep(Duration::from_millis(latency));
        log.lock().unwrap().push(index);
        Ok(payload)
    })];
    let config = PipelineConfig {
        depth: 3,
        pace_interval: Duration::from_millis(5),
        ..Default::default()
    };

    let stats = Pipeline::new(stages, emitter.clone(), config)
        .run(inputs(3))
        .await;

    let finished = finished.lock().unwrap().clone();
    let pos = |i: u64| finished.iter().position(|&x| x == i).unwrap();
    assert!(pos(2) < pos(1), "item 2 should finish upstream first: {finished:?}");

    assert_eq!(stats.emitted, 3);
    assert_eq!(emitter.indices(), vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stage_failure_wedges_later_indices() {
    let emitter = Arc::new(RecordingEmitter::default());
    let stages = vec![stage_fn("fragile", |index, payload: String| {
        if index == 3 {
            anyhow::bail!("corrupt input");
        }
        Ok(payload)
    })];
    let config = PipelineConfig {
        depth: 2,
        pace_interval: Duration::from_millis(10),
        stall_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };

    let mut pipeline = Pipeline::new(stages, emitter.clone(), config);
    let mut results = Vec::new();
    for payload in inputs(8) {
        results.push(pipeline.submit(payload).await);
    }
    let drained = pipeline.drain().await;

    for result in &results[..5] {
        assert!(result.is_ok());
    }

    // Awaiting item 3 (evicted by the sixth submit) surfaces its failure.
    match &results[5] {
        Err(PipelineError::StageFailed { index, stage, .. }) => {
            assert_eq!(*index, 3);
            assert_eq!(stage, "fragile");
        }
        other => panic!("expected stage failure for item 3, got {other:?}"),
    }

    // Items 4 and later give up once the cursor sits on failed index 3.
    match &results[6] {
        Err(PipelineError::Stalled {
            index,
            next_index,
            waiting,
            ..
        }) => {
            assert_eq!(*index, 4);
            assert_eq!(*next_index, 3);
            assert!(waiting.contains(&4));
        }
        other => panic!("expected stall for item 4, got {other:?}"),
    }
    assert!(matches!(results[7], Err(PipelineError::Stalled { index: 5, .. })));
    assert!(matches!(drained, Err(PipelineError::Stalled { index: 6, .. })));

    assert_eq!(emitter.indices(), vec![0, 1, 2]);
    assert_eq!(pipeline.sequencer().next_index(), 3);
    assert_eq!(pipeline.sequencer().failed(), vec![3]);

    let stats = pipeline.stats();
    assert_eq!(stats.submitted, 8);
    assert_eq!(stats.emitted, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.stalled, 4);

    let snapshot = pipeline.metrics().snapshot();
    assert_eq!(snapshot.failures, 1);
    assert_eq!(snapshot.stalls, 4);
    assert_eq!(snapshot.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_item_beyond_stall_timeout_loses_nothing() {
    let emitter = Arc::new(RecordingEmitter::default());
    let stages = vec![stage_fn("uneven", |index, payload: String| {
        if index == 1 {
            std::thread::sleep(Duration::from_millis(400));
        }
        Ok(payload)
    })];
    let config = PipelineConfig {
        depth: 3,
        pace_interval: Duration::from_millis(20),
        stall_timeout: Some(Duration::from_millis(150)),
        ..Default::default()
    };

    let mut pipeline = Pipeline::new(stages, emitter.clone(), config);
    for payload in inputs(5) {
        pipeline.submit(payload).await.unwrap();
    }
    pipeline.drain().await.unwrap();

    assert_eq!(emitter.indices(), vec![0, 1, 2, 3, 4]);
    let stats = pipeline.stats();
    assert_eq!(stats.emitted, 5);
    assert_eq!(stats.stalled, 0);
    assert_eq!(stats.failed, 0);

    // Items 2..4 waited well past the timeout and said so.
    let snapshot = pipeline.metrics().snapshot();
    assert!(snapshot.stall_warnings >= 1);
    assert_eq!(snapshot.stalls, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admission_bound_is_reached_but_never_exceeded() {
    let emitter = Arc::new(RecordingEmitter::default());
    let active = Arc::new(AtomicUsize::new(0));
    let peak_stage = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak_stage.clone());
    let stages = vec![stage_fn("busy", move |_, payload: String| {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        a.fetch_sub(1, Ordering::SeqCst);
        Ok(payload)
    })];
    let depth = 2;
    let config = PipelineConfig {
        depth,
        pace_interval: Duration::from_millis(30),
        ..Default::default()
    };

    let mut pipeline = Pipeline::new(stages, emitter.clone(), config);
    for payload in inputs(8) {
        pipeline.submit(payload).await.unwrap();
        assert!(pipeline.in_flight() <= depth);
    }
    pipeline.drain().await.unwrap();

    let snapshot = pipeline.metrics().snapshot();
    assert_eq!(snapshot.peak_in_flight, depth as u64 + 1);
    assert!(peak_stage.load(Ordering::SeqCst) <= depth + 1);
    assert_eq!(emitter.indices(), (0..8).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_polling_sequencer_keeps_order_and_pace() {
    let pace = Duration::from_millis(20);
    let emitter = Arc::new(RecordingEmitter::default());
    let stages = vec![stage_fn("jitter", |index, payload: String| {
        // Later items finish first within each window.
        std::thread::sleep(Duration::from_millis(40 - (index % 4) * 10));
        Ok(payload)
    })];
    let config = PipelineConfig {
        depth: 3,
        pace_interval: pace,
        wait_strategy: WaitStrategy::Poll {
            interval: Duration::from_micros(1),
        },
        ..Default::default()
    };

    let stats = Pipeline::new(stages, emitter.clone(), config)
        .run(inputs(8))
        .await;

    assert_eq!(stats.emitted, 8);
    assert_eq!(emitter.indices(), (0..8).collect::<Vec<_>>());
    assert_gaps_at_least(&emitter.times(), pace);
    assert_eq!(emitter.overlaps(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_pipelines_do_not_share_order() {
    let config = PipelineConfig {
        depth: 2,
        pace_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let left = Arc::new(RecordingEmitter::default());
    let right = Arc::new(RecordingEmitter::default());

    let first = Pipeline::new(
        vec![sleeping_stage("left", Duration::from_millis(5))],
        left.clone(),
        config.clone(),
    );
    let second = Pipeline::new(
        vec![sleeping_stage("right", Duration::from_millis(3))],
        right.clone(),
        config,
    );

    let (a, b) = tokio::join!(first.run(inputs(6)), second.run(inputs(6)));

    assert_eq!(a.emitted, 6);
    assert_eq!(b.emitted, 6);
    assert_eq!(left.indices(), (0..6).collect::<Vec<_>>());
    assert_eq!(right.indices(), (0..6).collect::<Vec<_>>());
}
