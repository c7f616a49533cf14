//! Integration test: drive a real sampler session over scripted thread dumps
//! and verify the resulting trees, statistics and completion outcomes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use proptest::prelude::*;
use spindle_core::aggregator::SimpleDataAggregator;
use spindle_core::capture::StaticDumper;
use spindle_core::clock::ManualClock;
use spindle_core::model::Node;
use spindle_core::tick::{ManualTickCounter, TickSource};
use spindle_core::{
    DataAggregator, DumpError, ExportOptions, SamplerBuilder, SamplerConfig, SamplerError,
    SamplerState, StackFrame, ThreadDumper, ThreadGrouping, ThreadSnapshot, WindowId,
    WindowListener,
};

const INTERVAL_US: u64 = 1_000;
const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> SamplerConfig {
    SamplerConfig {
        worker_threads: 0,
        ..SamplerConfig::default()
    }
    .with_interval(Duration::from_micros(INTERVAL_US))
}

/// Innermost-first frames from an outermost-first call chain.
fn stack(calls: &[&str]) -> Vec<StackFrame> {
    calls
        .iter()
        .rev()
        .enumerate()
        .map(|(line, method)| StackFrame::new("Server", *method, Some(line as u32 + 1)))
        .collect()
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn depth(node: &Node) -> usize {
    node.children()
        .iter()
        .map(|child| 1 + depth(child))
        .max()
        .unwrap_or(0)
}

#[test]
fn stopped_session_exports_every_sample() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let threads = vec![
        ThreadSnapshot::new(1, "Server thread", stack(&["main", "tick", "tickWorlds"])),
        ThreadSnapshot::new(2, "Netty Epoll #1", stack(&["run", "poll"])),
        ThreadSnapshot::new(3, "Netty Epoll #2", stack(&["run", "poll"])),
        ThreadSnapshot::new(4, "", stack(&["hidden"])),
    ];
    let dumper = StaticDumper::new(threads);
    let sampler = SamplerBuilder::new(config())
        .dumper(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            dumper.dump()
        })
        .clock(Arc::new(ManualClock::new(180_000)))
        .build()
        .expect("failed to build sampler");

    sampler.start().expect("failed to start");
    assert_eq!(sampler.state(), SamplerState::Running);
    wait_until("five captures", || calls.load(Ordering::SeqCst) >= 5);
    sampler.stop(false);

    let finished = sampler
        .completion()
        .wait_timeout(TIMEOUT)
        .expect("completion never settled")
        .expect("session failed");
    assert_eq!(finished.state(), SamplerState::Stopped);

    let captures = calls.load(Ordering::SeqCst) as u64;
    let profile = finished.export(&ExportOptions::default());
    assert_eq!(profile.time_windows, [3]);
    assert_eq!(profile.metadata.grouping, "by-pool");

    let server = profile.thread("Server thread").expect("missing server group");
    assert_eq!(server.total_time, captures * INTERVAL_US);
    let main = server.root_children().next().expect("missing main");
    assert_eq!(main.method_name, "main");
    let tick = server.children_of(main).next().expect("missing tick");
    assert_eq!(tick.parent_line_number, Some(3));

    let netty = profile.thread("Netty Epoll").expect("missing pool group");
    assert_eq!(netty.label, "Netty Epoll (x2)");
    assert_eq!(netty.total_time, 2 * captures * INTERVAL_US);
    assert_eq!(profile.threads.len(), 2);

    let stats = &profile.window_statistics[&3];
    assert_eq!(stats.samples, 3 * captures);
    assert_eq!(stats.threads, 3);

    // Capture has stopped for good.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(calls.load(Ordering::SeqCst) as u64, captures);
}

#[test]
fn capture_failure_fails_the_session_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sampler = SamplerBuilder::new(config())
        .dumper(move || -> Result<Vec<ThreadSnapshot>, DumpError> {
            if counter.fetch_add(1, Ordering::SeqCst) >= 2 {
                return Err(DumpError::Capture("target exited".into()));
            }
            Ok(vec![ThreadSnapshot::new(1, "main", stack(&["main"]))])
        })
        .build()
        .expect("failed to build sampler");

    sampler.start().expect("failed to start");
    let outcome = sampler
        .completion()
        .wait_timeout(TIMEOUT)
        .expect("completion never settled");
    let err = outcome.expect_err("session should fail");
    assert!(matches!(*err, SamplerError::Dump(DumpError::Capture(_))));
    assert_eq!(sampler.state(), SamplerState::Failed);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // A late stop changes nothing.
    sampler.stop(false);
    assert_eq!(sampler.state(), SamplerState::Failed);
    assert!(sampler.completion().wait().is_err());
}

#[test]
fn deadline_completes_and_measures_open_window() {
    let clock = Arc::new(ManualClock::new(120_500));
    let sampler = SamplerBuilder::new(config().with_complete_after(Duration::from_secs(5)))
        .dumper(StaticDumper::new(vec![ThreadSnapshot::new(
            1,
            "main",
            stack(&["main"]),
        )]))
        .clock(clock.clone())
        .build()
        .expect("failed to build sampler");

    sampler.start().expect("failed to start");
    wait_until("a sample", || !sampler.aggregator().tree().is_empty());
    assert!(!sampler.completion().is_settled());

    clock.advance(Duration::from_secs(5));
    let finished = sampler
        .completion()
        .wait_timeout(TIMEOUT)
        .expect("deadline never fired")
        .expect("session failed");
    assert_eq!(finished.state(), SamplerState::Completed);

    let stats = finished.statistics().get(2).expect("window 2 not measured");
    assert_eq!(stats.start_time_ms, 120_500);
    assert_eq!(stats.duration_ms, 5_000);
    assert!(stats.samples > 0);
}

#[test]
fn cancel_is_terminal_and_idempotent() {
    let sampler = SamplerBuilder::new(config())
        .dumper(StaticDumper::new(vec![]))
        .build()
        .expect("failed to build sampler");

    sampler.start().expect("failed to start");
    assert!(matches!(sampler.start(), Err(SamplerError::AlreadyStarted)));

    sampler.stop(true);
    sampler.stop(false);
    assert_eq!(sampler.state(), SamplerState::Stopped);
    let err = sampler
        .completion()
        .wait()
        .expect_err("cancelled session should not succeed");
    assert!(matches!(*err, SamplerError::Cancelled));
    assert!(matches!(sampler.start(), Err(SamplerError::AlreadyStarted)));
}

#[derive(Default)]
struct Rotations(Mutex<Vec<(WindowId, WindowId)>>);

impl WindowListener for Rotations {
    fn on_window_rotated(&self, previous: WindowId, current: WindowId) {
        self.0.lock().push((previous, current));
    }
}

#[test]
fn rotation_prunes_windows_past_retention() {
    let clock = Arc::new(ManualClock::new(0));
    let ticking = Arc::clone(&clock);
    let rotations = Arc::new(Rotations::default());
    let config = SamplerConfig {
        window_retention: 2,
        ..config()
    };
    let sampler = SamplerBuilder::new(config)
        .dumper(move || -> Result<Vec<ThreadSnapshot>, DumpError> {
            // Every capture lands one window later than the last.
            ticking.advance(Duration::from_secs(60));
            Ok(vec![ThreadSnapshot::new(1, "main", stack(&["main", "work"]))])
        })
        .clock(clock.clone())
        .listener(rotations.clone())
        .build()
        .expect("failed to build sampler");

    sampler.start().expect("failed to start");
    wait_until("six rotations", || rotations.0.lock().len() >= 6);
    sampler.stop(false);
    sampler
        .completion()
        .wait_timeout(TIMEOUT)
        .expect("completion never settled")
        .expect("session failed");

    let seen = rotations.0.lock().clone();
    assert_eq!(seen[0], (0, 1));
    assert!(seen.windows(2).all(|w| w[0].1 == w[1].0));

    let current = sampler.current_window().expect("no current window");
    let tree = sampler.aggregator().tree();
    let windows = tree["main"].root().times().windows();
    assert!(!windows.is_empty());
    assert!(windows.iter().all(|&w| w >= current - 2), "{windows:?} at {current}");
    assert!(sampler.statistics().get(0).is_none());
}

#[test]
fn worker_pool_drains_before_completion() {
    let config = SamplerConfig {
        worker_threads: 2,
        ..config()
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let threads: Vec<_> = (0..4)
        .map(|i| ThreadSnapshot::new(i, format!("pool-{i}"), stack(&["run", "step"])))
        .collect();
    let dumper = StaticDumper::new(threads);
    let sampler = SamplerBuilder::new(config)
        .dumper(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            dumper.dump()
        })
        .clock(Arc::new(ManualClock::new(60_000)))
        .build()
        .expect("failed to build sampler");

    sampler.start().expect("failed to start");
    wait_until("ten captures", || calls.load(Ordering::SeqCst) >= 10);
    sampler.stop(false);
    let finished = sampler
        .completion()
        .wait_timeout(TIMEOUT)
        .expect("completion never settled")
        .expect("session failed");

    let samples = finished.statistics().get(1).expect("window 1").samples;
    let tree = finished.aggregator().tree();
    let pool = tree["pool"].total_time();
    assert_eq!(pool + finished.dropped_samples() * INTERVAL_US, samples * INTERVAL_US);
}

#[test]
fn ticked_session_counts_each_host_tick_once() {
    let config = SamplerConfig {
        worker_threads: 2,
        tick_length_threshold_ms: Some(1),
        ..config()
    };
    let ticks = Arc::new(ManualTickCounter::new());
    let threads: Vec<_> = (0..3)
        .map(|i| ThreadSnapshot::new(i, format!("Worker-{i}"), stack(&["run", "step"])))
        .collect();
    let sampler = SamplerBuilder::new(config)
        .dumper(StaticDumper::new(threads))
        .tick_source(ticks.clone())
        .clock(Arc::new(ManualClock::new(240_000)))
        .build()
        .expect("failed to build sampler");
    let included = || {
        sampler
            .aggregator()
            .metadata()
            .included_ticks
            .expect("ticked aggregator reports included ticks")
    };

    sampler.start().expect("failed to start");
    // A tick is flushed once the first sample of the next one arrives.
    for advanced in 1..=5 {
        ticks.advance();
        wait_until("the previous tick to flush", || included() >= advanced);
    }
    sampler.stop(false);
    let finished = sampler
        .completion()
        .wait_timeout(TIMEOUT)
        .expect("completion never settled")
        .expect("session failed");
    assert_eq!(ticks.current_tick(), 5);

    let profile = finished.export(&ExportOptions::default());
    // Ticks 0 through 5, the last one flushed on stop.
    assert_eq!(profile.metadata.aggregator.included_ticks, Some(6));
    assert_eq!(profile.metadata.aggregator.tick_length_threshold_ms, Some(1));
    let stats = &profile.window_statistics[&4];
    assert_eq!(stats.ticks, 6);

    let worker = profile.thread("Worker").expect("missing pool group");
    assert_eq!(
        worker.total_time + finished.dropped_samples() * INTERVAL_US,
        stats.samples * INTERVAL_US
    );
}

fn arb_stack() -> impl Strategy<Value = Vec<StackFrame>> {
    prop::collection::vec((0..4usize, 1..5u32), 0..40).prop_map(|calls| {
        calls
            .into_iter()
            .map(|(m, line)| StackFrame::new("Gen", ["a", "b", "c", "d"][m], Some(line)))
            .collect()
    })
}

fn assert_monotonic(node: &Node) {
    for child in node.children() {
        assert!(child.total_time() <= node.total_time());
        assert_monotonic(&child);
    }
}

proptest! {
    #[test]
    fn trees_respect_depth_and_time_bounds(
        stacks in prop::collection::vec(arb_stack(), 1..30),
        max_depth in 1..20usize,
    ) {
        let aggregator = SimpleDataAggregator::new(ThreadGrouping::ByName.grouper(), max_depth, None);
        for (i, frames) in stacks.iter().enumerate() {
            let snapshot = ThreadSnapshot::new(7, "gen", frames.clone());
            aggregator.insert_data(snapshot, (i % 3) as WindowId, 10);
        }
        let tree = aggregator.tree();
        let root = tree["gen"].root();
        prop_assert!(depth(root) <= max_depth);
        prop_assert_eq!(root.total_time(), stacks.len() as u64 * 10);
        assert_monotonic(root);
    }
}
