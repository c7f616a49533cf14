mod builder;
mod completion;
pub(crate) mod worker;

pub use builder::SamplerBuilder;
pub use completion::Completion;

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use parking_lot::Mutex;
use spindle_protocol::SamplerProfile;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::aggregator::DataAggregator;
use crate::capture::{DumpError, ThreadDumper, ThreadSnapshot};
use crate::clock::Clock;
use crate::config::{ConfigError, SamplerConfig};
use crate::export::{self, ExportOptions};
use crate::stats::WindowStatisticsCollector;
use crate::window::{WindowId, WindowTracker, keep_history_before, window_of_millis};
use worker::{Job, WorkerPool, panic_message};

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dump(#[from] DumpError),
    #[error("sampler has already been started")]
    AlreadyStarted,
    #[error("sampling was cancelled")]
    Cancelled,
    #[error("sampling tick panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn sampler thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Final outcome of a session: the sampler, ready to export, or the error
/// that ended it.
pub type SessionResult = Result<Sampler, Arc<SamplerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Created,
    Running,
    /// Stopped by the caller.
    Stopped,
    /// Reached its configured deadline.
    Completed,
    Failed,
}

impl SamplerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }
}

/// Notified on the timer thread each time sampling moves into a new window.
pub trait WindowListener: Send + Sync {
    fn on_window_rotated(&self, previous: WindowId, current: WindowId);
}

#[derive(Debug, Clone, Copy, Default)]
struct Timing {
    start_ms: u64,
    auto_end_ms: Option<u64>,
}

struct Timer {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

enum TickOutcome {
    Continue,
    Deadline,
}

pub(crate) struct SamplerParts {
    pub(crate) config: SamplerConfig,
    pub(crate) dumper: Box<dyn ThreadDumper>,
    pub(crate) aggregator: Arc<dyn DataAggregator>,
    pub(crate) stats: WindowStatisticsCollector,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) listener: Option<Arc<dyn WindowListener>>,
}

struct Inner {
    config: SamplerConfig,
    dumper: Box<dyn ThreadDumper>,
    aggregator: Arc<dyn DataAggregator>,
    stats: WindowStatisticsCollector,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn WindowListener>>,
    windows: WindowTracker,
    state: Mutex<SamplerState>,
    timing: Mutex<Timing>,
    workers: Mutex<Option<WorkerPool>>,
    timer: Mutex<Option<Timer>>,
    completion: Completion<Result<(), Arc<SamplerError>>>,
    dropped: AtomicU64,
}

/// Periodically captures thread stacks and feeds them to an aggregator.
///
/// `Sampler` is a cheap handle; clones refer to the same session. Build one
/// with [`SamplerBuilder`].
#[derive(Clone)]
pub struct Sampler {
    inner: Arc<Inner>,
}

impl Sampler {
    pub(crate) fn from_parts(parts: SamplerParts) -> Self {
        let SamplerParts {
            config,
            dumper,
            aggregator,
            stats,
            clock,
            listener,
        } = parts;
        Self {
            inner: Arc::new(Inner {
                config,
                dumper,
                aggregator,
                stats,
                clock,
                listener,
                windows: WindowTracker::default(),
                state: Mutex::new(SamplerState::Created),
                timing: Mutex::new(Timing::default()),
                workers: Mutex::new(None),
                timer: Mutex::new(None),
                completion: Completion::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Begin periodic capture.
    pub fn start(&self) -> Result<(), SamplerError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if *state != SamplerState::Created {
                return Err(SamplerError::AlreadyStarted);
            }
            *state = SamplerState::Running;
        }

        let now = inner.clock.now_millis();
        *inner.timing.lock() = Timing {
            start_ms: now,
            auto_end_ms: inner
                .config
                .complete_after_ms
                .map(|ms| now.saturating_add(ms)),
        };
        let window = window_of_millis(now);
        inner.windows.observe(window);
        inner.stats.record_window_start(window, now);

        if let Err(e) = self.spawn_threads() {
            error!(error = %e, "failed to start sampler threads");
            let settled = SamplerError::Spawn(io::Error::new(e.kind(), e.to_string()));
            inner.finish(SamplerState::Failed, Err(Arc::new(settled)), false);
            inner.stop_timer();
            return Err(SamplerError::Spawn(e));
        }

        info!(
            interval_us = inner.config.interval_micros,
            threads = %inner.dumper.description(),
            grouping = %inner.config.grouping,
            "sampler started"
        );
        Ok(())
    }

    fn spawn_threads(&self) -> io::Result<()> {
        let inner = &self.inner;
        if inner.config.worker_threads > 0 {
            let pool = WorkerPool::new(
                inner.config.worker_threads,
                inner.config.worker_queue_capacity,
            )?;
            *inner.workers.lock() = Some(pool);
        }

        let (stop, stopped) = bounded::<()>(1);
        let timer_inner = Arc::clone(inner);
        let handle = thread::Builder::new()
            .name("spindle-sampler".to_string())
            .spawn(move || timer_inner.run(&stopped))?;
        *inner.timer.lock() = Some(Timer { stop, handle });
        Ok(())
    }

    /// Stop sampling.
    ///
    /// Halts the timer, drains in-flight inserts and flushes buffered ticks.
    /// Unless `cancelled`, the still-open window is measured and the
    /// completion signal settles with this sampler; a cancelled session
    /// settles with [`SamplerError::Cancelled`]. Does nothing to a session
    /// that already ended.
    pub fn stop(&self, cancelled: bool) {
        let inner = &self.inner;
        let claimed = inner.claim(SamplerState::Stopped);
        inner.stop_timer();
        if !claimed {
            debug!("sampler already finished");
            return;
        }
        let outcome = if cancelled {
            Err(Arc::new(SamplerError::Cancelled))
        } else {
            Ok(())
        };
        inner.shutdown(outcome, !cancelled);
    }

    pub fn state(&self) -> SamplerState {
        *self.inner.state.lock()
    }

    pub fn completion(&self) -> CompletionSignal {
        CompletionSignal {
            completion: self.inner.completion.clone(),
            sampler: self.clone(),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.inner.config
    }

    pub fn aggregator(&self) -> &Arc<dyn DataAggregator> {
        &self.inner.aggregator
    }

    pub fn statistics(&self) -> &WindowStatisticsCollector {
        &self.inner.stats
    }

    pub fn start_time_ms(&self) -> u64 {
        self.inner.timing.lock().start_ms
    }

    /// The most recent window sampling has reached.
    pub fn current_window(&self) -> Option<WindowId> {
        self.inner.windows.current()
    }

    /// Samples lost because the insertion queue was full.
    pub fn dropped_samples(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Snapshot the session's call tree and statistics.
    pub fn export(&self, options: &ExportOptions) -> SamplerProfile {
        let inner = &self.inner;
        let tree = inner.aggregator.tree();
        let (threads, time_windows) = export::export_threads(&tree, options);
        SamplerProfile {
            metadata: spindle_protocol::SamplerMetadata {
                start_time_ms: self.start_time_ms(),
                end_time_ms: inner.clock.now_millis(),
                interval_micros: inner.config.interval_micros,
                thread_dumper: inner.dumper.description(),
                grouping: inner.aggregator.grouper().kind().to_string(),
                aggregator: inner.aggregator.metadata(),
            },
            threads,
            time_windows,
            window_statistics: inner.stats.export(&options.windows),
        }
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("state", &self.state())
            .field("interval_us", &self.inner.config.interval_micros)
            .field("window", &self.current_window())
            .finish()
    }
}

/// Settles once per session with a [`SessionResult`].
#[derive(Clone)]
pub struct CompletionSignal {
    completion: Completion<Result<(), Arc<SamplerError>>>,
    sampler: Sampler,
}

impl CompletionSignal {
    pub fn wait(&self) -> SessionResult {
        self.completion.wait().map(|()| self.sampler.clone())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<SessionResult> {
        self.completion
            .wait_timeout(timeout)
            .map(|r| r.map(|()| self.sampler.clone()))
    }

    pub fn try_get(&self) -> Option<SessionResult> {
        self.completion
            .try_get()
            .map(|r| r.map(|()| self.sampler.clone()))
    }

    pub fn is_settled(&self) -> bool {
        self.completion.is_settled()
    }
}

fn insert_guarded(
    aggregator: &dyn DataAggregator,
    thread: ThreadSnapshot,
    window: WindowId,
    weight: u64,
) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        aggregator.insert_data(thread, window, weight);
    }));
    if let Err(panic) = result {
        error!(panic = panic_message(&*panic), "sample insertion panicked");
    }
}

impl Inner {
    fn run(&self, stopped: &Receiver<()>) {
        let ticker = crossbeam_channel::tick(self.config.interval());
        loop {
            select! {
                recv(stopped) -> _ => return,
                recv(ticker) -> _ => {}
            }
            if *self.state.lock() != SamplerState::Running {
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.tick()))
                .unwrap_or_else(|panic| Err(SamplerError::Panicked(panic_message(&*panic))));
            match outcome {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Deadline) => {
                    info!("sampling deadline reached");
                    self.finish(SamplerState::Completed, Ok(()), true);
                    return;
                }
                Err(e) => {
                    error!(error = %e, "sampling tick failed, ending session");
                    self.finish(SamplerState::Failed, Err(Arc::new(e)), false);
                    return;
                }
            }
        }
    }

    fn tick(&self) -> Result<TickOutcome, SamplerError> {
        let now = self.clock.now_millis();
        if self.timing.lock().auto_end_ms.is_some_and(|end| now >= end) {
            return Ok(TickOutcome::Deadline);
        }

        let threads = self.dumper.dump()?;
        let window = window_of_millis(now);
        let weight = self.config.interval_micros;
        for thread in threads {
            if thread.name.is_empty() {
                continue;
            }
            self.stats.record_sample(window, thread.id, now);
            self.dispatch(thread, window, weight);
        }

        if let Some(previous) = self.windows.observe(window) {
            self.rotate(previous, window, now);
        }
        Ok(TickOutcome::Continue)
    }

    fn dispatch(&self, thread: ThreadSnapshot, window: WindowId, weight: u64) {
        let workers = self.workers.lock();
        let Some(pool) = workers.as_ref() else {
            insert_guarded(self.aggregator.as_ref(), thread, window, weight);
            return;
        };
        let aggregator = Arc::clone(&self.aggregator);
        let job: Job = Box::new(move || aggregator.insert_data(thread, window, weight));
        if pool.submit(job).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "insertion queue full, dropping samples");
            }
        }
    }

    fn rotate(&self, previous: WindowId, current: WindowId, now: u64) {
        debug!(previous, current, "window rotated");
        self.stats.record_window_start(current, now);
        self.stats.measure(previous, now);

        let expired = keep_history_before(current, self.config.window_retention);
        self.aggregator.prune_data(&expired);
        self.stats.prune(&expired);

        if let Some(listener) = &self.listener {
            listener.on_window_rotated(previous, current);
        }
    }

    /// Move to a terminal state. Only the first caller wins.
    fn claim(&self, next: SamplerState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    fn finish(&self, next: SamplerState, outcome: Result<(), Arc<SamplerError>>, measure: bool) {
        if self.claim(next) {
            self.shutdown(outcome, measure);
        }
    }

    fn shutdown(&self, outcome: Result<(), Arc<SamplerError>>, measure: bool) {
        let pool = self.workers.lock().take();
        let drained = pool.is_none_or(|pool| pool.shutdown(self.config.drain_timeout()));
        self.aggregator.complete();

        if measure && let Some(window) = self.windows.current() {
            self.stats.measure(window, self.clock.now_millis());
        }

        let state = *self.state.lock();
        info!(
            ?state,
            drained,
            dropped = self.dropped.load(Ordering::Relaxed),
            "sampler finished"
        );
        self.completion.settle(outcome);
    }

    fn stop_timer(&self) {
        let Some(Timer { stop, handle }) = self.timer.lock().take() else {
            return;
        };
        drop(stop);
        // A listener may stop the session from the timer thread itself.
        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            warn!("sampler thread exited abnormally");
        }
    }
}
