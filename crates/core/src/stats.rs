use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use spindle_protocol::WindowStatistics;
use tracing::debug;

use crate::tick::TickSource;
use crate::window::{WindowId, WindowSelection};

#[derive(Debug)]
struct OpenWindow {
    start_time_ms: u64,
    start_tick: Option<u64>,
    samples: u64,
    threads: HashSet<u64>,
}

/// Records per-window statistics keyed by the same window ids as the tree.
///
/// A window is opened when it starts (or on its first sample) and closed by
/// [`measure`](Self::measure), which freezes its statistics.
pub struct WindowStatisticsCollector {
    ticks: Option<Arc<dyn TickSource>>,
    open: Mutex<HashMap<WindowId, OpenWindow>>,
    closed: Mutex<BTreeMap<WindowId, WindowStatistics>>,
}

impl WindowStatisticsCollector {
    pub fn new(ticks: Option<Arc<dyn TickSource>>) -> Self {
        Self {
            ticks,
            open: Mutex::new(HashMap::new()),
            closed: Mutex::new(BTreeMap::new()),
        }
    }

    fn open_window(&self, start_time_ms: u64) -> OpenWindow {
        OpenWindow {
            start_time_ms,
            start_tick: self.ticks.as_ref().map(|t| t.current_tick()),
            samples: 0,
            threads: HashSet::new(),
        }
    }

    pub fn record_window_start(&self, window: WindowId, now_ms: u64) {
        let mut open = self.open.lock();
        if !open.contains_key(&window) {
            open.insert(window, self.open_window(now_ms));
        }
    }

    pub fn record_sample(&self, window: WindowId, thread_id: u64, now_ms: u64) {
        let mut open = self.open.lock();
        let entry = open
            .entry(window)
            .or_insert_with(|| self.open_window(now_ms));
        entry.samples += 1;
        entry.threads.insert(thread_id);
    }

    /// Close `window` and store its statistics.
    pub fn measure(&self, window: WindowId, now_ms: u64) -> Option<WindowStatistics> {
        let opened = self.open.lock().remove(&window)?;
        let ticks = match (&self.ticks, opened.start_tick) {
            (Some(source), Some(start)) => source.current_tick().saturating_sub(start),
            _ => 0,
        };
        let stats = WindowStatistics {
            start_time_ms: opened.start_time_ms,
            duration_ms: now_ms.saturating_sub(opened.start_time_ms),
            ticks,
            samples: opened.samples,
            threads: opened.threads.len() as u64,
        };
        debug!(window, samples = stats.samples, ticks, "window measured");
        self.closed.lock().insert(window, stats.clone());
        Some(stats)
    }

    pub fn prune(&self, expired: &dyn Fn(WindowId) -> bool) {
        self.open.lock().retain(|&w, _| !expired(w));
        self.closed.lock().retain(|&w, _| !expired(w));
    }

    pub fn get(&self, window: WindowId) -> Option<WindowStatistics> {
        self.closed.lock().get(&window).cloned()
    }

    pub fn export(&self, selection: &WindowSelection) -> BTreeMap<WindowId, WindowStatistics> {
        self.closed
            .lock()
            .iter()
            .filter(|(w, _)| selection.contains(**w))
            .map(|(w, s)| (*w, s.clone()))
            .collect()
    }
}
