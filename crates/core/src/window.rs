use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Coarse time bucket id: whole minutes since the Unix epoch.
pub type WindowId = i64;

pub const WINDOW_SIZE: Duration = Duration::from_secs(60);

/// Windows kept by default: one hour.
pub const DEFAULT_RETENTION: u32 = 60;

const WINDOW_MILLIS: u64 = WINDOW_SIZE.as_millis() as u64;

pub fn window_of_millis(unix_millis: u64) -> WindowId {
    (unix_millis / WINDOW_MILLIS) as WindowId
}

pub fn window_start_millis(window: WindowId) -> u64 {
    window.max(0) as u64 * WINDOW_MILLIS
}

/// Predicate matching windows that fall outside the retention horizon of
/// `current`. The current window and the `retention` windows before it are
/// kept.
pub fn keep_history_before(current: WindowId, retention: u32) -> impl Fn(WindowId) -> bool {
    let oldest_kept = current - WindowId::from(retention);
    move |window| window < oldest_kept
}

/// Which windows an export covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WindowSelection {
    #[default]
    All,
    Range(RangeInclusive<WindowId>),
    Only(BTreeSet<WindowId>),
}

impl WindowSelection {
    pub fn contains(&self, window: WindowId) -> bool {
        match self {
            Self::All => true,
            Self::Range(range) => range.contains(&window),
            Self::Only(set) => set.contains(&window),
        }
    }
}

const UNSET: WindowId = WindowId::MIN;

/// Tracks the highest window seen and reports each boundary crossing once.
///
/// Window ids come from wall-clock millis and are never negative, so
/// `WindowId::MIN` is free to mean "nothing observed yet".
#[derive(Debug)]
pub struct WindowTracker {
    last: AtomicI64,
}

impl Default for WindowTracker {
    fn default() -> Self {
        Self {
            last: AtomicI64::new(UNSET),
        }
    }
}

impl WindowTracker {
    /// Record `window`. Returns the previous maximum when `window` moves past
    /// it; the first observation never counts as a rotation.
    pub fn observe(&self, window: WindowId) -> Option<WindowId> {
        let previous = self.last.fetch_max(window, Ordering::AcqRel);
        (previous != UNSET && window > previous).then_some(previous)
    }

    pub fn current(&self) -> Option<WindowId> {
        let last = self.last.load(Ordering::Acquire);
        (last != UNSET).then_some(last)
    }

    pub fn started(&self) -> bool {
        self.current().is_some()
    }
}
