use std::sync::atomic::{AtomicU64, Ordering};

/// Host capability exposing its frame/tick loop counter.
///
/// The value must never decrease.
pub trait TickSource: Send + Sync {
    fn current_tick(&self) -> u64;
}

/// Tick counter advanced explicitly, from the host loop or a test.
#[derive(Debug, Default)]
pub struct ManualTickCounter {
    tick: AtomicU64,
}

impl ManualTickCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by one tick and return the new value.
    pub fn advance(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl TickSource for ManualTickCounter {
    fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_monotonically() {
        let ticks = ManualTickCounter::new();
        assert_eq!(ticks.current_tick(), 0);
        assert_eq!(ticks.advance(), 1);
        assert_eq!(ticks.advance(), 2);
        assert_eq!(ticks.current_tick(), 2);
    }
}
