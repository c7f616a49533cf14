use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use spindle_protocol::{AggregatorKind, AggregatorMetadata, SharedStr};
use tracing::trace;

use super::{CallTree, DataAggregator, IdleClassifier};
use crate::capture::ThreadSnapshot;
use crate::grouping::ThreadGrouper;
use crate::model::ThreadNode;
use crate::tick::TickSource;
use crate::window::WindowId;

/// Count of ticks written to the tree. Doubles as a [`TickSource`] so that
/// window statistics can report included ticks.
#[derive(Debug, Default)]
pub struct IncludedTicks(AtomicU64);

impl IncludedTicks {
    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

impl TickSource for IncludedTicks {
    fn current_tick(&self) -> u64 {
        self.total()
    }
}

struct TickBatch {
    tick: u64,
    samples: Vec<(ThreadSnapshot, WindowId, u64)>,
}

/// Buffers samples per host tick and writes each tick as one batch.
///
/// A tick's length is estimated as `samples * interval`. Ticks shorter than
/// the threshold are dropped whole, so fast idle ticks do not dilute the
/// profile of slow ones.
pub struct TickedDataAggregator {
    tree: CallTree,
    ticks: Arc<dyn TickSource>,
    interval_micros: u64,
    threshold_micros: u64,
    expected_size: usize,
    pending: Mutex<Option<TickBatch>>,
    included: Arc<IncludedTicks>,
}

impl TickedDataAggregator {
    pub fn new(
        grouper: Box<dyn ThreadGrouper>,
        max_depth: usize,
        idle: Option<IdleClassifier>,
        ticks: Arc<dyn TickSource>,
        interval_micros: u64,
        threshold_micros: u64,
    ) -> Self {
        // Room for a 50ms tick plus slack.
        let expected_size = (50_000 / interval_micros.max(1)) as usize + 10;
        Self {
            tree: CallTree::new(grouper, max_depth, idle),
            ticks,
            interval_micros,
            threshold_micros,
            expected_size,
            pending: Mutex::new(None),
            included: Arc::new(IncludedTicks::default()),
        }
    }

    pub fn included_ticks(&self) -> Arc<IncludedTicks> {
        Arc::clone(&self.included)
    }

    fn flush(&self, batch: TickBatch) {
        let length = batch.samples.len() as u64 * self.interval_micros;
        if length < self.threshold_micros {
            trace!(tick = batch.tick, length, "discarding short tick");
            return;
        }
        for (thread, window, weight) in &batch.samples {
            self.tree.write(thread, *window, *weight);
        }
        self.included.increment();
    }
}

impl DataAggregator for TickedDataAggregator {
    fn insert_data(&self, thread: ThreadSnapshot, window: WindowId, weight: u64) {
        if self.tree.filtered(&thread) {
            return;
        }
        let finished = {
            let mut pending = self.pending.lock();
            // Read under the lock so inserters agree on batch order. A tick
            // older than the open batch belongs to it.
            let tick = self.ticks.current_tick();
            let same_tick = pending.as_ref().is_some_and(|batch| tick <= batch.tick);
            let finished = if same_tick {
                None
            } else {
                pending.replace(TickBatch {
                    tick,
                    samples: Vec::with_capacity(self.expected_size),
                })
            };
            if let Some(batch) = pending.as_mut() {
                batch.samples.push((thread, window, weight));
            }
            finished
        };
        if let Some(batch) = finished {
            self.flush(batch);
        }
    }

    fn tree(&self) -> BTreeMap<SharedStr, Arc<ThreadNode>> {
        self.tree.tree()
    }

    fn prune_data(&self, expired: &dyn Fn(WindowId) -> bool) {
        self.tree.prune(expired);
    }

    fn complete(&self) {
        let last = self.pending.lock().take();
        if let Some(batch) = last {
            self.flush(batch);
        }
    }

    fn metadata(&self) -> AggregatorMetadata {
        AggregatorMetadata {
            kind: AggregatorKind::Ticked,
            ignore_sleeping: self.tree.ignores_sleeping(),
            tick_length_threshold_ms: Some(self.threshold_micros / 1_000),
            included_ticks: Some(self.included.total()),
        }
    }

    fn grouper(&self) -> &dyn ThreadGrouper {
        self.tree.grouper()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::ThreadGrouping;
    use crate::model::StackFrame;
    use crate::tick::ManualTickCounter;

    const INTERVAL: u64 = 10_000;

    fn sample() -> ThreadSnapshot {
        ThreadSnapshot::new(1, "Server thread", vec![StackFrame::new("Server", "tick", Some(1))])
    }

    fn aggregator(ticks: &Arc<ManualTickCounter>, threshold_micros: u64) -> TickedDataAggregator {
        TickedDataAggregator::new(
            ThreadGrouping::ByName.grouper(),
            300,
            None,
            Arc::clone(ticks) as Arc<dyn TickSource>,
            INTERVAL,
            threshold_micros,
        )
    }

    fn total(agg: &TickedDataAggregator) -> u64 {
        agg.tree().values().map(|t| t.total_time()).sum()
    }

    #[test]
    fn holds_samples_until_the_tick_ends() {
        let ticks = Arc::new(ManualTickCounter::new());
        let agg = aggregator(&ticks, 0);
        agg.insert_data(sample(), 0, INTERVAL);
        agg.insert_data(sample(), 0, INTERVAL);
        assert_eq!(total(&agg), 0);

        ticks.advance();
        agg.insert_data(sample(), 0, INTERVAL);
        assert_eq!(total(&agg), 2 * INTERVAL);
        assert_eq!(agg.included_ticks().total(), 1);

        agg.complete();
        assert_eq!(total(&agg), 3 * INTERVAL);
        assert_eq!(agg.included_ticks().total(), 2);
    }

    #[test]
    fn drops_ticks_below_threshold() {
        let ticks = Arc::new(ManualTickCounter::new());
        // 30ms threshold with 10ms samples: a tick needs three samples.
        let agg = aggregator(&ticks, 30_000);

        agg.insert_data(sample(), 0, INTERVAL);
        agg.insert_data(sample(), 0, INTERVAL);
        ticks.advance();
        for _ in 0..3 {
            agg.insert_data(sample(), 0, INTERVAL);
        }
        ticks.advance();
        agg.insert_data(sample(), 0, INTERVAL);

        assert_eq!(total(&agg), 3 * INTERVAL);
        assert_eq!(agg.included_ticks().total(), 1);

        let metadata = agg.metadata();
        assert_eq!(metadata.kind, AggregatorKind::Ticked);
        assert_eq!(metadata.tick_length_threshold_ms, Some(30));
        assert_eq!(metadata.included_ticks, Some(1));
    }

    /// Replays a fixed sequence of tick readings, then repeats the last.
    struct ScriptedTicks(Mutex<Vec<u64>>);

    impl TickSource for ScriptedTicks {
        fn current_tick(&self) -> u64 {
            let mut script = self.0.lock();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script.first().copied().unwrap_or(0)
            }
        }
    }

    #[test]
    fn stale_tick_joins_the_open_batch() {
        let ticks = Arc::new(ScriptedTicks(Mutex::new(vec![5, 6, 5, 6])));
        let agg = TickedDataAggregator::new(
            ThreadGrouping::ByName.grouper(),
            300,
            None,
            ticks,
            INTERVAL,
            0,
        );
        for _ in 0..4 {
            agg.insert_data(sample(), 0, INTERVAL);
        }
        agg.complete();
        assert_eq!(agg.included_ticks().total(), 2);
        assert_eq!(total(&agg), 4 * INTERVAL);
    }

    #[test]
    fn racing_inserters_never_split_a_tick() {
        let ticks = Arc::new(ManualTickCounter::new());
        let agg = Arc::new(aggregator(&ticks, 0));
        let inserters: Vec<_> = (0..4)
            .map(|_| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        agg.insert_data(sample(), 0, INTERVAL);
                    }
                })
            })
            .collect();
        let mut advanced = 0;
        while inserters.iter().any(|h| !h.is_finished()) && advanced < 50 {
            ticks.advance();
            advanced += 1;
            std::thread::yield_now();
        }
        for handle in inserters {
            handle.join().unwrap();
        }
        agg.complete();

        // Ticks 0..=advanced are the only ones that existed.
        assert!(agg.included_ticks().total() <= advanced + 1);
        assert_eq!(total(&agg), 8_000 * INTERVAL);
    }

    #[test]
    fn complete_without_samples_is_noop() {
        let ticks = Arc::new(ManualTickCounter::new());
        let agg = aggregator(&ticks, 0);
        agg.complete();
        assert!(agg.tree().is_empty());
        assert_eq!(agg.included_ticks().total(), 0);
    }
}
