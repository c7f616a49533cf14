use std::collections::BTreeMap;
use std::sync::Arc;

use spindle_protocol::{AggregatorKind, AggregatorMetadata, SharedStr};

use super::{CallTree, DataAggregator, IdleClassifier};
use crate::capture::ThreadSnapshot;
use crate::grouping::ThreadGrouper;
use crate::model::ThreadNode;
use crate::window::WindowId;

/// Inserts every sample into the tree as soon as it arrives.
pub struct SimpleDataAggregator {
    tree: CallTree,
}

impl SimpleDataAggregator {
    /// `idle` enables the sleeping-thread filter.
    pub fn new(
        grouper: Box<dyn ThreadGrouper>,
        max_depth: usize,
        idle: Option<IdleClassifier>,
    ) -> Self {
        Self {
            tree: CallTree::new(grouper, max_depth, idle),
        }
    }
}

impl DataAggregator for SimpleDataAggregator {
    fn insert_data(&self, thread: ThreadSnapshot, window: WindowId, weight: u64) {
        if self.tree.filtered(&thread) {
            return;
        }
        self.tree.write(&thread, window, weight);
    }

    fn tree(&self) -> BTreeMap<SharedStr, Arc<ThreadNode>> {
        self.tree.tree()
    }

    fn prune_data(&self, expired: &dyn Fn(WindowId) -> bool) {
        self.tree.prune(expired);
    }

    fn metadata(&self) -> AggregatorMetadata {
        AggregatorMetadata {
            kind: AggregatorKind::Simple,
            ignore_sleeping: self.tree.ignores_sleeping(),
            tick_length_threshold_ms: None,
            included_ticks: None,
        }
    }

    fn grouper(&self) -> &dyn ThreadGrouper {
        self.tree.grouper()
    }
}
