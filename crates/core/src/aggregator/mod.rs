mod idle;
mod simple;
mod ticked;

pub use idle::{IdleClassifier, IdleFrame};
pub use simple::SimpleDataAggregator;
pub use ticked::{IncludedTicks, TickedDataAggregator};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use spindle_protocol::{AggregatorMetadata, SharedStr};

use crate::capture::ThreadSnapshot;
use crate::grouping::ThreadGrouper;
use crate::model::ThreadNode;
use crate::window::WindowId;

/// Turns samples into call-tree mutations.
pub trait DataAggregator: Send + Sync {
    /// Account one sample of `weight` microseconds to `window`.
    fn insert_data(&self, thread: ThreadSnapshot, window: WindowId, weight: u64);

    /// Group roots by group key, with labels refreshed from the grouper.
    fn tree(&self) -> BTreeMap<SharedStr, Arc<ThreadNode>>;

    /// Drop every window for which `expired` holds.
    fn prune_data(&self, expired: &dyn Fn(WindowId) -> bool);

    /// Flush anything still buffered. Called once when the session ends.
    fn complete(&self) {}

    fn metadata(&self) -> AggregatorMetadata;

    fn grouper(&self) -> &dyn ThreadGrouper;
}

/// State shared by every aggregator: the grouper, the group roots and the
/// sleeping-thread filter.
pub(crate) struct CallTree {
    grouper: Box<dyn ThreadGrouper>,
    threads: RwLock<HashMap<SharedStr, Arc<ThreadNode>>>,
    max_depth: usize,
    idle: Option<IdleClassifier>,
}

impl CallTree {
    pub(crate) fn new(
        grouper: Box<dyn ThreadGrouper>,
        max_depth: usize,
        idle: Option<IdleClassifier>,
    ) -> Self {
        Self {
            grouper,
            threads: RwLock::new(HashMap::new()),
            max_depth,
            idle,
        }
    }

    pub(crate) fn ignores_sleeping(&self) -> bool {
        self.idle.is_some()
    }

    /// Whether `thread` should be dropped before touching the tree.
    pub(crate) fn filtered(&self, thread: &ThreadSnapshot) -> bool {
        self.idle.as_ref().is_some_and(|idle| idle.is_sleeping(thread))
    }

    fn thread_node(&self, thread: &ThreadSnapshot) -> Arc<ThreadNode> {
        let key = self.grouper.group(thread.id, &thread.name);
        if let Some(node) = self.threads.read().get(&key) {
            return Arc::clone(node);
        }
        let mut threads = self.threads.write();
        Arc::clone(
            threads
                .entry(key)
                .or_insert_with_key(|key| Arc::new(ThreadNode::new(key.clone()))),
        )
    }

    pub(crate) fn write(&self, thread: &ThreadSnapshot, window: WindowId, weight: u64) {
        self.thread_node(thread)
            .record(&thread.frames, window, weight, self.max_depth);
    }

    pub(crate) fn tree(&self) -> BTreeMap<SharedStr, Arc<ThreadNode>> {
        self.threads
            .read()
            .iter()
            .map(|(key, node)| {
                node.set_label(self.grouper.label(key));
                (key.clone(), Arc::clone(node))
            })
            .collect()
    }

    /// Same unlink rule as [`Node::prune`](crate::model::Node::prune), one
    /// level up.
    pub(crate) fn prune(&self, expired: &dyn Fn(WindowId) -> bool) {
        let threads: Vec<_> = self.threads.read().values().cloned().collect();
        let mut idle = Vec::new();
        for node in threads {
            let was_empty = node.root().times().is_empty();
            node.root().prune(expired);
            if was_empty && node.root().times().is_empty() {
                idle.push(node.key().clone());
            }
        }
        if idle.is_empty() {
            return;
        }
        self.threads.write().retain(|key, node| {
            !(idle.contains(key) && node.root().times().is_empty() && Arc::strong_count(node) == 1)
        });
    }

    pub(crate) fn grouper(&self) -> &dyn ThreadGrouper {
        self.grouper.as_ref()
    }
}
