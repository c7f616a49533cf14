use std::sync::Arc;

use parking_lot::RwLock;
use spindle_protocol::SharedStr;

use crate::model::{CallSite, Node, StackFrame};
use crate::window::WindowId;

/// Root of one thread group's call tree.
///
/// The label is kept apart from the key because it may depend on what the
/// grouper has seen so far (e.g. `Worker (x7)`).
#[derive(Debug)]
pub struct ThreadNode {
    key: SharedStr,
    label: RwLock<Option<String>>,
    root: Node,
}

impl ThreadNode {
    pub fn new(key: SharedStr) -> Self {
        Self {
            key,
            label: RwLock::new(None),
            root: Node::root(),
        }
    }

    pub fn key(&self) -> &SharedStr {
        &self.key
    }

    /// Display label, falling back to the group key.
    pub fn label(&self) -> String {
        self.label
            .read()
            .clone()
            .unwrap_or_else(|| self.key.to_string())
    }

    pub fn set_label(&self, label: impl Into<String>) {
        *self.label.write() = Some(label.into());
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn total_time(&self) -> u64 {
        self.root.total_time()
    }

    /// Record one sample.
    ///
    /// `frames` are innermost-first. The walk starts at the outermost frame
    /// so the tree reads from the thread entry point downwards; at most
    /// `max_depth` call-site levels are created and deeper frames are
    /// dropped. Every node on the path, the root included, gains `weight` in
    /// `window`.
    pub fn record(&self, frames: &[StackFrame], window: WindowId, weight: u64, max_depth: usize) {
        self.root.add_time(window, weight);

        let mut parent: Option<Arc<Node>> = None;
        let mut caller: Option<&StackFrame> = None;
        for frame in frames.iter().rev().take(max_depth) {
            let site = CallSite::from_frame(frame, caller);
            let node = match &parent {
                Some(p) => p.resolve_child(site),
                None => self.root.resolve_child(site),
            };
            node.add_time(window, weight);
            parent = Some(node);
            caller = Some(frame);
        }
    }

    /// Fold another group root into this one.
    pub fn merge(&self, other: &ThreadNode) {
        self.root.merge(&other.root);
    }
}
