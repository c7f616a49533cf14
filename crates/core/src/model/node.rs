use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::merge::MergeMode;
use crate::model::CallSite;
use crate::window::WindowId;

/// Accumulated time per window, safe for concurrent adds.
///
/// Counters only grow. The one way to lower a value is to drop its whole
/// window through [`WindowTimes::remove_if`].
#[derive(Debug, Default)]
pub struct WindowTimes {
    windows: RwLock<HashMap<WindowId, AtomicU64>>,
}

impl WindowTimes {
    pub fn add(&self, window: WindowId, value: u64) {
        {
            let windows = self.windows.read();
            if let Some(counter) = windows.get(&window) {
                counter.fetch_add(value, Ordering::Relaxed);
                return;
            }
        }
        self.windows
            .write()
            .entry(window)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, window: WindowId) -> u64 {
        self.windows
            .read()
            .get(&window)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn total(&self) -> u64 {
        self.windows
            .read()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Current values, ordered by window id.
    pub fn snapshot(&self) -> BTreeMap<WindowId, u64> {
        self.windows
            .read()
            .iter()
            .map(|(&w, c)| (w, c.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn windows(&self) -> Vec<WindowId> {
        self.windows.read().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.read().is_empty()
    }

    /// Drop every window matching `expired`.
    pub fn remove_if(&self, expired: &dyn Fn(WindowId) -> bool) {
        self.windows.write().retain(|&w, _| !expired(w));
    }

    /// Add all of `other`'s windows into `self`.
    pub fn merge(&self, other: &WindowTimes) {
        for (window, value) in other.snapshot() {
            self.add(window, value);
        }
    }
}

/// A node of the call tree.
///
/// Group roots carry no call site; every other node is keyed in its parent
/// by its [`CallSite`].
#[derive(Debug)]
pub struct Node {
    site: Option<CallSite>,
    children: RwLock<HashMap<CallSite, Arc<Node>>>,
    times: WindowTimes,
}

impl Node {
    pub(crate) fn root() -> Self {
        Self {
            site: None,
            children: RwLock::new(HashMap::new()),
            times: WindowTimes::default(),
        }
    }

    pub fn new(site: CallSite) -> Self {
        Self {
            site: Some(site),
            children: RwLock::new(HashMap::new()),
            times: WindowTimes::default(),
        }
    }

    pub fn site(&self) -> Option<&CallSite> {
        self.site.as_ref()
    }

    pub fn times(&self) -> &WindowTimes {
        &self.times
    }

    pub fn add_time(&self, window: WindowId, value: u64) {
        self.times.add(window, value);
    }

    pub fn total_time(&self) -> u64 {
        self.times.total()
    }

    /// Get or create the child for `site`.
    ///
    /// Concurrent callers racing on the same site all receive the node that
    /// ended up in the map.
    pub fn resolve_child(&self, site: CallSite) -> Arc<Node> {
        if let Some(child) = self.children.read().get(&site) {
            return Arc::clone(child);
        }
        let mut children = self.children.write();
        Arc::clone(
            children
                .entry(site)
                .or_insert_with_key(|site| Arc::new(Node::new(site.clone()))),
        )
    }

    pub fn child(&self, site: &CallSite) -> Option<Arc<Node>> {
        self.children.read().get(site).cloned()
    }

    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.read().values().cloned().collect()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Fold `other` into `self`: times are added per window and children are
    /// matched by call site, recursively.
    pub fn merge(&self, other: &Node) {
        if std::ptr::eq(self, other) {
            return;
        }
        self.times.merge(&other.times);
        for child in other.children() {
            let Some(site) = child.site.clone() else {
                continue;
            };
            self.resolve_child(site).merge(&child);
        }
    }

    /// Remove expired windows from this subtree.
    ///
    /// Children are pruned without holding this node's map lock, so inserts
    /// keep resolving children meanwhile. A child is unlinked only if it was
    /// already empty when this pass reached it, is still empty, and no
    /// inserter holds a reference to it.
    pub fn prune(&self, expired: &dyn Fn(WindowId) -> bool) {
        self.times.remove_if(expired);

        let children = self.children();
        let mut idle = Vec::new();
        for child in children {
            let was_empty = child.times.is_empty();
            child.prune(expired);
            if was_empty
                && child.times.is_empty()
                && let Some(site) = &child.site
            {
                idle.push(site.clone());
            }
        }
        if idle.is_empty() {
            return;
        }

        self.children.write().retain(|site, child| {
            !(idle.contains(site) && child.times.is_empty() && Arc::strong_count(child) == 1)
        });
    }

    /// Deep copy keeping only windows accepted by `keep`. Branches left with
    /// no time are skipped.
    pub fn detached_copy(&self, keep: &dyn Fn(WindowId) -> bool) -> Node {
        let copy = Node {
            site: self.site.clone(),
            children: RwLock::new(HashMap::new()),
            times: WindowTimes::default(),
        };
        for (window, value) in self.times.snapshot() {
            if keep(window) {
                copy.times.add(window, value);
            }
        }
        let children: HashMap<_, _> = self
            .children
            .read()
            .iter()
            .map(|(site, child)| (site.clone(), child.detached_copy(keep)))
            .filter(|(_, child)| !child.times.is_empty())
            .map(|(site, child)| (site, Arc::new(child)))
            .collect();
        *copy.children.write() = children;
        copy
    }

    /// Children for presentation, with siblings that `mode` judges to be the
    /// same call site merged together.
    ///
    /// Merging mutates the surviving sibling, so call this on a
    /// [`detached_copy`](Self::detached_copy). Output is ordered by total time
    /// descending, then by call site.
    pub fn export_children(&self, mode: &MergeMode) -> Vec<Arc<Node>> {
        let mut children = self.children();
        children.sort_by(|a, b| a.site.cmp(&b.site));

        let mut merged: Vec<Arc<Node>> = Vec::with_capacity(children.len());
        for child in children {
            let target = merged.iter().find(|existing| match (&existing.site, &child.site) {
                (Some(a), Some(b)) => mode.should_merge(a, b),
                _ => false,
            });
            match target {
                Some(existing) => existing.merge(&child),
                None => merged.push(child),
            }
        }

        let mut keyed: Vec<_> = merged.into_iter().map(|n| (n.total_time(), n)).collect();
        keyed.sort_by(|(ta, a), (tb, b)| tb.cmp(ta).then_with(|| a.site.cmp(&b.site)));
        keyed.into_iter().map(|(_, n)| n).collect()
    }
}
