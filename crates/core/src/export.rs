//! Turning live call trees into [`SamplerProfile`](spindle_protocol::SamplerProfile)
//! payloads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use spindle_protocol::{NodeExport, SharedStr, ThreadGroupExport};
use tracing::warn;

use crate::merge::MergeMode;
use crate::model::{Node, ThreadNode};
use crate::sampler::worker::panic_message;
use crate::window::{WindowId, WindowSelection};

/// Names the plugin or module that owns a class, for annotating exported
/// nodes.
pub trait ClassSourceLookup: Send + Sync {
    fn identify(&self, class_name: &str, method_name: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeEncoding {
    /// One value per exported window, aligned with `time_windows`.
    #[default]
    PerWindow,
    /// Only the total over the selected windows.
    Aggregated,
}

#[derive(Clone, Default)]
pub struct ExportOptions {
    pub merge_mode: MergeMode,
    pub windows: WindowSelection,
    pub times: TimeEncoding,
    pub class_source: Option<Arc<dyn ClassSourceLookup>>,
}

impl ExportOptions {
    pub fn with_merge_mode(mut self, merge_mode: MergeMode) -> Self {
        self.merge_mode = merge_mode;
        self
    }

    pub fn with_windows(mut self, windows: WindowSelection) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_times(mut self, times: TimeEncoding) -> Self {
        self.times = times;
        self
    }

    pub fn with_class_source(mut self, lookup: Arc<dyn ClassSourceLookup>) -> Self {
        self.class_source = Some(lookup);
        self
    }
}

impl std::fmt::Debug for ExportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportOptions")
            .field("merge_mode", &self.merge_mode)
            .field("windows", &self.windows)
            .field("times", &self.times)
            .field("class_source", &self.class_source.is_some())
            .finish()
    }
}

/// Caches lookups for the duration of one export and contains failures.
struct SourceResolver<'a> {
    lookup: Option<&'a dyn ClassSourceLookup>,
    cache: HashMap<(SharedStr, SharedStr), Option<String>>,
}

impl SourceResolver<'_> {
    fn resolve(&mut self, class_name: &SharedStr, method_name: &SharedStr) -> Option<String> {
        let lookup = self.lookup?;
        self.cache
            .entry((class_name.clone(), method_name.clone()))
            .or_insert_with(|| {
                panic::catch_unwind(AssertUnwindSafe(|| {
                    lookup.identify(class_name, method_name)
                }))
                .unwrap_or_else(|panic| {
                    warn!(
                        class = %class_name,
                        panic = panic_message(&*panic),
                        "class source lookup failed"
                    );
                    None
                })
            })
            .clone()
    }
}

struct Flattener<'a> {
    mode: &'a MergeMode,
    windows: &'a [WindowId],
    encoding: TimeEncoding,
    sources: SourceResolver<'a>,
    nodes: Vec<NodeExport>,
}

impl Flattener<'_> {
    fn times(&self, node: &Node) -> Vec<u64> {
        match self.encoding {
            TimeEncoding::PerWindow => self.windows.iter().map(|&w| node.times().get(w)).collect(),
            TimeEncoding::Aggregated => Vec::new(),
        }
    }

    /// Append `node`'s children in pre-order and return their indexes.
    fn children(&mut self, node: &Node) -> Vec<u32> {
        let mut refs = Vec::new();
        for child in node.export_children(self.mode) {
            let Some(site) = child.site() else {
                continue;
            };
            let index = self.nodes.len();
            refs.push(index as u32);
            let source = self.sources.resolve(&site.class_name, &site.method_name);
            self.nodes.push(NodeExport {
                class_name: site.class_name.clone(),
                method_name: site.method_name.clone(),
                line_number: site.line_number(),
                parent_line_number: site.parent_line_number(),
                method_descriptor: site.method_descriptor().cloned(),
                source,
                total_time: child.total_time(),
                times: self.times(&child),
                children_refs: Vec::new(),
            });
            let grandchildren = self.children(&child);
            self.nodes[index].children_refs = grandchildren;
        }
        refs
    }
}

/// Export every non-empty group in `tree`.
///
/// Returns the groups, ordered by total time descending then key, and the
/// sorted list of windows their per-window `times` are aligned with. Only
/// windows accepted by `options.windows` contribute.
pub fn export_threads(
    tree: &BTreeMap<SharedStr, Arc<ThreadNode>>,
    options: &ExportOptions,
) -> (Vec<ThreadGroupExport>, Vec<WindowId>) {
    let keep = |w: WindowId| options.windows.contains(w);
    let windows: Vec<WindowId> = tree
        .values()
        .flat_map(|thread| thread.root().times().windows())
        .filter(|&w| keep(w))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut flattener = Flattener {
        mode: &options.merge_mode,
        windows: &windows,
        encoding: options.times,
        sources: SourceResolver {
            lookup: options.class_source.as_deref(),
            cache: HashMap::new(),
        },
        nodes: Vec::new(),
    };

    let mut groups = Vec::with_capacity(tree.len());
    for (key, thread) in tree {
        let root = thread.root().detached_copy(&keep);
        if root.times().is_empty() {
            continue;
        }
        let children_refs = flattener.children(&root);
        groups.push(ThreadGroupExport {
            key: key.clone(),
            label: thread.label(),
            total_time: root.total_time(),
            times: flattener.times(&root),
            children_refs,
            nodes: std::mem::take(&mut flattener.nodes),
        });
    }

    groups.sort_by(|a, b| b.total_time.cmp(&a.total_time).then_with(|| a.key.cmp(&b.key)));
    (groups, windows)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::model::StackFrame;

    /// Innermost-first frames from an outermost-first list of `(method, line)`.
    fn stack(calls: &[(&str, u32)]) -> Vec<StackFrame> {
        calls
            .iter()
            .rev()
            .map(|(m, l)| StackFrame::new("App", *m, Some(*l)))
            .collect()
    }

    fn tree(threads: Vec<ThreadNode>) -> BTreeMap<SharedStr, Arc<ThreadNode>> {
        threads
            .into_iter()
            .map(|t| (t.key().clone(), Arc::new(t)))
            .collect()
    }

    fn names(group: &ThreadGroupExport, refs: &[u32]) -> Vec<String> {
        refs.iter()
            .map(|&i| group.node(i).unwrap().method_name.to_string())
            .collect()
    }

    #[test]
    fn flattens_in_pre_order_sorted_by_time() {
        let t = ThreadNode::new("T".into());
        t.record(&stack(&[("main", 1), ("a", 10)]), 0, 30, 300);
        t.record(&stack(&[("main", 1), ("b", 20)]), 0, 20, 300);
        t.record(&stack(&[("main", 1), ("c", 30)]), 1, 10, 300);

        let (groups, windows) = export_threads(&tree(vec![t]), &ExportOptions::default());
        assert_eq!(windows, [0, 1]);
        let group = &groups[0];
        assert_eq!(group.total_time, 60);
        assert_eq!(group.times, [50, 10]);
        assert_eq!(names(group, &group.children_refs), ["main"]);

        let main = group.node(group.children_refs[0]).unwrap();
        assert_eq!(main.total_time, 60);
        assert_eq!(names(group, &main.children_refs), ["a", "b", "c"]);
        // Pre-order: main first, then its children.
        assert_eq!(group.children_refs, [0]);
        assert_eq!(main.children_refs, [1, 2, 3]);
        let c = group.node(3).unwrap();
        assert_eq!(c.times, [0, 10]);
        assert_eq!(c.parent_line_number, Some(1));
    }

    #[test]
    fn merge_mode_controls_parent_line_splitting() {
        let t = ThreadNode::new("T".into());
        t.record(&stack(&[("main", 5), ("read", 1)]), 0, 10, 300);
        t.record(&stack(&[("main", 9), ("read", 1)]), 0, 15, 300);
        let tree = tree(vec![t]);

        let (merged, _) = export_threads(&tree, &ExportOptions::default());
        let group = &merged[0];
        let main = group.node(group.children_refs[0]).unwrap();
        assert_eq!(main.children_refs.len(), 1);
        assert_eq!(group.node(main.children_refs[0]).unwrap().total_time, 25);

        let options = ExportOptions::default().with_merge_mode(MergeMode::separate_parent_calls());
        let (split, _) = export_threads(&tree, &options);
        let group = &split[0];
        let main = group.node(group.children_refs[0]).unwrap();
        let totals: Vec<u64> = group
            .children_of(main)
            .map(|n| n.total_time)
            .collect();
        assert_eq!(totals, [15, 10]);

        // Exporting never mutates the live tree.
        assert_eq!(tree["T"].root().total_time(), 25);
    }

    #[test]
    fn window_selection_drops_groups_without_time() {
        let busy = ThreadNode::new("busy".into());
        busy.record(&stack(&[("run", 1)]), 3, 40, 300);
        busy.record(&stack(&[("run", 1)]), 4, 40, 300);
        let old = ThreadNode::new("old".into());
        old.record(&stack(&[("run", 1)]), 1, 99, 300);

        let options = ExportOptions::default()
            .with_windows(WindowSelection::Range(3..=4))
            .with_times(TimeEncoding::Aggregated);
        let (groups, windows) = export_threads(&tree(vec![busy, old]), &options);
        assert_eq!(windows, [3, 4]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "busy");
        assert_eq!(groups[0].total_time, 80);
        assert!(groups[0].times.is_empty());
    }

    #[test]
    fn groups_sorted_by_total_then_key() {
        let threads = ["b", "a", "c"]
            .iter()
            .zip([10, 10, 30])
            .map(|(key, time)| {
                let t = ThreadNode::new((*key).into());
                t.record(&stack(&[("run", 1)]), 0, time, 300);
                t
            })
            .collect();
        let (groups, _) = export_threads(&tree(threads), &ExportOptions::default());
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, ["c", "a", "b"]);
    }

    struct Counting(AtomicUsize);

    impl ClassSourceLookup for Counting {
        fn identify(&self, class_name: &str, method_name: &str) -> Option<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if method_name == "boom" {
                panic!("lookup exploded");
            }
            Some(format!("plugin-{class_name}"))
        }
    }

    #[test]
    fn class_source_is_cached_and_contained() {
        let t = ThreadNode::new("T".into());
        t.record(&stack(&[("run", 1), ("run", 2)]), 0, 1, 300);
        t.record(&stack(&[("boom", 1)]), 0, 1, 300);

        let lookup = Arc::new(Counting(AtomicUsize::new(0)));
        let options = ExportOptions::default().with_class_source(lookup.clone());
        let (groups, _) = export_threads(&tree(vec![t]), &options);
        let group = &groups[0];
        let sources: Vec<Option<&str>> = group.nodes.iter().map(|n| n.source.as_deref()).collect();
        assert!(sources.contains(&Some("plugin-App")));
        assert!(sources.contains(&None));
        // `App.run` twice and `App.boom` once, but only two lookups.
        assert_eq!(lookup.0.load(Ordering::SeqCst), 2);
    }
}
