use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::SharedStr;

/// The exported form of one sampling session.
///
/// ```text
///   ThreadDumper ──▶ Sampler ──▶ DataAggregator ──▶ call tree ──▶ SamplerProfile
///   (host)           (timer,      (grouping,         (per-window     (this)
///                     windows)     depth bound)       times)
/// ```
///
/// Each thread group carries a flat node table. Parents point at their
/// children by index (`children_refs`) so that consumers can walk the tree
/// without recursion limits and so the encoding stays stable for a given
/// tree, merge mode and window selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerProfile {
    pub metadata: SamplerMetadata,
    pub threads: Vec<ThreadGroupExport>,
    /// Window ids included in this export, ascending. Per-window `times`
    /// vectors are aligned to this list.
    pub time_windows: Vec<i64>,
    pub window_statistics: BTreeMap<i64, WindowStatistics>,
}

impl SamplerProfile {
    /// Look up a thread group by its group key.
    pub fn thread(&self, key: &str) -> Option<&ThreadGroupExport> {
        self.threads.iter().find(|t| t.key == key)
    }

    /// Sum of all thread group totals.
    pub fn total_time(&self) -> u64 {
        self.threads.iter().map(|t| t.total_time).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerMetadata {
    /// Unix millis when sampling started.
    pub start_time_ms: u64,
    /// Unix millis when the export was produced.
    pub end_time_ms: u64,
    pub interval_micros: u64,
    /// Which threads were captured (e.g. `all`, `names: main`).
    pub thread_dumper: String,
    /// Grouping strategy name.
    pub grouping: String,
    pub aggregator: AggregatorMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregatorKind {
    /// Every sample is inserted as it arrives.
    Simple,
    /// Samples are batched per host tick; short ticks are dropped.
    Ticked,
}

impl std::fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Ticked => write!(f, "ticked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorMetadata {
    pub kind: AggregatorKind,
    pub ignore_sleeping: bool,
    pub tick_length_threshold_ms: Option<u64>,
    /// Ticks that passed the threshold and were written to the tree.
    pub included_ticks: Option<u64>,
}

/// One thread group root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadGroupExport {
    /// Group key produced by the grouper.
    pub key: SharedStr,
    /// Display label, e.g. `Netty Epoll (x4)`.
    pub label: String,
    pub total_time: u64,
    /// Per-window times; empty when times were aggregated.
    pub times: Vec<u64>,
    /// Indexes into `nodes` of the root's direct children.
    pub children_refs: Vec<u32>,
    pub nodes: Vec<NodeExport>,
}

impl ThreadGroupExport {
    pub fn node(&self, index: u32) -> Option<&NodeExport> {
        self.nodes.get(index as usize)
    }

    /// Direct children of the root, in export order.
    pub fn root_children(&self) -> impl Iterator<Item = &NodeExport> {
        self.children_refs.iter().filter_map(|&i| self.node(i))
    }

    /// Children of `node`, in export order.
    pub fn children_of<'a>(&'a self, node: &'a NodeExport) -> impl Iterator<Item = &'a NodeExport> {
        node.children_refs.iter().filter_map(|&i| self.node(i))
    }
}

/// One call-site node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExport {
    pub class_name: SharedStr,
    pub method_name: SharedStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_descriptor: Option<SharedStr>,
    /// Owning plugin/module, when a source lookup resolved one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub total_time: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_refs: Vec<u32>,
}

impl NodeExport {
    /// `class.method`, used for display and tie-breaking.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }
}

/// Auxiliary statistics recorded for one window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStatistics {
    pub start_time_ms: u64,
    pub duration_ms: u64,
    /// Host ticks observed during the window.
    pub ticks: u64,
    /// Thread samples dispatched during the window.
    pub samples: u64,
    /// Distinct thread ids sampled during the window.
    pub threads: u64,
}
