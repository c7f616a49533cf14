use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::LazyLock;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use spindle_protocol::SharedStr;

use crate::config::ConfigError;

/// Maps sampled threads onto call-tree roots.
///
/// Called for every sample, so implementations memoize per thread id.
pub trait ThreadGrouper: Send + Sync {
    fn group(&self, thread_id: u64, thread_name: &str) -> SharedStr;

    /// Display label for a group key returned by [`group`](Self::group).
    fn label(&self, group: &str) -> String;

    fn kind(&self) -> ThreadGrouping;
}

/// Built-in grouping strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadGrouping {
    /// One root per thread name.
    ByName,
    /// Threads of a numbered pool (`Worker-1`, `Worker-2`, ...) share a root.
    #[default]
    ByPool,
    /// Every thread shares a single root.
    AsOne,
}

impl ThreadGrouping {
    pub fn grouper(self) -> Box<dyn ThreadGrouper> {
        match self {
            Self::ByName => Box::new(ByName::default()),
            Self::ByPool => Box::new(ByPool::default()),
            Self::AsOne => Box::new(AsOne::default()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ByName => "by-name",
            Self::ByPool => "by-pool",
            Self::AsOne => "as-one",
        }
    }
}

impl std::fmt::Display for ThreadGrouping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ThreadGrouping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "by-name" => Ok(Self::ByName),
            "by-pool" => Ok(Self::ByPool),
            "as-one" => Ok(Self::AsOne),
            other => Err(ConfigError::UnknownGrouping(other.to_string())),
        }
    }
}

/// Per-thread memo: the name a group was computed from, and the group.
type Memo = RwLock<HashMap<u64, (SharedStr, SharedStr)>>;

fn memoized(memo: &Memo, thread_id: u64, thread_name: &str) -> Option<SharedStr> {
    memo.read()
        .get(&thread_id)
        .filter(|(name, _)| *name == thread_name)
        .map(|(_, group)| group.clone())
}

#[derive(Debug, Default)]
pub struct ByName {
    memo: Memo,
}

impl ThreadGrouper for ByName {
    fn group(&self, thread_id: u64, thread_name: &str) -> SharedStr {
        if let Some(group) = memoized(&self.memo, thread_id, thread_name) {
            return group;
        }
        let group = SharedStr::from(thread_name);
        self.memo
            .write()
            .insert(thread_id, (group.clone(), group.clone()));
        group
    }

    fn label(&self, group: &str) -> String {
        group.to_string()
    }

    fn kind(&self) -> ThreadGrouping {
        ThreadGrouping::ByName
    }
}

#[allow(clippy::expect_used)]
static POOL_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)[-# ]+\d+$").expect("pool suffix pattern is valid"));

/// Strip a trailing `-<n>`, `#<n>` or ` <n>` from a thread name.
pub fn pool_name(thread_name: &str) -> &str {
    POOL_SUFFIX
        .captures(thread_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(thread_name)
}

#[derive(Debug, Default)]
pub struct ByPool {
    memo: Memo,
    members: Mutex<HashMap<SharedStr, HashSet<u64>>>,
}

impl ThreadGrouper for ByPool {
    fn group(&self, thread_id: u64, thread_name: &str) -> SharedStr {
        if let Some(group) = memoized(&self.memo, thread_id, thread_name) {
            return group;
        }
        let group = SharedStr::from(pool_name(thread_name));
        let previous = self
            .memo
            .write()
            .insert(thread_id, (thread_name.into(), group.clone()));
        let mut members = self.members.lock();
        // A renamed thread leaves its old pool.
        if let Some((_, old)) = previous
            && old != group
            && let Some(ids) = members.get_mut(&old)
        {
            ids.remove(&thread_id);
            if ids.is_empty() {
                members.remove(&old);
            }
        }
        members.entry(group.clone()).or_default().insert(thread_id);
        group
    }

    fn label(&self, group: &str) -> String {
        let count = self.members.lock().get(group).map_or(0, HashSet::len);
        format!("{group} (x{count})")
    }

    fn kind(&self) -> ThreadGrouping {
        ThreadGrouping::ByPool
    }
}

const ALL_GROUP: &str = "root";

#[derive(Debug, Default)]
pub struct AsOne {
    seen: RwLock<HashSet<u64>>,
}

impl ThreadGrouper for AsOne {
    fn group(&self, thread_id: u64, _thread_name: &str) -> SharedStr {
        if !self.seen.read().contains(&thread_id) {
            self.seen.write().insert(thread_id);
        }
        SharedStr::from(ALL_GROUP)
    }

    fn label(&self, _group: &str) -> String {
        format!("All (x{} threads)", self.seen.read().len())
    }

    fn kind(&self) -> ThreadGrouping {
        ThreadGrouping::AsOne
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_collapses_numbered_threads() {
        let grouper = ThreadGrouping::ByPool.grouper();
        assert_eq!(grouper.group(1, "Worker-3"), "Worker");
        assert_eq!(grouper.group(2, "Worker-17"), "Worker");
        assert_eq!(grouper.group(3, "Netty Epoll #4"), "Netty Epoll");
        assert_eq!(grouper.group(4, "Server thread"), "Server thread");
        assert_eq!(grouper.label("Worker"), "Worker (x2)");
    }

    #[test]
    fn by_name_keeps_threads_apart() {
        let grouper = ThreadGrouping::ByName.grouper();
        assert_ne!(grouper.group(1, "Worker-3"), grouper.group(2, "Worker-17"));
        assert_eq!(grouper.label("Worker-3"), "Worker-3");
    }

    #[test]
    fn memo_follows_renamed_threads() {
        let grouper = ByPool::default();
        assert_eq!(grouper.group(9, "Pool-1"), "Pool");
        assert_eq!(grouper.group(9, "Pool-1"), "Pool");
        assert_eq!(grouper.group(9, "Other-2"), "Other");
        assert_eq!(grouper.label("Other"), "Other (x1)");
        assert_eq!(grouper.label("Pool"), "Pool (x0)");
    }

    #[test]
    fn renamed_thread_keeps_pool_peers() {
        let grouper = ByPool::default();
        grouper.group(1, "Pool-1");
        grouper.group(2, "Pool-2");
        grouper.group(1, "Pool-7");
        assert_eq!(grouper.label("Pool"), "Pool (x2)");
        grouper.group(2, "IO-1");
        assert_eq!(grouper.label("Pool"), "Pool (x1)");
        assert_eq!(grouper.label("IO"), "IO (x1)");
    }

    #[test]
    fn pool_name_keeps_suffix_only_names() {
        assert_eq!(pool_name("#12"), "#12");
        assert_eq!(pool_name("pool-2-thread-5"), "pool-2-thread");
    }

    #[test]
    fn as_one_counts_distinct_threads() {
        let grouper = AsOne::default();
        assert_eq!(grouper.group(1, "a"), "root");
        assert_eq!(grouper.group(2, "b"), "root");
        assert_eq!(grouper.group(1, "a"), "root");
        assert_eq!(grouper.label("root"), "All (x2 threads)");
    }

    #[test]
    fn parses_strategy_names() {
        assert_eq!("as-one".parse::<ThreadGrouping>().ok(), Some(ThreadGrouping::AsOne));
        assert!("by-color".parse::<ThreadGrouping>().is_err());
    }
}
