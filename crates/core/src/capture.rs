use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use spindle_protocol::SharedStr;
use thiserror::Error;

use crate::config::ConfigError;
use crate::model::StackFrame;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("thread capture failed: {0}")]
    Capture(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadState {
    New,
    #[default]
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
    Unknown,
}

/// One thread's stack at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub id: u64,
    /// Empty when the thread exited before its name could be read; such
    /// snapshots are skipped.
    pub name: SharedStr,
    #[serde(default)]
    pub state: ThreadState,
    /// Innermost frame first.
    pub frames: Vec<StackFrame>,
}

impl ThreadSnapshot {
    pub fn new(id: u64, name: impl Into<SharedStr>, frames: Vec<StackFrame>) -> Self {
        Self {
            id,
            name: name.into(),
            state: ThreadState::Runnable,
            frames,
        }
    }

    pub fn with_state(mut self, state: ThreadState) -> Self {
        self.state = state;
        self
    }

    /// The frame the thread was executing.
    pub fn leaf(&self) -> Option<&StackFrame> {
        self.frames.first()
    }
}

/// Host capability producing a stack snapshot of some set of threads.
pub trait ThreadDumper: Send + Sync {
    fn dump(&self) -> Result<Vec<ThreadSnapshot>, DumpError>;

    /// Short description of which threads are captured.
    fn description(&self) -> String {
        "custom".to_string()
    }
}

impl<F> ThreadDumper for F
where
    F: Fn() -> Result<Vec<ThreadSnapshot>, DumpError> + Send + Sync,
{
    fn dump(&self) -> Result<Vec<ThreadSnapshot>, DumpError> {
        self()
    }
}

/// Returns the same threads on every capture.
#[derive(Debug, Clone, Default)]
pub struct StaticDumper {
    threads: Vec<ThreadSnapshot>,
}

impl StaticDumper {
    pub fn new(threads: Vec<ThreadSnapshot>) -> Self {
        Self { threads }
    }
}

impl ThreadDumper for StaticDumper {
    fn dump(&self) -> Result<Vec<ThreadSnapshot>, DumpError> {
        Ok(self.threads.clone())
    }

    fn description(&self) -> String {
        format!("static ({} threads)", self.threads.len())
    }
}

/// Which captured threads to keep.
#[derive(Debug, Clone, Default)]
pub enum ThreadFilter {
    #[default]
    All,
    Ids(HashSet<u64>),
    /// Exact names, compared case-insensitively.
    Names(HashSet<String>),
    /// Case-insensitive patterns matched against the whole name.
    Patterns(Vec<Regex>),
}

impl ThreadFilter {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Names(names.into_iter().map(|n| n.as_ref().to_lowercase()).collect())
    }

    pub fn patterns<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| {
                RegexBuilder::new(&format!("^(?:{})$", p.as_ref()))
                    .case_insensitive(true)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::Patterns(compiled))
    }

    fn matches(&self, thread: &ThreadSnapshot) -> bool {
        match self {
            Self::All => true,
            Self::Ids(ids) => ids.contains(&thread.id),
            Self::Names(names) => names.contains(&thread.name.to_lowercase()),
            Self::Patterns(patterns) => patterns.iter().any(|p| p.is_match(&thread.name)),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Ids(ids) => {
                let mut ids: Vec<_> = ids.iter().collect();
                ids.sort();
                format!("ids: {ids:?}")
            }
            Self::Names(names) => {
                let mut names: Vec<_> = names.iter().map(String::as_str).collect();
                names.sort_unstable();
                format!("names: {}", names.join(", "))
            }
            Self::Patterns(patterns) => {
                let sources: Vec<_> = patterns.iter().map(Regex::as_str).collect();
                format!("patterns: {}", sources.join(", "))
            }
        }
    }
}

/// Applies a [`ThreadFilter`] to another dumper's output.
///
/// Pattern and name results are cached per thread id; the cache entry is
/// recomputed if the thread's name changes.
pub struct FilteredDumper<D> {
    inner: D,
    filter: ThreadFilter,
    verdicts: RwLock<HashMap<u64, (SharedStr, bool)>>,
}

impl<D: ThreadDumper> FilteredDumper<D> {
    pub fn new(inner: D, filter: ThreadFilter) -> Self {
        Self {
            inner,
            filter,
            verdicts: RwLock::new(HashMap::new()),
        }
    }

    fn accepts(&self, thread: &ThreadSnapshot) -> bool {
        match &self.filter {
            ThreadFilter::All => return true,
            ThreadFilter::Ids(ids) => return ids.contains(&thread.id),
            ThreadFilter::Names(_) | ThreadFilter::Patterns(_) => {}
        }
        if let Some((name, verdict)) = self.verdicts.read().get(&thread.id)
            && *name == thread.name
        {
            return *verdict;
        }
        let verdict = self.filter.matches(thread);
        self.verdicts
            .write()
            .insert(thread.id, (thread.name.clone(), verdict));
        verdict
    }
}

impl<D: ThreadDumper> ThreadDumper for FilteredDumper<D> {
    fn dump(&self) -> Result<Vec<ThreadSnapshot>, DumpError> {
        let mut threads = self.inner.dump()?;
        threads.retain(|t| self.accepts(t));
        Ok(threads)
    }

    fn description(&self) -> String {
        self.filter.description()
    }
}
