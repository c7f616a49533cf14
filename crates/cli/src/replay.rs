//! Collapsed-stack captures replayed as a live thread dumper.
//!
//! Each non-empty line is `thread;frame;frame;... count`, frames written
//! outermost-first as `Class.method` or `Class.method:line`. Lines starting
//! with `#` are comments.

use std::sync::atomic::{AtomicU64, Ordering};

use spindle_core::{DumpError, StackFrame, ThreadDumper, ThreadSnapshot};
use spindle_protocol::SharedStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("line {line}: missing sample count")]
    MissingCount { line: usize },
    #[error("line {line}: invalid sample count {count:?}")]
    InvalidCount { line: usize, count: String },
    #[error("line {line}: missing thread name")]
    MissingThread { line: usize },
    #[error("line {line}: malformed frame {frame:?}")]
    Frame { line: usize, frame: String },
    #[error("capture contains no samples")]
    Empty,
}

#[derive(Debug)]
struct ReplayThread {
    id: u64,
    name: SharedStr,
    /// Cumulative sample count at the end of each stack, with the stack in
    /// innermost-first order.
    stacks: Vec<(u64, Vec<StackFrame>)>,
}

impl ReplayThread {
    fn total(&self) -> u64 {
        self.stacks.last().map_or(0, |(end, _)| *end)
    }

    fn stack_at(&self, cursor: u64) -> Option<&[StackFrame]> {
        let position = cursor % self.total().max(1);
        let index = self.stacks.partition_point(|(end, _)| *end <= position);
        self.stacks.get(index).map(|(_, frames)| frames.as_slice())
    }
}

/// A parsed capture.
#[derive(Debug)]
pub struct Capture {
    threads: Vec<ReplayThread>,
}

impl Capture {
    pub fn parse(text: &str) -> Result<Self, CaptureError> {
        let mut threads: Vec<ReplayThread> = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let (stack, count) = raw
                .rsplit_once(char::is_whitespace)
                .ok_or(CaptureError::MissingCount { line })?;
            let count: u64 = count.parse().map_err(|_| CaptureError::InvalidCount {
                line,
                count: count.to_string(),
            })?;
            if count == 0 {
                continue;
            }

            let mut parts = stack.trim_end().split(';');
            let name = parts
                .next()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .ok_or(CaptureError::MissingThread { line })?;
            let mut frames = parts
                .map(|frame| parse_frame(frame.trim(), line))
                .collect::<Result<Vec<_>, _>>()?;
            frames.reverse();

            let thread = match threads.iter_mut().position(|t| t.name == name) {
                Some(i) => &mut threads[i],
                None => {
                    threads.push(ReplayThread {
                        id: threads.len() as u64 + 1,
                        name: name.into(),
                        stacks: Vec::new(),
                    });
                    let last = threads.len() - 1;
                    &mut threads[last]
                }
            };
            let end = thread.total() + count;
            thread.stacks.push((end, frames));
        }
        if threads.is_empty() {
            return Err(CaptureError::Empty);
        }
        Ok(Self { threads })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

fn parse_frame(frame: &str, line: usize) -> Result<StackFrame, CaptureError> {
    let malformed = || CaptureError::Frame {
        line,
        frame: frame.to_string(),
    };
    let (qualified, line_number) = match frame.rsplit_once(':') {
        Some((head, tail)) => (head, Some(tail.parse::<u32>().map_err(|_| malformed())?)),
        None => (frame, None),
    };
    let (class, method) = qualified.rsplit_once('.').ok_or_else(malformed)?;
    if class.is_empty() || method.is_empty() {
        return Err(malformed());
    }
    Ok(StackFrame::new(class, method, line_number))
}

/// Serves a [`Capture`] one tick at a time.
///
/// Every capture advances a cursor; each thread returns the stack whose
/// cumulative sample range covers the cursor, so a long replay reproduces
/// the capture's proportions.
#[derive(Debug)]
pub struct ReplayDumper {
    capture: Capture,
    cursor: AtomicU64,
}

impl ReplayDumper {
    pub fn new(capture: Capture) -> Self {
        Self {
            capture,
            cursor: AtomicU64::new(0),
        }
    }
}

impl ThreadDumper for ReplayDumper {
    fn dump(&self) -> Result<Vec<ThreadSnapshot>, DumpError> {
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .capture
            .threads
            .iter()
            .filter_map(|thread| {
                let frames = thread.stack_at(cursor)?;
                Some(ThreadSnapshot::new(thread.id, thread.name.clone(), frames.to_vec()))
            })
            .collect())
    }

    fn description(&self) -> String {
        format!("replay ({} threads)", self.capture.thread_count())
    }
}
