use serde::{Deserialize, Serialize};

use crate::capture::{ThreadSnapshot, ThreadState};

/// A `class`/`method` pair that only ever appears as the innermost frame of a
/// thread that is parked, sleeping or yielding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdleFrame {
    pub class: String,
    pub method: String,
}

impl IdleFrame {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }

    /// Common wait primitives of the JVM and Rust runtimes.
    pub fn defaults() -> Vec<IdleFrame> {
        [
            ("java.lang.Thread", "sleep"),
            ("java.lang.Thread", "yield"),
            ("java.lang.Object", "wait"),
            ("jdk.internal.misc.Unsafe", "park"),
            ("sun.misc.Unsafe", "park"),
            ("std::thread", "sleep"),
            ("std::thread", "park"),
            ("std::thread", "park_timeout"),
            ("std::thread", "yield_now"),
        ]
        .into_iter()
        .map(|(class, method)| IdleFrame::new(class, method))
        .collect()
    }
}

/// Decides whether a sampled thread is sleeping.
#[derive(Debug, Clone, Default)]
pub struct IdleClassifier {
    frames: Vec<IdleFrame>,
}

impl IdleClassifier {
    pub fn new(frames: Vec<IdleFrame>) -> Self {
        Self { frames }
    }

    pub fn is_sleeping(&self, thread: &ThreadSnapshot) -> bool {
        if matches!(thread.state, ThreadState::Waiting | ThreadState::TimedWaiting) {
            return true;
        }
        let Some(leaf) = thread.leaf() else {
            return false;
        };
        self.frames
            .iter()
            .any(|f| f.class == *leaf.class_name && f.method == *leaf.method_name)
    }
}
