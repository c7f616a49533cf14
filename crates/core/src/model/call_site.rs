use serde::{Deserialize, Serialize};
use spindle_protocol::SharedStr;

/// One frame of a captured stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub class_name: SharedStr,
    pub method_name: SharedStr,
    /// Source line, if the runtime reported one.
    #[serde(default)]
    pub line_number: Option<u32>,
    /// Exact method signature, when the capture can disambiguate overloads.
    #[serde(default)]
    pub method_descriptor: Option<SharedStr>,
}

impl StackFrame {
    pub fn new(
        class_name: impl Into<SharedStr>,
        method_name: impl Into<SharedStr>,
        line_number: Option<u32>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            line_number,
            method_descriptor: None,
        }
    }

    pub fn with_descriptor(mut self, descriptor: impl Into<SharedStr>) -> Self {
        self.method_descriptor = Some(descriptor.into());
        self
    }
}

/// How a call site is pinned down beyond its class and method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallSiteLocation {
    /// Line-based capture: the sampled line inside the method, and the line
    /// in the caller that made the call.
    Line {
        line: Option<u32>,
        parent_line: Option<u32>,
    },
    /// Signature-based capture.
    Descriptor(SharedStr),
}

/// Value identity of a call-tree node.
///
/// Children are keyed by this type, so two inserts that describe the same
/// call site under the same parent always land on the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSite {
    pub class_name: SharedStr,
    pub method_name: SharedStr,
    pub location: CallSiteLocation,
}

impl CallSite {
    pub fn line(
        class_name: impl Into<SharedStr>,
        method_name: impl Into<SharedStr>,
        line: Option<u32>,
        parent_line: Option<u32>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            location: CallSiteLocation::Line { line, parent_line },
        }
    }

    pub fn descriptor(
        class_name: impl Into<SharedStr>,
        method_name: impl Into<SharedStr>,
        descriptor: impl Into<SharedStr>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            location: CallSiteLocation::Descriptor(descriptor.into()),
        }
    }

    /// Describe `frame` as reached from `caller` (the next frame outwards).
    pub fn from_frame(frame: &StackFrame, caller: Option<&StackFrame>) -> Self {
        let location = match &frame.method_descriptor {
            Some(descriptor) => CallSiteLocation::Descriptor(descriptor.clone()),
            None => CallSiteLocation::Line {
                line: frame.line_number,
                parent_line: caller.and_then(|c| c.line_number),
            },
        };
        Self {
            class_name: frame.class_name.clone(),
            method_name: frame.method_name.clone(),
            location,
        }
    }

    pub fn line_number(&self) -> Option<u32> {
        match self.location {
            CallSiteLocation::Line { line, .. } => line,
            CallSiteLocation::Descriptor(_) => None,
        }
    }

    pub fn parent_line_number(&self) -> Option<u32> {
        match self.location {
            CallSiteLocation::Line { parent_line, .. } => parent_line,
            CallSiteLocation::Descriptor(_) => None,
        }
    }

    pub fn method_descriptor(&self) -> Option<&SharedStr> {
        match &self.location {
            CallSiteLocation::Descriptor(d) => Some(d),
            CallSiteLocation::Line { .. } => None,
        }
    }

    pub fn same_method(&self, other: &CallSite) -> bool {
        self.class_name == other.class_name && self.method_name == other.method_name
    }
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.class_name, self.method_name)?;
        match &self.location {
            CallSiteLocation::Line { line: Some(line), .. } => write!(f, ":{line}"),
            CallSiteLocation::Line { line: None, .. } => Ok(()),
            CallSiteLocation::Descriptor(d) => write!(f, "{d}"),
        }
    }
}
