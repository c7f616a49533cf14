//! Call-stack sampling profiler core.
//!
//! A [`Sampler`] periodically captures the stacks of a set of threads through
//! a [`ThreadDumper`], groups threads with a [`ThreadGrouper`], and feeds the
//! samples into a [`DataAggregator`] that builds one call tree per group with
//! time bucketed into one-minute windows.

pub mod aggregator;
pub mod capture;
pub mod clock;
pub mod config;
pub mod export;
pub mod grouping;
pub mod merge;
pub mod model;
pub mod sampler;
pub mod stats;
pub mod tick;
pub mod window;

pub use aggregator::{DataAggregator, SimpleDataAggregator, TickedDataAggregator};
pub use capture::{DumpError, ThreadDumper, ThreadFilter, ThreadSnapshot, ThreadState};
pub use config::{ConfigError, SamplerConfig};
pub use export::{ExportOptions, TimeEncoding};
pub use grouping::{ThreadGrouper, ThreadGrouping};
pub use merge::MergeMode;
pub use model::{CallSite, StackFrame};
pub use sampler::{
    CompletionSignal, Sampler, SamplerBuilder, SamplerError, SamplerState, SessionResult,
    WindowListener,
};
pub use window::{WindowId, WindowSelection};
