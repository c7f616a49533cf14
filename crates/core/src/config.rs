use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::IdleFrame;
use crate::grouping::ThreadGrouping;
use crate::window::DEFAULT_RETENTION;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sampling interval must be greater than zero")]
    ZeroInterval,
    #[error("completion deadline must be greater than zero")]
    ZeroDeadline,
    #[error("window retention must keep at least one previous window")]
    ZeroRetention,
    #[error("max stack depth must be greater than zero")]
    ZeroDepth,
    #[error("worker queue capacity must be greater than zero")]
    ZeroQueueCapacity,
    #[error("a tick length threshold requires a tick source")]
    MissingTickSource,
    #[error("no thread dumper configured")]
    MissingDumper,
    #[error("unknown thread grouping: {0}")]
    UnknownGrouping(String),
    #[error("invalid thread pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings for one sampling session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Time between captures. Also the weight of every sample.
    pub interval_micros: u64,
    /// Stop on our own this long after `start()`.
    pub complete_after_ms: Option<u64>,
    pub grouping: ThreadGrouping,
    /// Discard samples of threads parked in an idle primitive.
    pub ignore_sleeping: bool,
    /// Innermost frames that mark a thread as idle.
    pub idle_frames: Vec<IdleFrame>,
    /// When set, samples are batched per host tick and ticks shorter than
    /// this are discarded.
    pub tick_length_threshold_ms: Option<u64>,
    /// Previous windows kept alongside the open one.
    pub window_retention: u32,
    pub max_stack_depth: usize,
    /// Insertion threads. `0` inserts on the timer thread.
    pub worker_threads: usize,
    pub worker_queue_capacity: usize,
    /// How long shutdown waits for in-flight inserts.
    pub drain_timeout_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_micros: 4_000,
            complete_after_ms: None,
            grouping: ThreadGrouping::default(),
            ignore_sleeping: false,
            idle_frames: IdleFrame::defaults(),
            tick_length_threshold_ms: None,
            window_retention: DEFAULT_RETENTION,
            max_stack_depth: 300,
            worker_threads: 2,
            worker_queue_capacity: 1024,
            drain_timeout_ms: 5_000,
        }
    }
}

impl SamplerConfig {
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_micros = interval.as_micros() as u64;
        self
    }

    pub fn with_complete_after(mut self, after: Duration) -> Self {
        self.complete_after_ms = Some(after.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_micros == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.complete_after_ms == Some(0) {
            return Err(ConfigError::ZeroDeadline);
        }
        if self.window_retention == 0 {
            return Err(ConfigError::ZeroRetention);
        }
        if self.max_stack_depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        if self.worker_threads > 0 && self.worker_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_micros)
    }

    pub fn complete_after(&self) -> Option<Duration> {
        self.complete_after_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn tick_length_threshold_micros(&self) -> Option<u64> {
        self.tick_length_threshold_ms.map(|ms| ms.saturating_mul(1_000))
    }
}
