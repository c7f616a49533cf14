use std::sync::Arc;

use tracing::debug;

use super::{Sampler, SamplerError, SamplerParts, WindowListener};
use crate::aggregator::{
    DataAggregator, IdleClassifier, SimpleDataAggregator, TickedDataAggregator,
};
use crate::capture::ThreadDumper;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, SamplerConfig};
use crate::stats::WindowStatisticsCollector;
use crate::tick::TickSource;

/// Assembles a [`Sampler`] from its configuration and host capabilities.
///
/// A tick length threshold selects the tick-windowed aggregator, which
/// needs a [`TickSource`]; without one the plain aggregator is used.
pub struct SamplerBuilder {
    config: SamplerConfig,
    dumper: Option<Box<dyn ThreadDumper>>,
    tick_source: Option<Arc<dyn TickSource>>,
    clock: Option<Arc<dyn Clock>>,
    listener: Option<Arc<dyn WindowListener>>,
}

impl SamplerBuilder {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            dumper: None,
            tick_source: None,
            clock: None,
            listener: None,
        }
    }

    pub fn dumper(mut self, dumper: impl ThreadDumper + 'static) -> Self {
        self.dumper = Some(Box::new(dumper));
        self
    }

    pub fn tick_source(mut self, ticks: Arc<dyn TickSource>) -> Self {
        self.tick_source = Some(ticks);
        self
    }

    /// Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn WindowListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<Sampler, SamplerError> {
        let Self {
            config,
            dumper,
            tick_source,
            clock,
            listener,
        } = self;
        config.validate()?;
        let dumper = dumper.ok_or(ConfigError::MissingDumper)?;

        let grouper = config.grouping.grouper();
        let idle = config
            .ignore_sleeping
            .then(|| IdleClassifier::new(config.idle_frames.clone()));

        let (aggregator, stat_ticks): (Arc<dyn DataAggregator>, Option<Arc<dyn TickSource>>) =
            match config.tick_length_threshold_micros() {
                Some(threshold) => {
                    let ticks = tick_source.ok_or(ConfigError::MissingTickSource)?;
                    let aggregator = TickedDataAggregator::new(
                        grouper,
                        config.max_stack_depth,
                        idle,
                        ticks,
                        config.interval_micros,
                        threshold,
                    );
                    let included: Arc<dyn TickSource> = aggregator.included_ticks();
                    (Arc::new(aggregator), Some(included))
                }
                None => {
                    let aggregator =
                        SimpleDataAggregator::new(grouper, config.max_stack_depth, idle);
                    (Arc::new(aggregator), tick_source)
                }
            };

        debug!(
            aggregator = %aggregator.metadata().kind,
            dumper = %dumper.description(),
            "sampler built"
        );
        Ok(Sampler::from_parts(SamplerParts {
            config,
            dumper,
            aggregator,
            stats: WindowStatisticsCollector::new(stat_ticks),
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
            listener,
        }))
    }
}
