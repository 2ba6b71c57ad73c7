//! Fluent builder for reactor construction.

use crate::config;
use crate::error::Error;
use crate::reactor::Reactor;
use crate::reactor::handle::DEFAULT_IO_RATIO;
use crate::reactor::poller::{MultiplexerProvider, OsProvider};

/// Builder for [`Reactor`] instances.
///
/// # Example
///
/// ```no_run
/// use spindle::ReactorBuilder;
///
/// let reactor = ReactorBuilder::new()
///     .io_ratio(80)
///     .auto_rebuild_threshold(128)
///     .build()
///     .unwrap();
/// ```
pub struct ReactorBuilder {
    io_ratio: u32,
    auto_rebuild_threshold: Option<u32>,
    disable_ready_set_optimization: bool,
    provider: Option<Box<dyn MultiplexerProvider>>,
}

impl ReactorBuilder {
    pub fn new() -> Self {
        Self {
            io_ratio: DEFAULT_IO_RATIO,
            auto_rebuild_threshold: None,
            disable_ready_set_optimization: false,
            provider: None,
        }
    }

    /// Percentage of each iteration's time budget spent on readiness
    /// dispatch. Default 50; validated at build time.
    pub fn io_ratio(mut self, percent: u32) -> Self {
        self.io_ratio = percent;
        self
    }

    /// Consecutive premature multiplexer returns before an automatic
    /// rebuild. Values below 3 disable the workaround. Defaults to the
    /// process-wide `SPINDLE_AUTO_REBUILD_THRESHOLD` (512).
    pub fn auto_rebuild_threshold(mut self, threshold: u32) -> Self {
        self.auto_rebuild_threshold = Some(threshold);
        self
    }

    /// Forces the per-iteration readiness-buffer fallback path.
    pub fn disable_ready_set_optimization(mut self) -> Self {
        self.disable_ready_set_optimization = true;
        self
    }

    /// Substitutes the multiplexer provider. Defaults to the build
    /// target's OS backend.
    pub fn provider(mut self, provider: impl MultiplexerProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    /// Opens the multiplexer and constructs the reactor.
    pub fn build(self) -> Result<Reactor, Error> {
        if self.io_ratio == 0 || self.io_ratio > 100 {
            return Err(Error::Configuration(format!(
                "io ratio: {} (expected: 0 < ratio <= 100)",
                self.io_ratio
            )));
        }

        let rebuild_threshold = self
            .auto_rebuild_threshold
            .map(config::normalize_rebuild_threshold)
            .unwrap_or_else(config::auto_rebuild_threshold);
        let ready_set_disabled =
            self.disable_ready_set_optimization || config::no_ready_set_optimization();
        let provider = self
            .provider
            .unwrap_or_else(|| Box::new(OsProvider));

        Reactor::build(provider, self.io_ratio, rebuild_threshold, ready_set_disabled)
    }
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
