//! Engine configuration.

use core::time::Duration;

/// Configuration for a [`Ums`](crate::Ums) instance.
///
/// Controls how hard the engine tries to deliver wakeups before it starts
/// sleeping between attempts, and optionally caps the readiness fixed point.
#[derive(Debug, Clone)]
pub struct UmsConfig {
    pub name: &'static str,
    pub spin_limit: u32,
    pub yield_limit: u32,
    pub backoff_sleep: Duration,
    pub max_readiness_passes: Option<u32>,
}

impl Default for UmsConfig {
    fn default() -> Self {
        Self {
            name: "ums",
            spin_limit: 64,
            yield_limit: 64,
            backoff_sleep: Duration::from_micros(50),
            max_readiness_passes: None,
        }
    }
}

impl UmsConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> UmsConfigBuilder {
        UmsConfigBuilder::default()
    }
}

/// Builder for ergonomic configuration construction.
#[derive(Debug, Clone, Default)]
pub struct UmsConfigBuilder {
    config: UmsConfig,
}

impl UmsConfigBuilder {
    /// Sets the instance name reported by diagnostics.
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    /// Sets the number of busy spins before a delivery attempt yields.
    pub fn spin_limit(mut self, limit: u32) -> Self {
        self.config.spin_limit = limit;
        self
    }

    /// Sets the number of `yield_now` rounds before the backoff sleeps.
    pub fn yield_limit(mut self, limit: u32) -> Self {
        self.config.yield_limit = limit;
        self
    }

    /// Sets the sleep between delivery attempts once spinning is exhausted.
    pub fn backoff_sleep(mut self, sleep: Duration) -> Self {
        self.config.backoff_sleep = sleep;
        self
    }

    /// Caps the number of passes the readiness query may take.
    ///
    /// # Parameters
    /// - `passes`: Maximum passes; values below 1 are raised to 1
    pub fn max_readiness_passes(mut self, passes: u32) -> Self {
        self.config.max_readiness_passes = Some(passes.max(1));
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> UmsConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = UmsConfig::builder()
            .name("test")
            .spin_limit(8)
            .yield_limit(4)
            .backoff_sleep(Duration::from_micros(10))
            .max_readiness_passes(0)
            .build();

        assert_eq!(config.name, "test");
        assert_eq!(config.spin_limit, 8);
        assert_eq!(config.yield_limit, 4);
        assert_eq!(config.backoff_sleep, Duration::from_micros(10));
        assert_eq!(config.max_readiness_passes, Some(1));
    }

    #[test]
    fn default_keeps_unbounded_fixed_point() {
        let config = UmsConfig::default();
        assert_eq!(config.name, "ums");
        assert_eq!(config.max_readiness_passes, None);
    }
}
