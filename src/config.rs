//! Runtime configuration.
//!
//! [`RuntimeConfig`] holds the reinvocation thresholds used by the entry
//! points and the environment-derived switches for local testing.
//!
//! ## Local continuation
//!
//! When a handler returns IN_PROGRESS, the runtime sleeps and calls it again
//! in the same function invocation only if the requested delay is below
//! [`RuntimeConfig::local_callback_threshold`] and the remaining execution
//! time covers `delay * delay_safety_factor + invocation_budget`. Otherwise
//! the continuation is handed to a CloudWatch Events timer.

use std::time::Duration;

/// Environment variable set to `"true"` by SAM CLI local invocations.
pub const SAM_LOCAL_ENV: &str = "AWS_SAM_LOCAL";

/// Environment variable holding the log filter.
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Configuration for the Resource and Hook entry points.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Delays at or above this always go to an external timer.
    pub local_callback_threshold: Duration,

    /// Time reserved for one more handler execution.
    pub invocation_budget: Duration,

    /// Multiplier applied to the requested delay when checking the budget.
    pub delay_safety_factor: f64,

    /// Time kept back from the function deadline when arming the
    /// write-handler deadline.
    pub handler_deadline_buffer: Duration,

    /// Remote reinvocations allowed after a write handler timed out.
    pub max_timeout_reschedules: u32,

    /// Shortest local sleep, applied when a handler asks for no delay.
    pub min_local_delay: Duration,

    /// Running under SAM CLI: no metrics, log delivery or external timers.
    pub sam_local: bool,

    /// `tracing` filter directive.
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            local_callback_threshold: Duration::from_secs(60),
            invocation_budget: Duration::from_secs(60),
            delay_safety_factor: 1.2,
            handler_deadline_buffer: Duration::from_secs(5),
            max_timeout_reschedules: 3,
            min_local_delay: Duration::from_secs(1),
            sam_local: false,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `AWS_SAM_LOCAL` and `LOG_LEVEL` from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            sam_local: lookup(SAM_LOCAL_ENV).is_some_and(|v| v == "true"),
            log_level: lookup(LOG_LEVEL_ENV)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.log_level.clone()),
            ..defaults
        }
    }

    /// Sets the local continuation threshold.
    pub fn with_local_callback_threshold(mut self, threshold: Duration) -> Self {
        self.local_callback_threshold = threshold;
        self
    }

    /// Sets the time reserved for one more handler execution.
    pub fn with_invocation_budget(mut self, budget: Duration) -> Self {
        self.invocation_budget = budget;
        self
    }

    /// Sets the delay safety factor.
    pub fn with_delay_safety_factor(mut self, factor: f64) -> Self {
        self.delay_safety_factor = factor;
        self
    }

    /// Sets the buffer kept back from the function deadline.
    pub fn with_handler_deadline_buffer(mut self, buffer: Duration) -> Self {
        self.handler_deadline_buffer = buffer;
        self
    }

    /// Sets how many times a timed out write handler is rescheduled.
    pub fn with_max_timeout_reschedules(mut self, max: u32) -> Self {
        self.max_timeout_reschedules = max;
        self
    }

    /// Sets the shortest local sleep.
    pub fn with_min_local_delay(mut self, delay: Duration) -> Self {
        self.min_local_delay = delay;
        self
    }

    /// Marks the runtime as running under SAM CLI.
    pub fn with_sam_local(mut self, sam_local: bool) -> Self {
        self.sam_local = sam_local;
        self
    }

    /// Sets the `tracing` filter directive.
    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.local_callback_threshold, Duration::from_secs(60));
        assert_eq!(config.invocation_budget, Duration::from_secs(60));
        assert_eq!(config.delay_safety_factor, 1.2);
        assert!(!config.sam_local);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [(SAM_LOCAL_ENV, "true"), (LOG_LEVEL_ENV, "debug")].into();
        let config = RuntimeConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert!(config.sam_local);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_sam_local_requires_true() {
        let config = RuntimeConfig::from_lookup(|key| (key == SAM_LOCAL_ENV).then(|| "1".to_string()));
        assert!(!config.sam_local);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_builders() {
        let config = RuntimeConfig::new()
            .with_max_timeout_reschedules(1)
            .with_handler_deadline_buffer(Duration::from_millis(10))
            .with_sam_local(true);
        assert_eq!(config.max_timeout_reschedules, 1);
        assert_eq!(config.handler_deadline_buffer, Duration::from_millis(10));
        assert!(config.sam_local);
    }
}
