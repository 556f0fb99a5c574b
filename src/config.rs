//! Provisioner configuration with builder-style setters

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Polling schedule for one readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay between fetches; the poller never goes faster than this
    pub interval_ms: u64,
    /// Fetch budget. `0` means unbounded and is rejected by [`ProvisionerConfig::validate`].
    pub max_attempts: u32,
    /// Growth factor applied to the delay after each unsuccessful fetch
    pub backoff_multiplier: f64,
    /// Upper bound for the grown delay
    pub max_interval_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(250), 240)
    }
}

impl PollPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            interval_ms: ms,
            max_attempts,
            backoff_multiplier: 1.0,
            max_interval_ms: ms,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_interval_ms = max_interval.as_millis() as u64;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.interval_ms))
    }

    /// Delay to use after `delay`, never below the base interval
    pub fn next_delay(&self, delay: Duration) -> Duration {
        if self.backoff_multiplier <= 1.0 {
            return self.interval();
        }
        let grown = Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier);
        grown.clamp(self.interval(), self.max_interval())
    }

    pub fn is_bounded(&self) -> bool {
        self.max_attempts > 0
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::Config(format!("{name}: interval_ms must be positive")));
        }
        if !self.is_bounded() {
            return Err(Error::Config(format!("{name}: max_attempts must be at least 1")));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!("{name}: backoff_multiplier must be >= 1.0")));
        }
        Ok(())
    }
}

/// What to do with already-created objects when a creation unit fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackPolicy {
    /// Leave everything in place for inspection and manual cleanup
    #[default]
    LeaveInPlace,
    /// Delete what the unit created, newest first, ignoring errors
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Maximum number of units running at the same time
    pub max_concurrency: usize,
    /// Wait for a namespace to become Active
    pub namespace_poll: PollPolicy,
    /// Wait for a pod to become Running
    pub pod_poll: PollPolicy,
    /// Wait for a deleted object to disappear
    pub deletion_poll: PollPolicy,
    pub rollback: RollbackPolicy,
    /// Re-reads allowed when an update of a shared record hits a version conflict
    pub conflict_retries: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            namespace_poll: PollPolicy::fixed(Duration::from_millis(250), 240),
            pod_poll: PollPolicy::fixed(Duration::from_secs(1), 300),
            deletion_poll: PollPolicy::fixed(Duration::from_millis(250), 480),
            rollback: RollbackPolicy::default(),
            conflict_retries: 5,
        }
    }
}

impl ProvisionerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn namespace_poll(mut self, policy: PollPolicy) -> Self {
        self.namespace_poll = policy;
        self
    }

    pub fn pod_poll(mut self, policy: PollPolicy) -> Self {
        self.pod_poll = policy;
        self
    }

    pub fn deletion_poll(mut self, policy: PollPolicy) -> Self {
        self.deletion_poll = policy;
        self
    }

    pub fn rollback(mut self, policy: RollbackPolicy) -> Self {
        self.rollback = policy;
        self
    }

    pub fn conflict_retries(mut self, n: u32) -> Self {
        self.conflict_retries = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".into()));
        }
        self.namespace_poll.validate("namespace_poll")?;
        self.pod_poll.validate("pod_poll")?;
        self.deletion_poll.validate("deletion_poll")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProvisionerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.namespace_poll.interval(), Duration::from_millis(250));
        assert_eq!(config.pod_poll.interval(), Duration::from_secs(1));
        assert_eq!(config.rollback, RollbackPolicy::LeaveInPlace);
    }

    #[test]
    fn test_unbounded_poll_rejected() {
        let config = ProvisionerConfig::new().pod_poll(PollPolicy::fixed(Duration::from_secs(1), 0));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pod_poll"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(ProvisionerConfig::new().max_concurrency(0).validate().is_err());
    }

    #[test]
    fn test_backoff_delay_is_clamped() {
        let policy = PollPolicy::fixed(Duration::from_millis(100), 10)
            .with_backoff(2.0, Duration::from_millis(300));
        let d1 = policy.next_delay(policy.interval());
        let d2 = policy.next_delay(d1);
        let d3 = policy.next_delay(d2);
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(300));
        assert_eq!(d3, Duration::from_millis(300));

        let fixed = PollPolicy::fixed(Duration::from_millis(100), 10);
        assert_eq!(fixed.next_delay(Duration::from_secs(5)), Duration::from_millis(100));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_concurrency": 2, "rollback": "best-effort", "pod_poll": {{"interval_ms": 500, "max_attempts": 10}}}}"#
        )
        .unwrap();

        let config = ProvisionerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.rollback, RollbackPolicy::BestEffort);
        assert_eq!(config.pod_poll.interval_ms, 500);
        assert_eq!(config.pod_poll.max_attempts, 10);
        assert_eq!(config.namespace_poll, ProvisionerConfig::default().namespace_poll);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_concurrency": 0}}"#).unwrap();
        assert!(matches!(ProvisionerConfig::from_file(file.path()), Err(Error::Config(_))));
    }
}
