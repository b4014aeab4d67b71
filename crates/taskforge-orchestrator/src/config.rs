use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use tracing::Level;

/// Multiple of the poll interval tolerated past `timeout` before a pending
/// task is declared stuck.
pub const GRACE_FACTOR: u32 = 100;

/// Settings for one orchestrator run.
///
/// Deserializes from the `[orchestrator]` table of a TOML file; every field
/// has a default. The retry predicate is not part of it, see
/// [`Orchestrator::with_retry_predicate`](crate::Orchestrator::with_retry_predicate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker count of the local pool.
    pub children: usize,
    /// Jobs a local worker runs before it is replaced. 0 means never.
    pub max_tasks_per_child: usize,
    /// Per-attempt timeout in seconds. `None` disables timeouts.
    pub timeout_sec: Option<f64>,
    /// Attempts per task. `None` means unbounded.
    pub max_attempts: Option<u32>,
    /// Where checkpoints go. `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
    /// Sleep between reconciliation cycles, in milliseconds.
    pub poll_interval_ms: u64,
    /// Cycles between two full status reports.
    pub full_report_every: u64,
    /// Minimum cycles between two summary reports.
    pub summary_cooldown: u64,
    /// Report verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            children: std::thread::available_parallelism().map_or(1, |n| n.get()),
            max_tasks_per_child: 0,
            timeout_sec: None,
            max_attempts: None,
            checkpoint_dir: None,
            poll_interval_ms: 1000,
            full_report_every: 1800,
            summary_cooldown: 100,
            log_level: "info".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_children(mut self, children: usize) -> Self {
        self.children = children;
        self
    }

    pub fn with_max_tasks_per_child(mut self, max: usize) -> Self {
        self.max_tasks_per_child = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_sec = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_verbosity(mut self, level: Level) -> Self {
        self.log_level = level.as_str().to_ascii_lowercase();
        self
    }

    /// Per-attempt timeout, if any. Invalid values count as no timeout;
    /// [`validate`](Self::validate) rejects them up front.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_sec
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Slack added to `timeout` by the supervisory scan.
    pub fn grace_period(&self) -> Duration {
        self.poll_interval().saturating_mul(GRACE_FACTOR)
    }

    /// How long a task may stay `PENDING` before the supervisory scan fails it.
    pub fn stuck_after(&self) -> Option<Duration> {
        self.timeout().map(|t| t.saturating_add(self.grace_period()))
    }

    pub fn verbosity(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    pub fn validate(&self) -> TaskforgeResult<()> {
        if self.children == 0 {
            return Err(TaskforgeError::Config("children must be at least 1".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(TaskforgeError::Config(
                "max_attempts must be at least 1 when set".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(TaskforgeError::Config(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if let Some(secs) = self.timeout_sec {
            if !secs.is_finite() || secs < 0.0 {
                return Err(TaskforgeError::Config(format!(
                    "timeout_sec must be a non-negative number, got {secs}"
                )));
            }
        }
        if self.log_level.parse::<Level>().is_err() {
            return Err(TaskforgeError::Config(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert!(config.children >= 1);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.grace_period(), Duration::from_secs(100));
        assert_eq!(config.verbosity(), Level::INFO);
        assert!(config.timeout().is_none());
        assert!(config.stuck_after().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_builders() {
        let config = OrchestratorConfig::default()
            .with_children(4)
            .with_max_attempts(3)
            .with_timeout(Duration::from_millis(1500))
            .with_poll_interval(Duration::from_millis(10))
            .with_verbosity(Level::DEBUG);
        assert_eq!(config.children, 4);
        assert_eq!(config.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.grace_period(), Duration::from_secs(1));
        assert_eq!(config.stuck_after(), Some(Duration::from_millis(2500)));
        assert_eq!(config.verbosity(), Level::DEBUG);
    }

    #[test]
    fn test_validation() {
        assert!(OrchestratorConfig::default().with_children(0).validate().is_err());
        assert!(OrchestratorConfig::default().with_max_attempts(0).validate().is_err());
        let config = OrchestratorConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = OrchestratorConfig {
            timeout_sec: Some(-1.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = OrchestratorConfig {
            log_level: "loud".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"timeout_sec": 2, "max_attempts": 3}"#).unwrap();
        assert_eq!(config.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.max_attempts, Some(3));
        assert_eq!(config.full_report_every, 1800);
        assert_eq!(config.summary_cooldown, 100);
    }
}
