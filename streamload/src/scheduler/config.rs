//! Task runner configuration.

use std::time::Duration;

use super::watchdog::{STALL_DETECTION_THRESHOLD_MS, STALL_WATCHDOG_INTERVAL_SECS};
use crate::config::{SchedulerSettings, DEFAULT_MAX_CONCURRENT_TASKS};

/// Configuration for the [`TaskRunner`](super::TaskRunner).
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Maximum plain tasks in flight.
    pub max_concurrent_tasks: usize,

    /// Loop inactivity (with pending work) reported as a stall.
    pub stall_threshold: Duration,

    /// How often the watchdog checks the loop.
    pub watchdog_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            stall_threshold: Duration::from_millis(STALL_DETECTION_THRESHOLD_MS),
            watchdog_interval: Duration::from_secs(STALL_WATCHDOG_INTERVAL_SECS),
        }
    }
}

impl From<&SchedulerSettings> for RunnerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            max_concurrent_tasks: settings.max_concurrent_tasks,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_config_default() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_concurrent_tasks, DEFAULT_MAX_CONCURRENT_TASKS);
        assert_eq!(config.stall_threshold, Duration::from_secs(30));
    }

    #[test]
    fn test_runner_config_from_settings() {
        let settings = SchedulerSettings {
            max_concurrent_tasks: 7,
            ..SchedulerSettings::default()
        };
        assert_eq!(RunnerConfig::from(&settings).max_concurrent_tasks, 7);
    }
}
