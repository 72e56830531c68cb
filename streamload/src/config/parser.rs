//! INI parsing logic for converting `Ini` → `EngineConfig`.
//!
//! This is the single place where INI key names are mapped to struct fields.

use ini::{Ini, Properties};
use std::str::FromStr;
use std::time::Duration;

use super::file::ConfigFileError;
use super::settings::EngineConfig;
use super::size::parse_size;

/// Parse an `Ini` object into an `EngineConfig`.
///
/// Starts from `EngineConfig::default()` and overlays any values found.
pub(super) fn parse_ini(ini: &Ini) -> Result<EngineConfig, ConfigFileError> {
    let mut config = EngineConfig::default();

    // [scheduler] section
    if let Some(section) = ini.section(Some("scheduler")) {
        let s = Section::new("scheduler", section);
        if let Some(v) = s.number("max_concurrent_tasks", "must be a positive integer")? {
            config.scheduler.max_concurrent_tasks = v;
        }
        if let Some(v) = s.millis("poll_interval_ms")? {
            config.scheduler.poll_interval = v;
        }
        if let Some(v) = s.number("open_stream_concurrency", "must be a positive integer")? {
            config.scheduler.open_stream_concurrency = v;
        }
        if let Some(v) = s.number(
            "accumulate_concurrency",
            "must be a non-negative integer (0 = unbounded)",
        )? {
            config.scheduler.accumulate_concurrency = v;
        }
        if let Some(v) = s.number(
            "process_batch_concurrency",
            "must be a non-negative integer (0 = unbounded)",
        )? {
            config.scheduler.process_batch_concurrency = v;
        }
        if let Some(v) = s.number(
            "process_batch_per_stream",
            "must be a non-negative integer (0 = unbounded)",
        )? {
            config.scheduler.process_batch_per_stream = v;
        }
    }

    // [memory] section
    if let Some(section) = ini.section(Some("memory")) {
        let s = Section::new("memory", section);
        if let Some(v) = s.size("max_memory")? {
            config.memory.max_memory_bytes = v;
        }
        if let Some(v) = s.size("block_size")? {
            config.memory.block_size_bytes = v;
        }
        if let Some(v) = s.millis("retry_interval_ms")? {
            config.memory.retry_interval = v;
        }
    }

    // [flush] section
    if let Some(section) = ini.section(Some("flush")) {
        let s = Section::new("flush", section);
        if let Some(v) = s.number::<f64>("eager_flush_fraction", "must be a number in (0, 1]")? {
            if !(v > 0.0 && v <= 1.0) {
                return Err(s.invalid("eager_flush_fraction", "must be a number in (0, 1]"));
            }
            config.flush.eager_flush_fraction = v;
        }
        if let Some(v) = s.millis("max_time_between_flushes_ms")? {
            config.flush.max_time_between_flushes = v;
        }
        if let Some(v) = s.millis("supervisor_interval_ms")? {
            config.flush.supervisor_interval = v;
        }
        if let Some(v) = s.number("max_flush_workers", "must be a positive integer")? {
            config.flush.max_flush_workers = v;
        }
        if let Some(v) = s.millis("shutdown_progress_interval_ms")? {
            config.flush.shutdown_progress_interval = v;
        }
        if let Some(v) = s.millis("shutdown_timeout_ms")? {
            config.flush.shutdown_timeout = v;
        }
    }

    // [queue] section
    if let Some(section) = ini.section(Some("queue")) {
        let s = Section::new("queue", section);
        if let Some(v) = s.millis("consumer_timeout_ms")? {
            config.queue.consumer_timeout = v;
        }
        if let Some(v) = s.millis("wait_time_ms")? {
            config.queue.wait_time = v;
        }
        if let Some(v) = s.size("chunk_size")? {
            config.queue.chunk_size_bytes = v;
        }
        if let Some(v) = s.number("shards_per_stream", "must be a positive integer")? {
            config.queue.shards_per_stream = v;
        }
    }

    Ok(config)
}

/// A named INI section with typed getters that report the offending key.
struct Section<'a> {
    name: &'static str,
    props: &'a Properties,
}

impl<'a> Section<'a> {
    fn new(name: &'static str, props: &'a Properties) -> Self {
        Self { name, props }
    }

    fn raw(&self, key: &str) -> Option<&'a str> {
        self.props.get(key).map(str::trim)
    }

    fn invalid(&self, key: &str, reason: &str) -> ConfigFileError {
        ConfigFileError::InvalidValue {
            section: self.name.to_string(),
            key: key.to_string(),
            value: self.raw(key).unwrap_or_default().to_string(),
            reason: reason.to_string(),
        }
    }

    fn number<T: FromStr>(&self, key: &str, reason: &str) -> Result<Option<T>, ConfigFileError> {
        match self.raw(key) {
            None => Ok(None),
            Some(v) => v.parse().map(Some).map_err(|_| self.invalid(key, reason)),
        }
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigFileError> {
        Ok(self
            .number::<u64>(key, "must be a non-negative integer (milliseconds)")?
            .map(Duration::from_millis))
    }

    fn size(&self, key: &str) -> Result<Option<u64>, ConfigFileError> {
        match self.raw(key) {
            None => Ok(None),
            Some(v) => parse_size(v)
                .map(Some)
                .map_err(|e| self.invalid(key, &e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = EngineConfig::from_ini_str(
            r#"
[queue]
shards_per_stream = 3
"#,
        )
        .unwrap();

        assert_eq!(config.queue.shards_per_stream, 3);
        assert_eq!(config.queue.wait_time, Duration::from_millis(50));
        assert_eq!(config.scheduler.max_concurrent_tasks, 128);
    }

    #[test]
    fn test_human_readable_sizes() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.ini");
        std::fs::write(
            &config_path,
            r#"
[memory]
max_memory = 2GB
block_size = 512KB

[queue]
chunk_size = 1MB
"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(&config_path).unwrap();
        assert_eq!(config.memory.max_memory_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.memory.block_size_bytes, 512 * 1024);
        assert_eq!(config.queue.chunk_size_bytes, 1024 * 1024);
    }

    #[test]
    fn test_durations_are_milliseconds() {
        let config = EngineConfig::from_ini_str(
            r#"
[scheduler]
poll_interval_ms = 25

[flush]
max_time_between_flushes_ms = 60000
supervisor_interval_ms = 250
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.poll_interval, Duration::from_millis(25));
        assert_eq!(config.flush.max_time_between_flushes, Duration::from_secs(60));
        assert_eq!(config.flush.supervisor_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_integer_names_key() {
        let err = EngineConfig::from_ini_str(
            r#"
[scheduler]
max_concurrent_tasks = lots
"#,
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("scheduler.max_concurrent_tasks"));
        assert!(message.contains("lots"));
    }

    #[test]
    fn test_invalid_size_is_rejected() {
        let err = EngineConfig::from_ini_str(
            r#"
[memory]
max_memory = 2TB
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_memory"));
    }

    #[test]
    fn test_eager_fraction_out_of_range() {
        let err = EngineConfig::from_ini_str(
            r#"
[flush]
eager_flush_fraction = 1.2
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::InvalidValue { ref key, .. } if key == "eager_flush_fraction"
        ));
    }
}
