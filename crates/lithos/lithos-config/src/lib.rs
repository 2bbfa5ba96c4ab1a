use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct IccConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "defaults::queue_path")]
    pub path: String,
    /// Number of slots; must be a power of two.
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub mode: QueueMode,
}

/// Producer mode as written in the config file.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// One producer, many consumers.
    #[default]
    Spmc,
    /// Many producers, many consumers.
    Mpmc,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct VectorConfig {
    #[serde(default = "defaults::vector_path")]
    pub path: String,
    #[serde(default = "defaults::vector_len")]
    pub len: usize,
}

/// Pacing for demo publishers: sleep `batch_delay_us` after every
/// `batch_size` messages.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    #[serde(default = "defaults::batch_size")]
    pub batch_size: u64,
    #[serde(default = "defaults::batch_delay_us")]
    pub batch_delay_us: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn queue_path() -> String {
        "/dev/shm/lithos_icc_queue".into()
    }

    pub fn capacity() -> usize {
        4096
    }

    pub fn vector_path() -> String {
        "/dev/shm/lithos_icc_latest".into()
    }

    pub fn vector_len() -> usize {
        64
    }

    pub fn batch_size() -> u64 {
        1000
    }

    pub fn batch_delay_us() -> u64 {
        100
    }
}

impl Default for IccConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            queue: QueueConfig::default(),
            vector: VectorConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: defaults::queue_path(),
            capacity: defaults::capacity(),
            mode: QueueMode::default(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            path: defaults::vector_path(),
            len: defaults::vector_len(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            batch_delay_us: defaults::batch_delay_us(),
        }
    }
}

impl IccConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = IccConfig::parse("").unwrap();
        assert_eq!(cfg, IccConfig::default());
        assert_eq!(cfg.queue.capacity, 4096);
        assert_eq!(cfg.queue.mode, QueueMode::Spmc);
        assert_eq!(cfg.vector.len, 64);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg = IccConfig::parse(
            r#"
            log_level = "debug"

            [queue]
            capacity = 256
            mode = "mpmc"

            [publisher]
            batch_delay_us = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.queue.capacity, 256);
        assert_eq!(cfg.queue.mode, QueueMode::Mpmc);
        assert_eq!(cfg.queue.path, "/dev/shm/lithos_icc_queue");
        assert_eq!(cfg.publisher.batch_size, 1000);
        assert_eq!(cfg.publisher.batch_delay_us, 0);
        assert_eq!(cfg.vector, VectorConfig::default());
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        let err = IccConfig::parse("[queue]\nmode = \"spsc\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icc.toml");
        std::fs::write(&path, "[vector]\nlen = 8\npath = \"/tmp/v\"\n").unwrap();

        let cfg = IccConfig::load(path.to_string_lossy().into_owned()).unwrap();
        assert_eq!(cfg.vector.len, 8);
        assert_eq!(cfg.vector.path, "/tmp/v");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = IccConfig::load("/nonexistent/lithos/icc.toml").unwrap_err();
        match err {
            ConfigError::Read { path, .. } => assert_eq!(path, "/nonexistent/lithos/icc.toml"),
            other => panic!("expected Read error, got {other:?}"),
        }
    }
}
