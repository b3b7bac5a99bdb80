use std::path::PathBuf;

use crate::engine::EngineConfig;

/// Host settings, read from `RESERVA_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends since the last compaction before the host compacts again.
    pub compact_threshold: u64,
    pub max_admission_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            max_admission_retries: EngineConfig::default().max_admission_retries,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("RESERVA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("RESERVA_METRICS_PORT").and_then(|s| s.parse().ok()),
            compact_threshold: lookup("RESERVA_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            max_admission_retries: lookup("RESERVA_MAX_RETRIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_admission_retries),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reserva.wal")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_admission_retries: self.max_admission_retries,
        }
    }
}
