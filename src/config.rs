use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::analyzer::AnalysisSettings;
use crate::analyzer::downmix::DownmixTable;
use crate::compression::CompressionScheme;
use crate::waveform::MAX_CHANNELS;

/// Application configuration loaded from TOML config file.
/// All fields have defaults; the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directories to scan for music files (used when `analyze` has no CLI args).
    pub music_dirs: Vec<PathBuf>,
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Upper bound on worker threads. The pool never exceeds the core count.
    pub max_workers: usize,
    /// Store waveforms as a single mono channel.
    pub downmix: bool,
    /// Compression used for new and migrated rows.
    pub compression: CompressionScheme,
    /// Minimum gap between partial waveform updates.
    pub progress_interval_ms: u64,
    /// Capacity of the progress update channel.
    pub update_capacity: usize,
    /// Replacement downmix weights for specific channel counts.
    pub downmix_override: Vec<DownmixOverride>,
}

/// `[[downmix_override]]` table: weights in channel-map order.
#[derive(Debug, Clone, Deserialize)]
pub struct DownmixOverride {
    pub channels: usize,
    pub weights: Vec<f32>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            music_dirs: Vec::new(),
            db_path: None,
            max_workers: 4,
            downmix: false,
            compression: CompressionScheme::PREFERRED,
            progress_interval_ms: 500,
            update_capacity: 64,
            downmix_override: Vec::new(),
        }
    }
}

/// Runtime knobs handed to the cache engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub compression: CompressionScheme,
    pub analysis: AnalysisSettings,
    pub update_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        AppConfig::default().engine_settings()
    }
}

impl AppConfig {
    /// Load config from `~/.config/wavecache/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: `min(cores, max_workers)`, at least 1.
    pub fn resolve_workers(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        cores.min(self.max_workers).max(1)
    }

    /// Downmix table with valid overrides applied, or `None` when downmix is off.
    pub fn downmix_table(&self) -> Option<DownmixTable> {
        if !self.downmix {
            return None;
        }
        let mut table = DownmixTable::new();
        for o in &self.downmix_override {
            if o.channels == 0 || o.channels > MAX_CHANNELS || !table.set_override(o.channels, &o.weights) {
                log::warn!(
                    "Ignoring downmix override for {} channels: weights {:?}",
                    o.channels,
                    o.weights
                );
            }
        }
        Some(table)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            workers: self.resolve_workers(),
            compression: self.compression,
            analysis: AnalysisSettings {
                downmix: self.downmix_table(),
                progress_interval: Duration::from_millis(self.progress_interval_ms),
            },
            update_capacity: self.update_capacity.max(1),
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("wavecache.db")
    } else {
        // Fallback: current directory
        PathBuf::from("wavecache.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::default_channel_map;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.compression, CompressionScheme::Lz4);
        assert_eq!(config.progress_interval_ms, 500);
        assert!(!config.downmix);
        assert!(config.downmix_table().is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::parse(
            r#"
            music_dirs = ["/music"]
            db_path = "/tmp/w.db"
            max_workers = 2
            downmix = true
            compression = "zlib"
            progress_interval_ms = 100

            [[downmix_override]]
            channels = 3
            weights = [1.0, 1.0, 0.0]

            [[downmix_override]]
            channels = 2
            weights = [1.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.music_dirs, vec![PathBuf::from("/music")]);
        assert_eq!(config.compression, CompressionScheme::Zlib);
        assert!(config.resolve_workers() <= 2);
        assert!(config.resolve_workers() >= 1);

        // The mis-sized stereo override is dropped, the 3-channel one applies
        let table = config.downmix_table().unwrap();
        assert_eq!(table.weights(default_channel_map(3), 3), vec![0.5, 0.5, 0.0]);
        assert_eq!(table.weights(default_channel_map(2), 2), vec![0.5, 0.5]);

        let settings = config.engine_settings();
        assert_eq!(settings.analysis.progress_interval, Duration::from_millis(100));
        assert!(settings.analysis.downmix.is_some());
    }

    #[test]
    fn test_unknown_compression_is_an_error() {
        assert!(AppConfig::parse(r#"compression = "brotli""#).is_err());
    }

    #[test]
    fn test_zero_workers_still_gets_one() {
        let config = AppConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert_eq!(config.resolve_workers(), 1);
    }
}
