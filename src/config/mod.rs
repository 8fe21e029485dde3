pub mod presets;

pub use presets::PresetStore;

use crate::encoder::ProcessingParams;
use crate::error::AppError;
use crate::queue::{MAX_CONCURRENCY, Toolchain};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const APP_DIR: &str = "lut-renderer";

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Transcoder binary, name or path
    pub ffmpeg_bin: PathBuf,
    /// Prober binary, name or path
    pub ffprobe_bin: PathBuf,
    /// Jobs running at the same time
    pub max_concurrency: usize,
    /// Where pro-mode masters are written; required for pro mode
    pub intermediate_dir: Option<PathBuf>,
    /// Defaults to `output/` beside each source
    pub output_dir: Option<PathBuf>,
    /// Parameters used when no preset is given
    pub defaults: ProcessingParams,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            max_concurrency: 1,
            intermediate_dir: None,
            output_dir: None,
            defaults: ProcessingParams::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file, or fall back to defaults
    pub fn load() -> Self {
        let config_path = Self::config_path();

        if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config: {}. Using defaults.", e);
                }
            }
        }

        Self::default()
    }

    /// Load and validate configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default TOML file
    pub fn save(&self) -> Result<(), AppError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)
            .map_err(|e| AppError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Per-user directory holding the config file and presets
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Get the default configuration file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), AppError> {
        if !(1..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(AppError::Config(format!(
                "max_concurrency must be between 1 and {}",
                MAX_CONCURRENCY
            )));
        }
        if self.ffmpeg_bin.as_os_str().is_empty() || self.ffprobe_bin.as_os_str().is_empty() {
            return Err(AppError::Config(
                "ffmpeg_bin and ffprobe_bin must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            ffmpeg: self.ffmpeg_bin.clone(),
            ffprobe: self.ffprobe_bin.clone(),
        }
    }
}
