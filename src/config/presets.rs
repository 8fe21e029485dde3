use crate::config::AppConfig;
use crate::encoder::ProcessingParams;
use crate::error::{AppError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Named parameter presets, one JSON file each
#[derive(Debug, Clone)]
pub struct PresetStore {
    dir: PathBuf,
}

impl PresetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<config dir>/lut-renderer/presets`
    pub fn default_location() -> Self {
        Self::new(AppConfig::config_dir().join("presets"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let name = name.trim();
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
        {
            return Err(AppError::Config(format!("invalid preset name '{}'", name)));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }

    /// Sorted preset names
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::filesystem(&self.dir, e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|e| e == "json"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<ProcessingParams> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(AppError::Config(format!("preset not found: {}", name)));
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| AppError::filesystem(&path, e))?;
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => ProcessingParams::from_representation(&map),
            _ => Err(AppError::Config(format!(
                "preset {} is not a JSON object",
                path.display()
            ))),
        }
    }

    /// Every preset that loads; broken files are skipped with a warning
    pub fn load_all(&self) -> Result<BTreeMap<String, ProcessingParams>> {
        let mut presets = BTreeMap::new();
        for name in self.list()? {
            match self.load(&name) {
                Ok(params) => {
                    presets.insert(name, params);
                }
                Err(e) => warn!("Skipping preset {}: {}", name, e),
            }
        }
        Ok(presets)
    }

    /// Store a new preset; an existing one with the same name is an error
    pub fn save(&self, name: &str, params: &ProcessingParams) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        if path.exists() {
            return Err(AppError::Config(format!("preset already exists: {}", name)));
        }
        self.write(&path, params)
    }

    pub fn overwrite(&self, name: &str, params: &ProcessingParams) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        self.write(&path, params)
    }

    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<PathBuf> {
        let src = self.path_for(old_name)?;
        let dst = self.path_for(new_name)?;
        if !src.exists() {
            return Err(AppError::Config(format!("preset not found: {}", old_name)));
        }
        if dst.exists() {
            return Err(AppError::Config(format!(
                "preset already exists: {}",
                new_name
            )));
        }
        std::fs::rename(&src, &dst).map_err(|e| AppError::filesystem(&dst, e))?;
        info!("Renamed preset {} to {}", old_name, new_name);
        Ok(dst)
    }

    /// Removing a missing preset is not an error
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Deleted preset {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::filesystem(&path, e)),
        }
    }

    fn write(&self, path: &Path, params: &ProcessingParams) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| AppError::filesystem(&self.dir, e))?;
        let json = serde_json::to_string_pretty(&Value::Object(params.to_representation()))?;
        std::fs::write(path, json).map_err(|e| AppError::filesystem(path, e))?;
        info!("Saved preset to {}", path.display());
        Ok(path.to_path_buf())
    }
}
