use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_QUEUED_UNITS, DEFAULT_MIN_CHUNK_BUFFER_SIZE, DEFAULT_PRE_BUFFER_LIMIT,
    DEFAULT_SMOOTH_STREAM_INTERVAL_MS, DEFAULT_STREAM_RETENTION_MS, DEFAULT_USER_NAME,
    REGEX_RULES_FILE_NAME, SETTINGS_FILE_NAME,
};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE_NAME)
    }

    pub fn rules_path(&self) -> PathBuf {
        self.data_dir.join(REGEX_RULES_FILE_NAME)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        match dirs::data_dir() {
            Some(dir) => Self::new(dir.join("colloquy")),
            None => Self::new("colloquy_data"),
        }
    }
}

/// User-level settings shared with the host application's settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub user_name: String,
    pub user_avatar_url: Option<String>,
    pub user_avatar_calculated_color: Option<String>,
    pub enable_smooth_streaming: bool,
    pub min_chunk_buffer_size: usize,
    pub smooth_stream_interval_ms: u64,
    pub pre_buffer_limit: usize,
    /// 0 disables the backlog flush.
    pub max_queued_units: usize,
    pub stream_retention_ms: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            user_name: DEFAULT_USER_NAME.to_string(),
            user_avatar_url: None,
            user_avatar_calculated_color: None,
            enable_smooth_streaming: false,
            min_chunk_buffer_size: DEFAULT_MIN_CHUNK_BUFFER_SIZE,
            smooth_stream_interval_ms: DEFAULT_SMOOTH_STREAM_INTERVAL_MS,
            pre_buffer_limit: DEFAULT_PRE_BUFFER_LIMIT,
            max_queued_units: DEFAULT_MAX_QUEUED_UNITS,
            stream_retention_ms: DEFAULT_STREAM_RETENTION_MS,
        }
    }
}

impl GlobalSettings {
    /// Missing file means defaults, not an error.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Settings handle shared by the stream manager and the renderer.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings(Arc<RwLock<GlobalSettings>>);

impl SharedSettings {
    pub fn new(settings: GlobalSettings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    pub fn snapshot(&self) -> GlobalSettings {
        self.0.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut GlobalSettings)) {
        f(&mut self.0.write());
    }

    pub fn read<T>(&self, f: impl FnOnce(&GlobalSettings) -> T) -> T {
        f(&self.0.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = GlobalSettings::load_from_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, GlobalSettings::default());
        assert_eq!(settings.min_chunk_buffer_size, 1);
        assert_eq!(settings.smooth_stream_interval_ms, 25);
    }

    #[test]
    fn test_partial_settings_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"userName":"Ada","enableSmoothStreaming":true}"#).unwrap();

        let settings = GlobalSettings::load_from_file(&path).unwrap();
        assert_eq!(settings.user_name, "Ada");
        assert!(settings.enable_smooth_streaming);
        assert_eq!(settings.stream_retention_ms, DEFAULT_STREAM_RETENTION_MS);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::new(dir.path().join("nested"));
        let settings = GlobalSettings {
            user_avatar_calculated_color: Some("rgb(1,2,3)".into()),
            max_queued_units: 0,
            ..Default::default()
        };
        settings.save_to_file(&config.settings_path()).unwrap();

        let loaded = GlobalSettings::load_from_file(&config.settings_path()).unwrap();
        assert_eq!(loaded, settings);
        let raw = std::fs::read_to_string(config.settings_path()).unwrap();
        assert!(raw.contains("userAvatarCalculatedColor"), "settings use camelCase keys");
    }

    #[test]
    fn test_shared_settings_update_visible_to_clones() {
        let shared = SharedSettings::default();
        let other = shared.clone();
        shared.update(|s| s.user_name = "Bob".into());
        assert_eq!(other.read(|s| s.user_name.clone()), "Bob");
    }
}
