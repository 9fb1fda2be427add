//! Persisted wallpaper settings.
//!
//! The settings store is a small TOML file holding the four
//! `video-wallpaper-*` keys. It is read once at startup and watched for
//! changes afterwards; the watcher reports which keys changed so the
//! controller can apply exactly the affected operation.

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::controller::ControllerEvent;

/// The persisted settings, one field per store key.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(rename = "video-wallpaper-enabled", default)]
    pub enabled: bool,

    /// Media location in `file://` URI form. Empty means "no media configured".
    #[serde(rename = "video-wallpaper-uri", default)]
    pub uri: String,

    #[serde(rename = "video-wallpaper-loop", default = "default_true")]
    pub loop_enabled: bool,

    #[serde(rename = "video-wallpaper-volume", default)]
    pub volume: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: String::new(),
            loop_enabled: true,
            volume: 0.0,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Identifies a single settings key in change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Enabled,
    Uri,
    Loop,
    Volume,
}

impl SettingKey {
    pub fn name(self) -> &'static str {
        match self {
            Self::Enabled => "video-wallpaper-enabled",
            Self::Uri => "video-wallpaper-uri",
            Self::Loop => "video-wallpaper-loop",
            Self::Volume => "video-wallpaper-volume",
        }
    }
}

/// Keys whose values differ between two snapshots.
pub fn changed_keys(old: &Settings, new: &Settings) -> Vec<SettingKey> {
    let mut keys = Vec::new();
    if old.enabled != new.enabled {
        keys.push(SettingKey::Enabled);
    }
    if old.uri != new.uri {
        keys.push(SettingKey::Uri);
    }
    if old.loop_enabled != new.loop_enabled {
        keys.push(SettingKey::Loop);
    }
    if old.volume != new.volume {
        keys.push(SettingKey::Volume);
    }
    keys
}

/// Read access to the settings file, with an in-memory snapshot.
pub struct SettingsStore {
    path: PathBuf,
    current: Settings,
}

impl SettingsStore {
    /// Get the default settings file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("vidwall");

        Ok(config_dir.join("settings.toml"))
    }

    /// Load the store from a specific path. A missing file yields defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = read_settings(&path)?;
        Ok(Self { path, current })
    }

    /// Re-read the settings file from disk.
    pub fn reload(&mut self) -> Result<()> {
        self.current = read_settings(&self.path)?;
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.current
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        log::info!(
            "Settings file not found at {}, using defaults",
            path.display()
        );
        return Ok(Settings::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))
}

/// Watch the settings file and emit one [`ControllerEvent::SettingsChanged`]
/// per changed key.
///
/// The parent directory is watched rather than the file itself so that
/// replace-by-rename writes (the common editor save strategy) are seen. The
/// returned watcher must be kept alive for the lifetime of the daemon.
pub fn watch(
    path: &Path,
    events: mpsc::UnboundedSender<ControllerEvent>,
) -> Result<RecommendedWatcher> {
    let file = path.to_path_buf();
    let dir = file
        .parent()
        .context("Settings path has no parent directory")?
        .to_path_buf();

    // The directory must exist before it can be watched.
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create settings directory: {}", dir.display()))?;

    let mut last = read_settings(&file).unwrap_or_default();

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Settings watch error: {}", e);
                return;
            }
        };

        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
            _ => return,
        }
        if !event.paths.iter().any(|p| p == &file) {
            return;
        }

        let settings = match read_settings(&file) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Ignoring unreadable settings update: {}", e);
                return;
            }
        };

        let keys = changed_keys(&last, &settings);
        last = settings;

        for key in keys {
            log::debug!("Setting changed: {}", key.name());
            if events.send(ControllerEvent::SettingsChanged(key)).is_err() {
                // Controller is gone; daemon is shutting down.
                return;
            }
        }
    })?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch settings directory: {}", dir.display()))?;
    log::info!("Watching settings file: {}", path.display());

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(!settings.enabled);
        assert!(settings.uri.is_empty());
        assert!(settings.loop_enabled);
        assert_eq!(settings.volume, 0.0);
    }

    #[test]
    fn test_parse_full_file() {
        let toml = r#"
"video-wallpaper-enabled" = true
"video-wallpaper-uri" = "file:///home/user/bg.mp4"
"video-wallpaper-loop" = false
"video-wallpaper-volume" = 0.35
"#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.uri, "file:///home/user/bg.mp4");
        assert!(!settings.loop_enabled);
        assert_eq!(settings.volume, 0.35);
    }

    #[test]
    fn test_parse_partial_file_fills_defaults() {
        let toml = r#""video-wallpaper-uri" = "file:///tmp/a.mp4""#;

        let settings: Settings = toml::from_str(toml).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.uri, "file:///tmp/a.mp4");
        assert!(settings.loop_enabled);
        assert_eq!(settings.volume, 0.0);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.toml")).unwrap();
        assert_eq!(*store.settings(), Settings::default());
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "\"video-wallpaper-volume\" = 0.2\n").unwrap();

        let mut store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.settings().volume, 0.2);

        fs::write(
            &path,
            "\"video-wallpaper-volume\" = 0.9\n\"video-wallpaper-enabled\" = true\n",
        )
        .unwrap();
        store.reload().unwrap();
        assert_eq!(store.settings().volume, 0.9);
        assert!(store.settings().enabled);
    }

    #[test]
    fn test_changed_keys() {
        let old = Settings::default();
        let mut new = Settings::default();
        assert!(changed_keys(&old, &new).is_empty());

        new.enabled = true;
        new.volume = 0.5;
        let keys = changed_keys(&old, &new);
        assert_eq!(keys, vec![SettingKey::Enabled, SettingKey::Volume]);

        let renamed = Settings {
            uri: "file:///tmp/b.mp4".to_string(),
            ..Settings::default()
        };
        assert_eq!(changed_keys(&old, &renamed), vec![SettingKey::Uri]);
    }

    #[test]
    fn test_key_names() {
        assert_eq!(SettingKey::Enabled.name(), "video-wallpaper-enabled");
        assert_eq!(SettingKey::Uri.name(), "video-wallpaper-uri");
        assert_eq!(SettingKey::Loop.name(), "video-wallpaper-loop");
        assert_eq!(SettingKey::Volume.name(), "video-wallpaper-volume");
    }
}
