//! User-controlled settings
//!
//! `enabled` and `start_stop_sync_enabled` belong to the user, not to the
//! application: a settings UI writes them to a YAML file and the library
//! only reads it. A [`SettingsWatcher`] can reload the file when it changes.

use super::io::{load_config, save_config};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings owned by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    /// Allow this application to join sessions on the network
    pub enabled: bool,
    /// Share start/stop state with peers
    pub start_stop_sync_enabled: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            start_stop_sync_enabled: false,
        }
    }
}

impl UserSettings {
    pub fn load(path: &Path) -> Self {
        load_config(path)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        save_config(self, path)
    }
}

/// Watches the settings file and calls back when it changes
///
/// The watcher stops when dropped.
pub struct SettingsWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl SettingsWatcher {
    /// Watch `path`; `on_change` runs on the notify thread
    ///
    /// The parent directory is watched rather than the file, so the file may
    /// be created, replaced or deleted after the watch starts.
    pub fn spawn<F>(path: &Path, on_change: F) -> anyhow::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        use anyhow::Context;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create settings directory: {:?}", dir))?;

        let target = path.file_name().map(|n| n.to_os_string());
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let touches_target = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == target);
            if touches_target {
                on_change();
            }
        })
        .context("Failed to create settings watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;
        log::info!("Watching user settings at {:?}", path);

        Ok(Self {
            _watcher: watcher,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let settings = UserSettings::default();
        assert!(settings.enabled);
        assert!(!settings.start_stop_sync_enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "start_stop_sync_enabled: true\n").unwrap();
        let settings = UserSettings::load(&path);
        assert!(settings.enabled);
        assert!(settings.start_stop_sync_enabled);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let settings = UserSettings {
            enabled: false,
            start_stop_sync_enabled: true,
        };
        settings.save(&path).unwrap();
        assert_eq!(UserSettings::load(&path), settings);
    }

    #[test]
    fn test_watcher_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let (tx, rx) = crossbeam::channel::unbounded();
        let watcher = SettingsWatcher::spawn(&path, move || {
            let _ = tx.send(());
        })
        .unwrap();
        assert_eq!(watcher.path(), path.as_path());

        UserSettings::default().save(&path).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
