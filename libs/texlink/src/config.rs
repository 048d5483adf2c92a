// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Persisted settings, shared by every texlink process of a user.
//!
//! ```text
//! ~/.texlink/
//! └── config.toml
//!     [sharing]    registry capacity, frame counting, adapter
//!     [camera]     capture settings and last connected sender
//!     [selection]  sender picked by an external selector
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::file_lock;
use crate::registry::DEFAULT_MAX_SENDERS;
use crate::{Result, TexlinkError};

/// Get the TEXLINK_HOME directory path.
///
/// Resolution order:
/// 1. `TEXLINK_HOME` environment variable (explicit override)
/// 2. `XDG_CONFIG_HOME/texlink` (XDG compliance)
/// 3. `~/.texlink` (default)
pub fn texlink_home() -> PathBuf {
    if let Ok(home) = std::env::var("TEXLINK_HOME") {
        return PathBuf::from(home);
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("texlink");
    }

    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".texlink")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Slot count used when the sender directory is first created.
    pub max_senders: usize,
    /// Senders enable the shared frame counter.
    pub frame_count: bool,
    /// Adapter index for devices.
    pub adapter: u32,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            max_senders: DEFAULT_MAX_SENDERS,
            frame_count: true,
            adapter: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Index into the camera frame rate table.
    pub fps: u32,
    /// Index into the camera resolution table.
    pub resolution: u32,
    /// Deliver RGB instead of BGR.
    pub swap: bool,
    /// Deliver top-down rows instead of the default bottom-up.
    pub flip: bool,
    /// Last sender the camera connected to.
    pub sender_name: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fps: 3,
            resolution: 0,
            swap: false,
            flip: false,
            sender_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub sender_name: String,
    /// Bumped on every selection so pollers can tell repeats apart.
    pub serial: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sharing: SharingConfig,
    pub camera: CameraConfig,
    pub selection: SelectionConfig,
}

/// Reads and writes `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub const FILE_NAME: &'static str = "config.toml";

    /// `config.toml` under [`texlink_home`].
    pub fn default_location() -> Self {
        Self::at(texlink_home().join(Self::FILE_NAME))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration. A missing file yields defaults.
    pub fn load(&self) -> Result<Config> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&text)
            .map_err(|e| TexlinkError::Config(format!("{}: {}", self.path.display(), e)))
    }

    /// Write the configuration, replacing the file atomically.
    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(config)
            .map_err(|e| TexlinkError::Config(e.to_string()))?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!("ConfigStore: saved {}", self.path.display());
        Ok(())
    }

    /// Load, modify and save in one step, holding `config.toml.lock` so
    /// concurrent updates from other processes are not lost. Returns the
    /// saved configuration.
    pub fn update<F>(&self, f: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        self.locked(|| {
            let mut config = self.load()?;
            f(&mut config);
            self.save(&config)?;
            Ok(config)
        })
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.with_extension("toml.lock"))?;
        file_lock::lock_exclusive(&lock)?;
        let result = f();
        if let Err(e) = file_lock::unlock(&lock) {
            tracing::warn!("ConfigStore: unlock of {} failed: {}", self.path.display(), e);
        }
        result
    }

    /// Read one `section.key` value as text.
    pub fn get_value(&self, key: &str) -> Result<String> {
        let root = to_table(&self.load()?)?;
        let value = lookup(&root, key)?;
        Ok(match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Set one `section.key` value from text. The text is parsed as the
    /// type the key already has.
    pub fn set_value(&self, key: &str, raw: &str) -> Result<Config> {
        self.locked(|| self.set_value_unlocked(key, raw))
    }

    fn set_value_unlocked(&self, key: &str, raw: &str) -> Result<Config> {
        let mut root = to_table(&self.load()?)?;
        let (section, field) = split_key(key)?;

        let slot = root
            .get_mut(section)
            .and_then(toml::Value::as_table_mut)
            .and_then(|table| table.get_mut(field))
            .ok_or_else(|| TexlinkError::Config(format!("unknown key '{}'", key)))?;

        *slot = match &*slot {
            toml::Value::Boolean(_) => toml::Value::Boolean(raw.parse().map_err(|_| {
                TexlinkError::Config(format!("'{}' expects true or false, got '{}'", key, raw))
            })?),
            toml::Value::Integer(_) => toml::Value::Integer(raw.parse().map_err(|_| {
                TexlinkError::Config(format!("'{}' expects an integer, got '{}'", key, raw))
            })?),
            _ => toml::Value::String(raw.to_string()),
        };

        let config: Config = toml::Value::Table(root)
            .try_into()
            .map_err(|e: toml::de::Error| TexlinkError::Config(format!("'{}': {}", key, e)))?;
        self.save(&config)?;
        Ok(config)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::default_location()
    }
}

fn to_table(config: &Config) -> Result<toml::Table> {
    match toml::Value::try_from(config) {
        Ok(toml::Value::Table(table)) => Ok(table),
        Ok(_) => Err(TexlinkError::Config("configuration is not a table".to_string())),
        Err(e) => Err(TexlinkError::Config(e.to_string())),
    }
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('.')
        .filter(|(section, field)| !section.is_empty() && !field.is_empty())
        .ok_or_else(|| TexlinkError::Config(format!("'{}' is not of the form section.key", key)))
}

fn lookup<'a>(root: &'a toml::Table, key: &str) -> Result<&'a toml::Value> {
    let (section, field) = split_key(key)?;
    root.get(section)
        .and_then(toml::Value::as_table)
        .and_then(|table| table.get(field))
        .ok_or_else(|| TexlinkError::Config(format!("unknown key '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::at(dir.path().join("nested").join("config.toml"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let (_dir, store) = store();
        let config = store.load().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sharing.max_senders, 10);
        assert!(config.sharing.frame_count);
        assert_eq!(config.camera.fps, 3);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let (_dir, store) = store();
        std::thread::scope(|scope| {
            for _ in 0..2 {
                let store = store.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        store.update(|cfg| cfg.selection.serial += 1).unwrap();
                    }
                });
            }
        });
        assert_eq!(store.load().unwrap().selection.serial, 100);
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, store) = store();
        let mut config = Config::default();
        config.camera.sender_name = "Spout Demo Sender".to_string();
        config.camera.flip = true;
        config.selection.serial = 7;
        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), config);
    }

    #[test]
    fn test_partial_file_and_unknown_keys() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            "[camera]\nresolution = 10\nlegacy_option = \"x\"\n\n[extra]\nfoo = 1\n",
        )
        .unwrap();

        let config = store.load().unwrap();
        assert_eq!(config.camera.resolution, 10);
        assert_eq!(config.camera.fps, 3);
        assert_eq!(config.sharing, SharingConfig::default());
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "[camera\nfps = ").unwrap();
        assert!(matches!(store.load(), Err(TexlinkError::Config(_))));
    }

    #[test]
    fn test_update() {
        let (_dir, store) = store();
        store
            .update(|cfg| cfg.selection.sender_name = "A".to_string())
            .unwrap();
        let config = store.update(|cfg| cfg.selection.serial += 1).unwrap();
        assert_eq!(config.selection.sender_name, "A");
        assert_eq!(store.load().unwrap().selection.serial, 1);
    }

    #[test]
    fn test_set_and_get_value() {
        let (_dir, store) = store();
        store.set_value("sharing.max_senders", "16").unwrap();
        store.set_value("camera.swap", "true").unwrap();
        store.set_value("camera.sender_name", "My Sender").unwrap();

        let config = store.load().unwrap();
        assert_eq!(config.sharing.max_senders, 16);
        assert!(config.camera.swap);
        assert_eq!(store.get_value("camera.sender_name").unwrap(), "My Sender");
        assert_eq!(store.get_value("sharing.max_senders").unwrap(), "16");
    }

    #[test]
    fn test_set_value_rejects_bad_input() {
        let (_dir, store) = store();
        assert!(store.set_value("camera.swap", "maybe").is_err());
        assert!(store.set_value("camera.fps", "fast").is_err());
        assert!(store.set_value("camera.nope", "1").is_err());
        assert!(store.set_value("fps", "1").is_err());
        assert!(store.set_value("sharing.max_senders", "-1").is_err());
    }

    #[test]
    #[serial]
    fn test_home_resolution() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: serialized with other env-mutating tests.
        unsafe {
            std::env::set_var("TEXLINK_HOME", dir.path());
        }
        assert_eq!(texlink_home(), dir.path());
        assert_eq!(
            ConfigStore::default_location().path(),
            dir.path().join("config.toml")
        );

        unsafe {
            std::env::remove_var("TEXLINK_HOME");
            std::env::set_var("XDG_CONFIG_HOME", dir.path());
        }
        assert_eq!(texlink_home(), dir.path().join("texlink"));
        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }
}
