//! Configuration knobs (§6) and their TOML-backed persistence.
//!
//! Mirrors the teacher's `Settings` posture: every field carries a
//! `#[serde(default = "...")]` so a partial or missing file is always
//! valid, and a failure to load never aborts the process — it logs and
//! falls back to [`Config::default`].

use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "termgfx-core";
const CONFIG_FILENAME: &str = "config.toml";

fn default_max_image_disk_size() -> u64 {
    20 * 1024 * 1024
}

fn default_max_total_disk_size() -> u64 {
    300 * 1024 * 1024
}

fn default_max_image_ram_size() -> u64 {
    100 * 1024 * 1024
}

fn default_max_total_ram_size() -> u64 {
    300 * 1024 * 1024
}

fn default_max_total_placements() -> usize {
    256
}

fn default_max_total_images() -> usize {
    256
}

fn default_tolerance_ratio() -> f64 {
    0.0
}

fn default_cache_dir_template() -> String {
    "st-images-XXXXXX".to_string()
}

/// Resource ceilings and other tunables from §6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Max size of a single image's on-disk artifact, in bytes.
    #[serde(default = "default_max_image_disk_size")]
    pub max_image_disk_size: u64,

    /// Max total size of the on-disk cache, in bytes.
    #[serde(default = "default_max_total_disk_size")]
    pub max_total_disk_size: u64,

    /// Max size of a single placement's decoded RAM buffer, in bytes.
    #[serde(default = "default_max_image_ram_size")]
    pub max_image_ram_size: u64,

    /// Max total RAM used by decoded image/placement buffers, in bytes.
    #[serde(default = "default_max_total_ram_size")]
    pub max_total_ram_size: u64,

    /// Max number of placements tracked across all images.
    #[serde(default = "default_max_total_placements")]
    pub max_total_placements: usize,

    /// Max number of images tracked at once, regardless of size (§4.C pass 1).
    #[serde(default = "default_max_total_images")]
    pub max_total_images: usize,

    /// Slack above each ceiling before `check_limits` starts reaping.
    #[serde(default = "default_tolerance_ratio")]
    pub tolerance_ratio: f64,

    /// `mkstemp`-style template (relative to the system temp dir) used to
    /// create the on-disk cache directory.
    #[serde(default = "default_cache_dir_template")]
    pub cache_dir_template: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_image_disk_size: default_max_image_disk_size(),
            max_total_disk_size: default_max_total_disk_size(),
            max_image_ram_size: default_max_image_ram_size(),
            max_total_ram_size: default_max_total_ram_size(),
            max_total_placements: default_max_total_placements(),
            max_total_images: default_max_total_images(),
            tolerance_ratio: default_tolerance_ratio(),
            cache_dir_template: default_cache_dir_template(),
        }
    }
}

impl Config {
    /// Ceiling adjusted by the tolerance ratio (§4.C "Eviction").
    #[must_use]
    pub fn with_tolerance(&self, ceiling: u64) -> u64 {
        let slack = (ceiling as f64) * self.tolerance_ratio;
        ceiling.saturating_add(slack as u64)
    }

    /// The default config file path: `<config dir>/termgfx-core/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Loads the config from `path`, falling back to defaults on any error.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                debug!("no config at {}: {err}", path.display());
                return Self::default();
            }
        };
        match toml::from_str(&text) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("failed to parse config at {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Loads from [`Config::default_path`], or defaults if unavailable.
    #[must_use]
    pub fn load_default() -> Self {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Self::default(),
        }
    }

    /// Persists the config to `path` as TOML, creating parent dirs as needed.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        std::fs::write(path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_ceilings() {
        let cfg = Config::default();
        assert_eq!(cfg.max_image_disk_size, 20 * 1024 * 1024);
        assert_eq!(cfg.max_total_disk_size, 300 * 1024 * 1024);
        assert_eq!(cfg.max_image_ram_size, 100 * 1024 * 1024);
        assert_eq!(cfg.max_total_ram_size, 300 * 1024 * 1024);
    }

    #[test]
    fn load_missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        assert_eq!(Config::load(&path), Config::default());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_total_placements = 10\n").unwrap();
        let cfg = Config::load(&path);
        assert_eq!(cfg.max_total_placements, 10);
        assert_eq!(cfg.max_image_disk_size, default_max_image_disk_size());
    }

    #[test]
    fn round_trip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.tolerance_ratio = 0.1;
        cfg.save(&path).unwrap();
        assert_eq!(Config::load(&path), cfg);
    }

    #[test]
    fn with_tolerance_adds_slack() {
        let mut cfg = Config::default();
        cfg.tolerance_ratio = 0.5;
        assert_eq!(cfg.with_tolerance(100), 150);
    }
}
