// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of BGG Updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Configuration module for the updater

use crate::error::{Result, UpdaterError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/data/updater_config.json";

fn default_true() -> bool {
    true
}

fn default_6() -> u64 {
    6
}

fn default_repository_url() -> String {
    "https://firmware.solare.cz/ch-guitar".to_string()
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/data/staging")
}

fn default_active_dir() -> PathBuf {
    PathBuf::from("/data/firmware")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/data/updater_state.json")
}

fn default_preserve_keys() -> Vec<String> {
    [
        "led_color",
        "released_color",
        "led_brightness",
        "whammy_min",
        "whammy_max",
        "whammy_reverse",
        "tilt_wave_enabled",
        "hat_mode",
    ]
    .iter()
    .map(|key| (*key).to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Enable automatic update checks
    #[serde(default = "default_true")]
    pub auto_update: bool,

    /// Base URL of the remote firmware repository
    #[serde(default = "default_repository_url")]
    pub repository_url: String,

    /// How often to check for updates (hours)
    #[serde(default = "default_6")]
    pub check_interval_hours: u64,

    /// Where update candidates are downloaded and verified
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// The active firmware area; only the boot-time migrator writes here
    #[serde(default = "default_active_dir")]
    pub active_dir: PathBuf,

    /// Updater bookkeeping state location
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// User-tuned config keys re-applied to config.json after a promotion
    #[serde(default = "default_preserve_keys")]
    pub preserve_keys: Vec<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            auto_update: true,
            repository_url: default_repository_url(),
            check_interval_hours: 6,
            staging_dir: default_staging_dir(),
            active_dir: default_active_dir(),
            state_path: default_state_path(),
            preserve_keys: default_preserve_keys(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<UpdaterConfig> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| UpdaterError::Config(format!("failed to parse config: {e}")))
    } else {
        // Create with defaults
        let config = UpdaterConfig::default();
        save_config(&config, path)?;
        Ok(config)
    }
}

pub fn save_config(config: &UpdaterConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(config)?;

    // Atomic write
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;

    Ok(())
}
