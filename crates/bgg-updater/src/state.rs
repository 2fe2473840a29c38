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

//! Persisted bookkeeping state for the updater

use crate::error::{Result, UpdaterError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A version that failed promotion this many times in a row is skipped
pub const MAX_VERSION_FAILURES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdaterState {
    /// Last time we checked the remote repository
    pub last_check_at: Option<DateTime<Utc>>,

    /// Last successful promotion timestamp
    pub last_upgrade_at: Option<DateTime<Utc>>,

    /// Number of consecutive failed promotion attempts
    pub consecutive_failures: u32,

    /// Version that keeps failing promotion
    pub failed_version: Option<String>,
}

impl UpdaterState {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                UpdaterError::Config(format!("failed to parse updater state: {e}"))
            })
        } else {
            // Create with defaults
            let state = Self::default();
            state.save(path)?;
            Ok(state)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)?;

        // Atomic write
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    pub fn record_check(&mut self) {
        self.last_check_at = Some(Utc::now());
    }

    pub fn record_failure(&mut self, version: &str) {
        if self.failed_version.as_deref() == Some(version) {
            self.consecutive_failures += 1;
        } else {
            self.failed_version = Some(version.to_string());
            self.consecutive_failures = 1;
        }
    }

    pub fn record_success(&mut self) {
        self.last_upgrade_at = Some(Utc::now());
        self.consecutive_failures = 0;
        self.failed_version = None;
    }

    pub fn should_skip_version(&self, version: &str) -> bool {
        self.failed_version.as_deref() == Some(version)
            && self.consecutive_failures >= MAX_VERSION_FAILURES
    }
}
