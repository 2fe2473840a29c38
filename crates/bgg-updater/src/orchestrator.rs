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

//! Update orchestrator: periodic manifest checks and staged downloads
//!
//! Drives the download half of the update cycle. Staging completion never
//! triggers a swap; promotion only happens at the next boot, so an update is
//! never applied while the controller is in use. A failed cycle aborts that
//! cycle only and is retried at the next interval.

use crate::active::ActiveFirmware;
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::events::{UpdateEvent, report_event};
use crate::manifest::{FileEntry, MANIFEST_FILE, VersionManifest};
use crate::staging::{StagingManager, StagingRecord};
use crate::state::UpdaterState;
use crate::transport::FileTransport;
use crate::version;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const MAX_FETCH_ATTEMPTS: u32 = 3;
const RETRY_DELAYS: [u64; 2] = [1, 5]; // seconds

/// Read-only state surface for the companion application. Querying it has
/// no effect on the update machinery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdaterStatus {
    Idle,
    Checking,
    Downloading,
    Staged,
    Promoting,
    Error(String),
}

impl fmt::Display for UpdaterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Checking => write!(f, "checking"),
            Self::Downloading => write!(f, "downloading"),
            Self::Staged => write!(f, "staged"),
            Self::Promoting => write!(f, "promoting"),
            Self::Error(kind) => write!(f, "error:{kind}"),
        }
    }
}

/// Shared handle the companion surface reads and the updater writes
#[derive(Debug, Clone)]
pub struct StatusHandle(Arc<Mutex<UpdaterStatus>>);

impl StatusHandle {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(UpdaterStatus::Idle)))
    }

    pub fn set(&self, status: UpdaterStatus) {
        *self.0.lock() = status;
    }

    pub fn get(&self) -> UpdaterStatus {
        self.0.lock().clone()
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What a single check cycle decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Remote is not newer than the active version
    UpToDate,
    /// A new version is fully staged and will promote on the next boot
    Staged { version: String },
    /// Remote version has failed promotion too often and is skipped
    SkippedFailedVersion { version: String },
}

pub struct Orchestrator {
    config: UpdaterConfig,
    transport: Arc<dyn FileTransport>,
    staging: StagingManager,
    active: ActiveFirmware,
    status: StatusHandle,
}

impl Orchestrator {
    pub fn new(
        config: UpdaterConfig,
        transport: Arc<dyn FileTransport>,
        status: StatusHandle,
    ) -> Self {
        let staging = StagingManager::new(&config.staging_dir);
        let active = ActiveFirmware::new(&config.active_dir);
        Self {
            config,
            transport,
            staging,
            active,
            status,
        }
    }

    pub fn status(&self) -> UpdaterStatus {
        self.status.get()
    }

    /// One full check cycle: fetch manifest, compare, stage if newer
    pub async fn run_check_cycle(&self) -> Result<CycleOutcome> {
        self.status.set(UpdaterStatus::Checking);
        let result = self.check_and_stage().await;
        match &result {
            Ok(CycleOutcome::Staged { .. }) => self.status.set(UpdaterStatus::Staged),
            Ok(CycleOutcome::UpToDate | CycleOutcome::SkippedFailedVersion { .. }) => {
                self.status.set(UpdaterStatus::Idle);
            }
            Err(e) => self.status.set(UpdaterStatus::Error(e.kind().to_string())),
        }
        result
    }

    async fn check_and_stage(&self) -> Result<CycleOutcome> {
        let mut state = UpdaterState::load(&self.config.state_path)?;
        state.record_check();
        state.save(&self.config.state_path)?;

        let raw = self.transport.fetch(MANIFEST_FILE).await?;
        let manifest = VersionManifest::parse(&raw)?;
        let local = self.active.version();

        if !version::is_newer(&local, &manifest.version)? {
            tracing::info!("Already on latest version: {local}");
            return Ok(CycleOutcome::UpToDate);
        }

        if state.should_skip_version(&manifest.version) {
            tracing::warn!(
                "Skipping version {}, too many failed promotions",
                manifest.version
            );
            return Ok(CycleOutcome::SkippedFailedVersion {
                version: manifest.version,
            });
        }

        tracing::info!(
            "New version available: {} (current: {local})",
            manifest.version
        );
        let mut record = self.staging.begin_staging(&manifest)?;

        self.status.set(UpdaterStatus::Downloading);
        for entry in &manifest.files {
            self.fetch_with_retry(&mut record, entry).await?;
        }

        self.staging.finalize_staging(&mut record)?;
        report_event(&UpdateEvent::UpdateStaged {
            version: record.target_version.clone(),
            files: record.entries.len(),
        });

        Ok(CycleOutcome::Staged {
            version: record.target_version.clone(),
        })
    }

    /// Fetch one file, re-fetching from scratch on any failure. Backoff
    /// policy lives here, not in the staging manager.
    async fn fetch_with_retry(
        &self,
        record: &mut StagingRecord,
        entry: &FileEntry,
    ) -> Result<()> {
        let mut last_error = None;

        for attempt in 0..MAX_FETCH_ATTEMPTS {
            if attempt > 0 {
                tracing::warn!(
                    "Retrying {} (attempt {}/{MAX_FETCH_ATTEMPTS})",
                    entry.path,
                    attempt + 1
                );
                tokio::time::sleep(Duration::from_secs(RETRY_DELAYS[attempt as usize - 1])).await;
            }

            match self
                .staging
                .fetch_file(record, entry, self.transport.as_ref())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| UpdaterError::Transport("no error recorded".to_string())))
    }
}
