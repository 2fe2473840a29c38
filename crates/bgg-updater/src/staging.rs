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

//! Staging area management: download and verify update candidates
//!
//! The staging directory is a mutable resource disjoint from the active
//! firmware area. Everything written here goes through a write-then-rename
//! pattern, so a crash at any point never leaves a partial file at a path
//! the migrator will later trust.

use crate::checksum;
use crate::error::{Result, UpdaterError};
use crate::manifest::{FileEntry, MANIFEST_FILE, VersionManifest};
use crate::transport::FileTransport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const RECORD_FILE: &str = "staging_record.json";
const FILES_DIR: &str = "files";
const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagingStatus {
    Downloading,
    Verified,
    Promoting,
    Complete,
    Failed,
}

impl StagingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedEntry {
    pub expected_checksum: String,
    pub staged_path: PathBuf,
    pub verified: bool,
}

/// Durable record of one staging batch, persisted inside the staging
/// directory so an interrupted download or promotion can be resumed or
/// resolved on a later boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub target_version: String,
    pub entries: BTreeMap<String, StagedEntry>,
    pub status: StagingStatus,
    pub created_at: DateTime<Utc>,
}

impl StagingRecord {
    pub fn load(staging_dir: &Path) -> Result<Option<Self>> {
        let path = staging_dir.join(RECORD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, staging_dir: &Path) -> Result<()> {
        fs::create_dir_all(staging_dir)?;
        let path = staging_dir.join(RECORD_FILE);
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)?;

        // Atomic write
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;

        Ok(())
    }

    pub fn unverified_count(&self) -> usize {
        self.entries.values().filter(|entry| !entry.verified).count()
    }

    pub fn is_fully_verified(&self) -> bool {
        self.unverified_count() == 0
    }
}

/// Owns the staging directory and drives the download half of an update.
/// Never touches the active firmware area.
#[derive(Debug, Clone)]
pub struct StagingManager {
    staging_dir: PathBuf,
}

impl StagingManager {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn staged_path(&self, relative: &str) -> PathBuf {
        self.staging_dir.join(FILES_DIR).join(relative)
    }

    fn tmp_path(&self, relative: &str) -> PathBuf {
        self.staging_dir
            .join(TMP_DIR)
            .join(format!("{}.part", relative.replace('/', "__")))
    }

    /// Create a fresh staging record for `manifest`, or resume a non-terminal
    /// one already targeting the same version.
    pub fn begin_staging(&self, manifest: &VersionManifest) -> Result<StagingRecord> {
        if let Some(existing) = StagingRecord::load(&self.staging_dir)? {
            if !existing.status.is_terminal() {
                if existing.target_version == manifest.version {
                    tracing::info!(
                        "Resuming staging for version {} ({} of {} files verified)",
                        existing.target_version,
                        existing.entries.len() - existing.unverified_count(),
                        existing.entries.len()
                    );
                    return Ok(existing);
                }
                return Err(UpdaterError::StagingInProgress {
                    current: existing.target_version,
                    requested: manifest.version.clone(),
                });
            }
            // Stale terminal leftovers, start over
            self.clear()?;
        }

        let entries = manifest
            .files
            .iter()
            .map(|entry| {
                (
                    entry.path.clone(),
                    StagedEntry {
                        expected_checksum: entry.checksum.clone(),
                        staged_path: self.staged_path(&entry.path),
                        verified: false,
                    },
                )
            })
            .collect();

        let record = StagingRecord {
            target_version: manifest.version.clone(),
            entries,
            status: StagingStatus::Downloading,
            created_at: Utc::now(),
        };
        record.save(&self.staging_dir)?;
        self.save_manifest(manifest)?;

        tracing::info!(
            "Began staging version {} ({} files)",
            record.target_version,
            record.entries.len()
        );
        Ok(record)
    }

    /// Download one manifest entry into the staging area.
    ///
    /// The bytes are checked for length and digest before anything appears at
    /// the staged path; a mismatch discards the attempt entirely and leaves
    /// every other entry untouched.
    pub async fn fetch_file(
        &self,
        record: &mut StagingRecord,
        entry: &FileEntry,
        transport: &dyn FileTransport,
    ) -> Result<()> {
        if let Some(existing) = record.entries.get(&entry.path)
            && existing.verified
        {
            tracing::debug!("Skipping already verified file {}", entry.path);
            return Ok(());
        }

        let bytes = transport.fetch(&entry.path).await?;

        if bytes.len() as u64 != entry.size {
            return Err(UpdaterError::SizeMismatch {
                path: entry.path.clone(),
                expected: entry.size,
                actual: bytes.len() as u64,
            });
        }

        let actual = checksum::digest_bytes(&bytes);
        if !actual.eq_ignore_ascii_case(&entry.checksum) {
            return Err(UpdaterError::ChecksumMismatch {
                path: entry.path.clone(),
                expected: entry.checksum.clone(),
                actual,
            });
        }

        let staged_path = self.staged_path(&entry.path);
        let tmp_path = self.tmp_path(&entry.path);
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = staged_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &staged_path)?;

        record.entries.insert(
            entry.path.clone(),
            StagedEntry {
                expected_checksum: actual,
                staged_path,
                verified: true,
            },
        );
        record.save(&self.staging_dir)?;

        tracing::info!("Staged and verified {} ({} bytes)", entry.path, entry.size);
        Ok(())
    }

    /// Transition `Downloading -> Verified` once every entry is verified.
    ///
    /// Idempotent on an already-verified record. On `IncompleteStaging` the
    /// record is left in place so a later cycle resumes instead of
    /// re-downloading verified files.
    pub fn finalize_staging(&self, record: &mut StagingRecord) -> Result<()> {
        if record.status == StagingStatus::Verified {
            return Ok(());
        }

        let missing = record.unverified_count();
        if missing > 0 {
            return Err(UpdaterError::IncompleteStaging {
                missing,
                total: record.entries.len(),
            });
        }

        record.status = StagingStatus::Verified;
        record.save(&self.staging_dir)?;
        tracing::info!(
            "Staging of version {} finalized, promotion will run on next boot",
            record.target_version
        );
        Ok(())
    }

    /// The manifest this staging batch was created from
    pub fn staged_manifest(&self) -> Result<VersionManifest> {
        let raw = fs::read(self.staging_dir.join(MANIFEST_FILE))?;
        VersionManifest::parse(&raw)
    }

    fn save_manifest(&self, manifest: &VersionManifest) -> Result<()> {
        let path = self.staging_dir.join(MANIFEST_FILE);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(manifest)?)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Remove the staging directory and everything in it
    pub fn clear(&self) -> Result<()> {
        if self.staging_dir.exists() {
            fs::remove_dir_all(&self.staging_dir)?;
        }
        Ok(())
    }
}
