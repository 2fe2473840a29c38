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

//! Boot-time migration state machine
//!
//! Runs exactly once at the start of each boot, before any other subsystem.
//! A verified staging batch is promoted into the active firmware area with
//! per-file atomic renames; any failure rolls the active set back from
//! pre-swap backups. The device always comes up with either the old complete
//! firmware or the new complete firmware, never a mix.
//!
//! The persisted `StagingRecord` status only reaches `Promoting` after every
//! backup is in place, so a record found in `Promoting` at boot always has
//! enough state to roll back. `Complete` and `Failed` are terminal and both
//! clear the staging area.

use crate::active::ActiveFirmware;
use crate::checksum;
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::events::{UpdateEvent, report_event};
use crate::manifest::{MANIFEST_FILE, VersionManifest};
use crate::staging::{StagedEntry, StagingManager, StagingRecord, StagingStatus};
use std::fs;
use std::path::{Path, PathBuf};

const BACKUP_DIR: &str = "backup";

/// The device configuration file; user-tuned keys inside it survive updates
const DEVICE_CONFIG_FILE: &str = "config.json";

/// Result of the boot-time migration pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// A staged version was promoted; the active set is the new version
    Complete { version: String },
    /// Promotion was attempted and failed; the active set is unchanged
    Failed { version: String },
    /// Nothing to promote, resume normal boot
    Idle,
}

/// Sole owner of the active firmware area during promotion. Never downloads.
#[derive(Debug)]
pub struct Migrator {
    staging: StagingManager,
    active: ActiveFirmware,
    backup_dir: PathBuf,
    preserve_keys: Vec<String>,
}

impl Migrator {
    pub fn new(config: &UpdaterConfig) -> Self {
        Self {
            staging: StagingManager::new(&config.staging_dir),
            active: ActiveFirmware::new(&config.active_dir),
            backup_dir: config.staging_dir.join(BACKUP_DIR),
            preserve_keys: config.preserve_keys.clone(),
        }
    }

    /// Resolve any pending staged update.
    ///
    /// Called once per boot before anything else initializes. Only a
    /// rollback failure is returned as `Err`; the caller must then surface
    /// the recovery indicator and refuse normal operation, because the
    /// active set may be a mix of two versions.
    pub fn run_at_boot(&self) -> Result<BootOutcome> {
        let Some(mut record) = StagingRecord::load(self.staging.staging_dir())? else {
            tracing::debug!("No staging record, resuming normal boot");
            return Ok(BootOutcome::Idle);
        };

        match record.status {
            StagingStatus::Downloading => {
                tracing::info!(
                    "Staging of {} still downloading, leaving it for the orchestrator",
                    record.target_version
                );
                Ok(BootOutcome::Idle)
            }
            StagingStatus::Complete | StagingStatus::Failed => {
                // A previous attempt resolved but could not clear the area
                self.staging.clear()?;
                Ok(BootOutcome::Idle)
            }
            StagingStatus::Promoting => {
                tracing::warn!(
                    "Found interrupted promotion of {}, rolling back",
                    record.target_version
                );
                self.roll_back(&record)?;
                let error = UpdaterError::Swap("promotion interrupted by reboot".to_string());
                Ok(self.resolve_failed(&mut record, &error))
            }
            StagingStatus::Verified => self.promote(&mut record),
        }
    }

    fn promote(&self, record: &mut StagingRecord) -> Result<BootOutcome> {
        let from_version = self.active.version();
        tracing::info!(
            "Promoting staged version {} (current: {from_version})",
            record.target_version
        );
        report_event(&UpdateEvent::PromotionStarted {
            from_version,
            to_version: record.target_version.clone(),
        });

        // Staged files may have rotted or been tampered with between
        // download and this boot; trust nothing that is not re-verified now.
        if let Err(e) = self.reverify(record) {
            tracing::error!("Staged files failed re-verification: {e}");
            return Ok(self.resolve_failed(record, &e));
        }

        if let Err(e) = self.back_up_active(record) {
            tracing::error!("Could not back up active files before swap: {e}");
            return Ok(self.resolve_failed(record, &e));
        }

        // Backups are complete; from here on a crash at any point is
        // recovered by rolling back on the next boot.
        record.status = StagingStatus::Promoting;
        record.save(self.staging.staging_dir())?;

        match self.swap_all(record).and_then(|()| self.finish(record)) {
            Ok(()) => {
                report_event(&UpdateEvent::PromotionCompleted {
                    version: record.target_version.clone(),
                });
                tracing::info!("Promotion of {} complete", record.target_version);
                Ok(BootOutcome::Complete {
                    version: record.target_version.clone(),
                })
            }
            Err(e) => {
                tracing::error!("Swap failed, rolling back: {e}");
                self.roll_back(record)?;
                Ok(self.resolve_failed(record, &e))
            }
        }
    }

    /// Re-check every staged file against its manifest checksum
    fn reverify(&self, record: &StagingRecord) -> Result<()> {
        for (path, entry) in &record.entries {
            if !entry.verified {
                return Err(UpdaterError::IncompleteStaging {
                    missing: record.unverified_count(),
                    total: record.entries.len(),
                });
            }
            let actual = checksum::digest_file(&entry.staged_path)?;
            if !actual.eq_ignore_ascii_case(&entry.expected_checksum) {
                return Err(UpdaterError::ChecksumMismatch {
                    path: path.clone(),
                    expected: entry.expected_checksum.clone(),
                    actual,
                });
            }
        }
        tracing::debug!("All {} staged files re-verified", record.entries.len());
        Ok(())
    }

    /// Copy every active file the swap will replace, plus the manifest
    /// snapshot, into the backup area
    fn back_up_active(&self, record: &StagingRecord) -> Result<()> {
        fs::create_dir_all(&self.backup_dir)?;

        for path in record.entries.keys() {
            let source = self.active.file_path(path);
            if !source.exists() {
                continue; // new file in this version, nothing to preserve
            }
            let backup = self.backup_dir.join(path);
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &backup)?;
        }

        let snapshot = self.active.file_path(MANIFEST_FILE);
        if snapshot.exists() {
            fs::copy(&snapshot, self.backup_dir.join(MANIFEST_FILE))?;
        }

        tracing::info!("Backed up active files to {}", self.backup_dir.display());
        Ok(())
    }

    fn swap_all(&self, record: &StagingRecord) -> Result<()> {
        for (path, entry) in &record.entries {
            self.swap_one(path, entry)
                .map_err(|e| UpdaterError::Swap(format!("{path}: {e}")))?;
        }
        Ok(())
    }

    /// Replace one active file with its staged counterpart. The rename is
    /// atomic: an observer sees the old file or the new file, never a
    /// partial write.
    fn swap_one(&self, path: &str, entry: &StagedEntry) -> Result<()> {
        let destination = self.active.file_path(path);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&entry.staged_path, &destination)?;
        Ok(())
    }

    /// Post-swap bookkeeping: settings merge, snapshot, terminal cleanup
    fn finish(&self, record: &mut StagingRecord) -> Result<()> {
        self.merge_preserved_settings(record);

        let manifest = self.staging.staged_manifest()?;
        self.active.write_snapshot(&manifest)?;

        // Terminal status goes to disk after the snapshot: a crash between
        // the two rolls back on the next boot instead of clearing a
        // half-labelled set.
        record.status = StagingStatus::Complete;
        record.save(self.staging.staging_dir())?;
        self.staging.clear()?;
        Ok(())
    }

    fn resolve_failed(&self, record: &mut StagingRecord, error: &UpdaterError) -> BootOutcome {
        report_event(&UpdateEvent::PromotionFailed {
            version: record.target_version.clone(),
            error: error.to_string(),
        });

        record.status = StagingStatus::Failed;
        if let Err(e) = record.save(self.staging.staging_dir()) {
            tracing::warn!("Could not persist failed staging record: {e}");
        }
        if let Err(e) = self.staging.clear() {
            tracing::warn!("Could not clear staging area: {e}");
        }

        BootOutcome::Failed {
            version: record.target_version.clone(),
        }
    }

    fn roll_back(&self, record: &StagingRecord) -> Result<()> {
        tracing::warn!("Rolling back partial promotion of {}", record.target_version);
        report_event(&UpdateEvent::RollbackStarted {
            version: record.target_version.clone(),
        });

        if let Err(e) = self.restore_backups(record) {
            report_event(&UpdateEvent::RollbackFailed {
                version: record.target_version.clone(),
                error: e.to_string(),
            });
            return Err(e);
        }

        let restored = self.active.version();
        report_event(&UpdateEvent::RollbackCompleted {
            restored_version: restored.clone(),
        });
        tracing::info!("Rollback restored version {restored}");
        Ok(())
    }

    fn restore_backups(&self, record: &StagingRecord) -> Result<()> {
        let previous = self.previous_manifest()?;

        for path in record.entries.keys() {
            let destination = self.active.file_path(path);
            let backup = self.backup_dir.join(path);

            if backup.exists() {
                fs::copy(&backup, &destination)
                    .map_err(|e| UpdaterError::Rollback(format!("restoring {path}: {e}")))?;
            } else if previous.as_ref().is_some_and(|m| m.file_for(path).is_some()) {
                // The file was part of the previous version but its backup
                // is gone: the old content is unrecoverable.
                return Err(UpdaterError::Rollback(format!(
                    "backup missing for previously active file {path}"
                )));
            } else if destination.exists() {
                // Swapped-in file that had no previous version
                fs::remove_file(&destination)
                    .map_err(|e| UpdaterError::Rollback(format!("removing {path}: {e}")))?;
            }
        }

        // The snapshot goes back last so the version label never points at a
        // set that is still being restored.
        let snapshot_backup = self.backup_dir.join(MANIFEST_FILE);
        let snapshot_active = self.active.file_path(MANIFEST_FILE);
        if snapshot_backup.exists() {
            fs::copy(&snapshot_backup, &snapshot_active).map_err(|e| {
                UpdaterError::Rollback(format!("restoring manifest snapshot: {e}"))
            })?;
        } else if snapshot_active.exists() {
            fs::remove_file(&snapshot_active).map_err(|e| {
                UpdaterError::Rollback(format!("removing manifest snapshot: {e}"))
            })?;
        }

        Ok(())
    }

    /// Manifest of the set that was active when backups were taken
    fn previous_manifest(&self) -> Result<Option<VersionManifest>> {
        let path = self.backup_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)
            .map_err(|e| UpdaterError::Rollback(format!("reading backup manifest: {e}")))?;
        VersionManifest::parse(&raw)
            .map(Some)
            .map_err(|e| UpdaterError::Rollback(format!("parsing backup manifest: {e}")))
    }

    /// Re-apply user-tuned configuration keys from the pre-swap backup onto
    /// the freshly promoted device config. Best effort: a merge problem is
    /// logged and never fails the promotion.
    fn merge_preserved_settings(&self, record: &StagingRecord) {
        if self.preserve_keys.is_empty() || !record.entries.contains_key(DEVICE_CONFIG_FILE) {
            return;
        }
        let backup = self.backup_dir.join(DEVICE_CONFIG_FILE);
        if !backup.exists() {
            return;
        }
        let target = self.active.file_path(DEVICE_CONFIG_FILE);
        if let Err(e) = merge_config_keys(&backup, &target, &self.preserve_keys) {
            tracing::warn!("Could not preserve user settings across update: {e}");
        }
    }
}

fn merge_config_keys(previous: &Path, target: &Path, keys: &[String]) -> Result<()> {
    let old: serde_json::Value = serde_json::from_str(&fs::read_to_string(previous)?)?;
    let mut new: serde_json::Value = serde_json::from_str(&fs::read_to_string(target)?)?;

    let Some(old_map) = old.as_object() else {
        return Ok(());
    };
    let Some(new_map) = new.as_object_mut() else {
        return Ok(());
    };

    let mut preserved = Vec::new();
    for key in keys {
        if let Some(value) = old_map.get(key) {
            new_map.insert(key.clone(), value.clone());
            preserved.push(key.as_str());
        }
    }
    if preserved.is_empty() {
        return Ok(());
    }

    let temp = target.with_extension("tmp");
    fs::write(&temp, serde_json::to_string_pretty(&new)?)?;
    fs::rename(&temp, target)?;
    tracing::info!("Preserved user settings: {}", preserved.join(", "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileEntry;
    use chrono::Utc;
    use std::path::Path;

    fn test_config(root: &Path) -> UpdaterConfig {
        UpdaterConfig {
            staging_dir: root.join("staging"),
            active_dir: root.join("firmware"),
            state_path: root.join("updater_state.json"),
            ..UpdaterConfig::default()
        }
    }

    fn manifest_for(version: &str, files: &[(&str, &[u8])]) -> VersionManifest {
        VersionManifest {
            version: version.to_string(),
            generated_at: Utc::now(),
            files: files
                .iter()
                .map(|(path, content)| FileEntry {
                    path: (*path).to_string(),
                    size: content.len() as u64,
                    checksum: checksum::digest_bytes(content),
                })
                .collect(),
        }
    }

    /// Write an installed firmware set plus its manifest snapshot
    fn install_active(config: &UpdaterConfig, manifest: &VersionManifest, files: &[(&str, &[u8])]) {
        for (path, content) in files {
            let dest = config.active_dir.join(path);
            fs::create_dir_all(dest.parent().unwrap()).unwrap();
            fs::write(dest, content).unwrap();
        }
        ActiveFirmware::new(&config.active_dir)
            .write_snapshot(manifest)
            .unwrap();
    }

    /// Place a fully verified staging batch on disk, as the orchestrator
    /// leaves it before a reboot
    fn stage_verified(
        config: &UpdaterConfig,
        manifest: &VersionManifest,
        files: &[(&str, &[u8])],
    ) -> StagingRecord {
        let manager = StagingManager::new(&config.staging_dir);
        let mut record = manager.begin_staging(manifest).unwrap();
        for (path, content) in files {
            let staged = record.entries[*path].staged_path.clone();
            fs::create_dir_all(staged.parent().unwrap()).unwrap();
            fs::write(&staged, content).unwrap();
            record.entries.get_mut(*path).unwrap().verified = true;
        }
        record.status = StagingStatus::Verified;
        record.save(&config.staging_dir).unwrap();
        record
    }

    fn read_active(config: &UpdaterConfig, path: &str) -> Vec<u8> {
        fs::read(config.active_dir.join(path)).unwrap()
    }

    const OLD_FILES: &[(&str, &[u8])] = &[
        ("boot.py", b"boot v3.0"),
        ("code.py", b"code v3.0"),
        ("lib/hardware.py", b"hardware v3.0"),
    ];

    const NEW_FILES: &[(&str, &[u8])] = &[
        ("boot.py", b"boot v3.1"),
        ("code.py", b"code v3.1"),
        ("lib/hardware.py", b"hardware v3.1"),
        ("lib/pin_detect.py", b"pin detect v3.1"),
    ];

    #[test]
    fn test_idle_without_staging_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        let outcome = Migrator::new(&config).run_at_boot().unwrap();
        assert_eq!(outcome, BootOutcome::Idle);
    }

    #[test]
    fn test_downloading_record_is_left_for_resumption() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        let manifest = manifest_for("3.1", NEW_FILES);
        StagingManager::new(&config.staging_dir)
            .begin_staging(&manifest)
            .unwrap();

        let outcome = Migrator::new(&config).run_at_boot().unwrap();
        assert_eq!(outcome, BootOutcome::Idle);
        assert!(
            StagingRecord::load(&config.staging_dir)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_stale_terminal_record_is_cleared() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        let manifest = manifest_for("3.1", NEW_FILES);
        let mut record = stage_verified(&config, &manifest, NEW_FILES);
        record.status = StagingStatus::Complete;
        record.save(&config.staging_dir).unwrap();

        let outcome = Migrator::new(&config).run_at_boot().unwrap();
        assert_eq!(outcome, BootOutcome::Idle);
        assert!(!config.staging_dir.exists());
    }

    #[test]
    fn test_promotion_happy_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        install_active(&config, &manifest_for("3.0", OLD_FILES), OLD_FILES);
        stage_verified(&config, &manifest_for("3.1", NEW_FILES), NEW_FILES);

        let outcome = Migrator::new(&config).run_at_boot().unwrap();
        assert_eq!(
            outcome,
            BootOutcome::Complete {
                version: "3.1".to_string()
            }
        );

        for (path, content) in NEW_FILES {
            assert_eq!(read_active(&config, path), *content);
        }
        assert_eq!(ActiveFirmware::new(&config.active_dir).version(), "3.1");
        assert!(!config.staging_dir.exists());
    }

    #[test]
    fn test_promotion_onto_factory_device() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        stage_verified(&config, &manifest_for("3.1", NEW_FILES), NEW_FILES);

        let outcome = Migrator::new(&config).run_at_boot().unwrap();
        assert!(matches!(outcome, BootOutcome::Complete { .. }));
        assert_eq!(ActiveFirmware::new(&config.active_dir).version(), "3.1");
    }

    #[test]
    fn test_corrupted_staged_file_fails_closed() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        install_active(&config, &manifest_for("3.0", OLD_FILES), OLD_FILES);
        let record = stage_verified(&config, &manifest_for("3.1", NEW_FILES), NEW_FILES);

        // Bit-rot between download and boot
        fs::write(&record.entries["code.py"].staged_path, b"flipped bits").unwrap();

        let outcome = Migrator::new(&config).run_at_boot().unwrap();
        assert_eq!(
            outcome,
            BootOutcome::Failed {
                version: "3.1".to_string()
            }
        );

        // Active set byte-identical to its pre-attempt state
        for (path, content) in OLD_FILES {
            assert_eq!(read_active(&config, path), *content);
        }
        assert!(!config.active_dir.join("lib/pin_detect.py").exists());
        assert_eq!(ActiveFirmware::new(&config.active_dir).version(), "3.0");
        assert!(!config.staging_dir.exists());
    }

    #[test]
    fn test_unverified_entry_fails_closed() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        install_active(&config, &manifest_for("3.0", OLD_FILES), OLD_FILES);
        let mut record = stage_verified(&config, &manifest_for("3.1", NEW_FILES), NEW_FILES);
        record.entries.get_mut("code.py").unwrap().verified = false;
        record.save(&config.staging_dir).unwrap();

        let outcome = Migrator::new(&config).run_at_boot().unwrap();
        assert!(matches!(outcome, BootOutcome::Failed { .. }));
        assert_eq!(ActiveFirmware::new(&config.active_dir).version(), "3.0");
    }

    #[test]
    fn test_interrupted_swap_recovers_wholly_old_for_any_k() {
        let old_manifest = manifest_for("3.0", OLD_FILES);
        let new_manifest = manifest_for("3.1", NEW_FILES);

        for halt_after in 0..=NEW_FILES.len() {
            let dir = tempfile::TempDir::new().unwrap();
            let config = test_config(dir.path());
            install_active(&config, &old_manifest, OLD_FILES);
            let mut record = stage_verified(&config, &new_manifest, NEW_FILES);

            // Drive the promotion by hand up to the crash point
            let migrator = Migrator::new(&config);
            migrator.back_up_active(&record).unwrap();
            record.status = StagingStatus::Promoting;
            record.save(&config.staging_dir).unwrap();
            for (path, entry) in record.entries.iter().take(halt_after) {
                migrator.swap_one(path, entry).unwrap();
            }
            drop(migrator); // crash

            let outcome = Migrator::new(&config).run_at_boot().unwrap();
            assert!(
                matches!(outcome, BootOutcome::Failed { .. }),
                "halt_after={halt_after}"
            );

            // Wholly the old set, regardless of where the crash landed
            for (path, content) in OLD_FILES {
                assert_eq!(read_active(&config, path), *content, "halt_after={halt_after}");
            }
            assert!(!config.active_dir.join("lib/pin_detect.py").exists());
            assert_eq!(ActiveFirmware::new(&config.active_dir).version(), "3.0");
            assert!(!config.staging_dir.exists());
        }
    }

    #[test]
    fn test_missing_backup_for_active_file_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        install_active(&config, &manifest_for("3.0", OLD_FILES), OLD_FILES);
        let mut record = stage_verified(&config, &manifest_for("3.1", NEW_FILES), NEW_FILES);

        let migrator = Migrator::new(&config);
        migrator.back_up_active(&record).unwrap();
        record.status = StagingStatus::Promoting;
        record.save(&config.staging_dir).unwrap();
        for (path, entry) in record.entries.iter().take(2) {
            migrator.swap_one(path, entry).unwrap();
        }
        // The backup medium lost a file that existed in the old set
        fs::remove_file(config.staging_dir.join("backup/code.py")).unwrap();

        let err = Migrator::new(&config).run_at_boot().unwrap_err();
        assert!(matches!(err, UpdaterError::Rollback(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_user_settings_survive_update() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());

        let old_config = br##"{"led_color": "#ff00aa", "whammy_min": 412, "hat_mode": "dpad", "poll_hz": 100}"##;
        let new_config =
            br##"{"led_color": "#00ff00", "whammy_min": 0, "hat_mode": "joystick", "poll_hz": 250, "joystick_deadzone": 8}"##;

        let old_files: &[(&str, &[u8])] = &[("code.py", b"code v3.0"), ("config.json", old_config)];
        let new_files: &[(&str, &[u8])] = &[("code.py", b"code v3.1"), ("config.json", new_config)];

        install_active(&config, &manifest_for("3.0", old_files), old_files);
        stage_verified(&config, &manifest_for("3.1", new_files), new_files);

        let outcome = Migrator::new(&config).run_at_boot().unwrap();
        assert!(matches!(outcome, BootOutcome::Complete { .. }));

        let merged: serde_json::Value =
            serde_json::from_slice(&read_active(&config, "config.json")).unwrap();
        // User-tuned keys kept
        assert_eq!(merged["led_color"], "#ff00aa");
        assert_eq!(merged["whammy_min"], 412);
        assert_eq!(merged["hat_mode"], "dpad");
        // Non-preserved and newly introduced keys come from the update
        assert_eq!(merged["poll_hz"], 250);
        assert_eq!(merged["joystick_deadzone"], 8);
    }
}
