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

//! Active firmware set and its manifest snapshot

use crate::error::Result;
use crate::manifest::{MANIFEST_FILE, VersionManifest};
use std::fs;
use std::path::{Path, PathBuf};

/// Version reported when no snapshot exists yet (factory state)
pub const FACTORY_VERSION: &str = "0.0.0";

/// The currently booted firmware file set plus its manifest snapshot.
///
/// Read-only to every component except the boot-time migrator, which is the
/// sole writer during promotion.
#[derive(Debug, Clone)]
pub struct ActiveFirmware {
    dir: PathBuf,
}

impl ActiveFirmware {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }

    /// The manifest snapshot describing the active file set, if any
    pub fn manifest(&self) -> Result<Option<VersionManifest>> {
        let path = self.dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        Ok(Some(VersionManifest::parse(&raw)?))
    }

    /// Version of the active set; an absent or unreadable snapshot counts as
    /// factory state so an update is always considered available.
    pub fn version(&self) -> String {
        match self.manifest() {
            Ok(Some(manifest)) => manifest.version,
            Ok(None) => FACTORY_VERSION.to_string(),
            Err(e) => {
                tracing::warn!("Unreadable active manifest, assuming factory state: {e}");
                FACTORY_VERSION.to_string()
            }
        }
    }

    /// Atomically replace the manifest snapshot. Called by the migrator only,
    /// after every file of the new set is in place.
    pub(crate) fn write_snapshot(&self, manifest: &VersionManifest) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(MANIFEST_FILE);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(manifest)?)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::manifest::FileEntry;

    fn sample_manifest(version: &str) -> VersionManifest {
        VersionManifest {
            version: version.to_string(),
            generated_at: Utc::now(),
            files: vec![FileEntry {
                path: "code.py".to_string(),
                size: 3,
                checksum: crate::checksum::digest_bytes(b"abc"),
            }],
        }
    }

    #[test]
    fn test_factory_state_without_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let active = ActiveFirmware::new(dir.path());
        assert!(active.manifest().unwrap().is_none());
        assert_eq!(active.version(), FACTORY_VERSION);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let active = ActiveFirmware::new(dir.path());

        active.write_snapshot(&sample_manifest("3.1")).unwrap();
        assert_eq!(active.version(), "3.1");

        let manifest = active.manifest().unwrap().unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert!(!dir.path().join("manifest.tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_reads_as_factory() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{ truncated").unwrap();

        let active = ActiveFirmware::new(dir.path());
        assert_eq!(active.version(), FACTORY_VERSION);
    }
}
