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

//! Version manifest model with strict, fail-closed parsing

use crate::checksum;
use crate::error::{Result, UpdaterError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Name of the manifest document, both in the remote repository and as the
/// snapshot kept alongside the active firmware set. Reserved: a manifest may
/// not list a file under this name.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One file of a firmware version: relative destination path, expected byte
/// length, and SHA-256 content digest. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VersionManifest {
    pub version: String,
    /// Informational only; ordering between manifests is decided solely by
    /// `version`.
    pub generated_at: DateTime<Utc>,
    pub files: Vec<FileEntry>,
}

impl VersionManifest {
    /// Parse and validate a raw manifest document. Pure, no side effects;
    /// rejects any unexpected shape rather than accepting partial data.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut manifest: Self = serde_json::from_slice(raw)
            .map_err(|e| UpdaterError::Parse(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        for entry in &mut manifest.files {
            entry.checksum = entry.checksum.to_lowercase();
        }
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        crate::version::parse_version(&self.version)?;

        if self.files.is_empty() {
            return Err(UpdaterError::Parse("manifest lists no files".to_string()));
        }

        let mut seen = BTreeSet::new();
        for entry in &self.files {
            validate_entry_path(&entry.path)?;
            if !seen.insert(entry.path.as_str()) {
                return Err(UpdaterError::Parse(format!(
                    "duplicate file path {:?}",
                    entry.path
                )));
            }
            if entry.size == 0 {
                return Err(UpdaterError::Parse(format!(
                    "zero size for {:?}",
                    entry.path
                )));
            }
            if !checksum::is_hex_digest(&entry.checksum) {
                return Err(UpdaterError::Parse(format!(
                    "checksum for {:?} is not a {}-char hex digest",
                    entry.path,
                    checksum::DIGEST_HEX_LEN
                )));
            }
        }
        Ok(())
    }

    pub fn file_for(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|entry| entry.path == path)
    }
}

/// Destination paths are relative and must stay inside the active area.
fn validate_entry_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(UpdaterError::Parse("empty file path".to_string()));
    }
    if path == MANIFEST_FILE {
        return Err(UpdaterError::Parse(format!(
            "{MANIFEST_FILE:?} is a reserved path"
        )));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(UpdaterError::Parse(format!(
            "path {path:?} must be relative"
        )));
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(UpdaterError::Parse(format!(
                "path {path:?} escapes the firmware area"
            )));
        }
    }
    Ok(())
}
