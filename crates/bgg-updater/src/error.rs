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

//! Error types for the updater crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("config error: {0}")]
    Config(String),

    #[error("manifest parse error: {0}")]
    Parse(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("staging already in progress for {current} (requested {requested})")]
    StagingInProgress { current: String, requested: String },

    #[error("incomplete staging: {missing} of {total} files unverified")]
    IncompleteStaging { missing: usize, total: usize },

    #[error("swap failed: {0}")]
    Swap(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UpdaterError {
    /// Short machine-readable kind, used by the companion status surface
    /// (`error:<kind>`).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Parse(_) => "parse",
            Self::InvalidVersion(_) => "invalid_version",
            Self::Transport(_) => "transport",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::StagingInProgress { .. } => "staging_in_progress",
            Self::IncompleteStaging { .. } => "incomplete_staging",
            Self::Swap(_) => "swap",
            Self::Rollback(_) => "rollback",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// True for the single condition that must halt normal boot: the active
    /// firmware set's integrity can no longer be guaranteed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rollback(_))
    }
}

pub type Result<T> = std::result::Result<T, UpdaterError>;
