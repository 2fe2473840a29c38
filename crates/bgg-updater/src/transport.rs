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

//! File transport seam and the HTTPS implementation

use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

const USER_AGENT: &str = "bgg-updater/3.6";
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Capability to fetch a file from the remote firmware repository.
///
/// The updater core treats this as an opaque collaborator and never assumes
/// a specific protocol behind it.
#[async_trait]
pub trait FileTransport: Send + Sync {
    /// Fetch the full contents of `path`, relative to the repository root
    async fn fetch(&self, path: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| UpdaterError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FileTransport for HttpTransport {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UpdaterError::Transport(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdaterError::Transport(format!(
                "{url} returned status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpdaterError::Transport(format!("failed to read body: {e}")))?;

        Ok(bytes.to_vec())
    }
}

/// In-memory transport for tests and bench rigs
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), bytes.into());
    }
}

#[async_trait]
impl FileTransport for MemoryTransport {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| UpdaterError::Transport(format!("no such file: {path}")))
    }
}
