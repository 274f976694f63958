// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    Cache,
    archive::{extract_archive, write_archive},
};
use crate::{
    errors::HttpCacheError, fingerprint::CacheKey, label::BuildLabel, layout::RepoLayout,
};
use camino::Utf8PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use ureq::Agent;

/// A cache on a remote HTTP server.
///
/// Bundles are gzip-compressed tarballs stored with `PUT <url>/<hex key>` and retrieved with
/// `GET <url>/<hex key>`. Archive entries are named relative to the repository root.
///
/// The server is addressed purely by content, so there is no way to invalidate a single target:
/// [`Cache::clean`] and [`Cache::clean_all`] do nothing.
#[derive(Debug)]
pub struct HttpCache {
    layout: RepoLayout,
    url: String,
    writable: bool,
    agent: Agent,
}

impl HttpCache {
    /// Creates a new HTTP cache with the given base URL.
    pub fn new(layout: RepoLayout, url: &str, writable: bool, timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            layout,
            url: url.trim_end_matches('/').to_owned(),
            writable,
            agent,
        }
    }

    fn key_url(&self, key: &CacheKey) -> String {
        format!("{}/{}", self.url, key.to_hex())
    }

    fn paths(&self, target: &BuildLabel, files: &[String]) -> Vec<Utf8PathBuf> {
        let out_dir = self.layout.out_dir_rel(target);
        files.iter().map(|file| out_dir.join(file)).collect()
    }

    /// Uploads files, returning an error if anything goes wrong.
    pub fn try_store(
        &self,
        target: &BuildLabel,
        key: &CacheKey,
        files: &[String],
    ) -> Result<(), HttpCacheError> {
        let body = write_archive(self.layout.root(), &self.paths(target, files), Vec::new())?;
        let url = self.key_url(key);
        let mut response = self
            .agent
            .put(&url)
            .header("Content-Type", "application/gzip")
            .send(&body[..])
            .map_err(|error| HttpCacheError::Request {
                url: url.clone(),
                error: Box::new(error),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(HttpCacheError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Downloads and extracts files. A 404 is `Ok(false)`; any other unsuccessful status is an
    /// error carrying the response body.
    pub fn try_retrieve(&self, key: &CacheKey) -> Result<bool, HttpCacheError> {
        let url = self.key_url(key);
        let mut response = self
            .agent
            .get(&url)
            .call()
            .map_err(|error| HttpCacheError::Request {
                url: url.clone(),
                error: Box::new(error),
            })?;

        let status = response.status();
        if status == http::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(HttpCacheError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        extract_archive(self.layout.root(), response.body_mut().as_reader())?;
        Ok(true)
    }
}

impl Cache for HttpCache {
    fn store(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) {
        if !self.writable {
            return;
        }
        match self.try_store(target, key, files) {
            Ok(()) => debug!("{target}: stored {key} in HTTP cache"),
            Err(error) => warn!("{target}: failed to store outputs in HTTP cache: {error}"),
        }
    }

    fn retrieve(&self, target: &BuildLabel, key: &CacheKey, _files: &[String]) -> bool {
        match self.try_retrieve(key) {
            Ok(true) => {
                debug!("{target}: retrieved {key} from HTTP cache");
                true
            }
            Ok(false) => false,
            Err(error) => {
                warn!("{target}: failed to retrieve outputs from HTTP cache: {error}");
                false
            }
        }
    }

    fn clean(&self, _target: &BuildLabel) {}

    fn clean_all(&self) {}

    fn shutdown(&self) {}
}
