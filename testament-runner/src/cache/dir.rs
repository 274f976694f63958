// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Cache;
use crate::{
    errors::DirCacheError,
    fingerprint::CacheKey,
    helpers::{copy_path, remove_path},
    label::BuildLabel,
    layout::RepoLayout,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs,
    sync::atomic::{AtomicUsize, Ordering},
};
use tracing::{debug, warn};

/// A cache in a local directory.
///
/// Each bundle lives at `<root>/<package>/<name>/<hex key>/`. Bundles are staged in a sibling
/// directory and renamed into place, so a bundle is either complete or absent.
#[derive(Debug)]
pub struct DirCache {
    layout: RepoLayout,
    root: Utf8PathBuf,
    writable: bool,
    staging_counter: AtomicUsize,
}

impl DirCache {
    /// Creates a new directory cache rooted at `root`.
    pub fn new(layout: RepoLayout, root: impl Into<Utf8PathBuf>, writable: bool) -> Self {
        Self {
            layout,
            root: root.into(),
            writable,
            staging_counter: AtomicUsize::new(0),
        }
    }

    fn target_dir(&self, target: &BuildLabel) -> Utf8PathBuf {
        let mut dir = self.root.clone();
        if !target.package_name.is_empty() {
            dir.push(&target.package_name);
        }
        dir.push(&target.name);
        dir
    }

    fn entry_dir(&self, target: &BuildLabel, key: &CacheKey) -> Utf8PathBuf {
        self.target_dir(target).join(key.to_hex())
    }

    /// Stores files, returning an error if anything goes wrong.
    pub fn try_store(
        &self,
        target: &BuildLabel,
        key: &CacheKey,
        files: &[String],
    ) -> Result<(), DirCacheError> {
        let entry_dir = self.entry_dir(target, key);
        let staging_dir = entry_dir.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            self.staging_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let out_dir = self.layout.out_dir(target);

        fs::create_dir_all(&staging_dir)
            .map_err(|error| DirCacheError::new("error creating", &staging_dir, error))?;
        let result = (|| {
            for file in files {
                let from = out_dir.join(file);
                copy_path(&from, &staging_dir.join(file))
                    .map_err(|error| DirCacheError::new("error copying", &from, error))?;
            }
            remove_path(&entry_dir)
                .map_err(|error| DirCacheError::new("error replacing", &entry_dir, error))?;
            fs::rename(&staging_dir, &entry_dir)
                .map_err(|error| DirCacheError::new("error renaming into", &entry_dir, error))
        })();
        if result.is_err() {
            // Don't leave half-written bundles behind.
            let _ = remove_path(&staging_dir);
        }
        result
    }

    /// Retrieves a bundle, returning an error if anything goes wrong.
    ///
    /// `files` must all be present in the bundle for it to count as a hit; a missing bundle or
    /// file is `Ok(false)`. On a hit the whole bundle is restored, including files that weren't
    /// asked for.
    pub fn try_retrieve(
        &self,
        target: &BuildLabel,
        key: &CacheKey,
        files: &[String],
    ) -> Result<bool, DirCacheError> {
        let entry_dir = self.entry_dir(target, key);
        if !files.iter().all(|file| exists(&entry_dir.join(file))) {
            return Ok(false);
        }
        let read_err = |error| DirCacheError::new("error reading", &entry_dir, error);
        let out_dir = self.layout.out_dir(target);
        for entry in entry_dir.read_dir_utf8().map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            copy_path(entry.path(), &out_dir.join(entry.file_name()))
                .map_err(|error| DirCacheError::new("error copying", entry.path(), error))?;
        }
        Ok(true)
    }
}

fn exists(path: &Utf8Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

impl Cache for DirCache {
    fn store(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) {
        if !self.writable {
            return;
        }
        match self.try_store(target, key, files) {
            Ok(()) => debug!("{target}: stored {} in directory cache", key),
            Err(error) => warn!("{target}: failed to store outputs in directory cache: {error}"),
        }
    }

    fn retrieve(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) -> bool {
        match self.try_retrieve(target, key, files) {
            Ok(hit) => hit,
            Err(error) => {
                warn!("{target}: failed to retrieve outputs from directory cache: {error}");
                false
            }
        }
    }

    fn clean(&self, target: &BuildLabel) {
        let dir = self.target_dir(target);
        if let Err(error) = remove_path(&dir) {
            warn!("{target}: failed to clean directory cache at `{dir}`: {error}");
        }
    }

    fn clean_all(&self) {
        if let Err(error) = remove_path(&self.root) {
            warn!("failed to clean directory cache at `{}`: {error}", self.root);
        }
    }

    fn shutdown(&self) {}
}
