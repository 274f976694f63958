// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Caches for test outputs.
//!
//! A cache maps a [`CacheKey`] to a bundle of files from a target's output directory. Every
//! operation is best-effort: failures are logged and a failed retrieval is a miss.

pub mod archive;
mod background;
mod dir;
mod http;
mod multi;

pub use background::AsyncCache;
pub use dir::DirCache;
pub use self::http::HttpCache;
pub use multi::MultiCache;

use crate::{
    config::TestamentConfig, fingerprint::CacheKey, label::BuildLabel, layout::RepoLayout,
};
use std::sync::Arc;

/// A store of test outputs keyed by fingerprint.
///
/// File names are relative to the target's output directory.
pub trait Cache: Send + Sync {
    /// Stores the named files under `key`. A no-op if the cache isn't writable.
    fn store(&self, target: &BuildLabel, key: &CacheKey, files: &[String]);

    /// Retrieves the files stored under `key` into the target's output directory. Returns true on
    /// a hit.
    fn retrieve(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) -> bool;

    /// Invalidates everything stored for a target, where the backend is able to.
    fn clean(&self, target: &BuildLabel);

    /// Invalidates everything, where the backend is able to.
    fn clean_all(&self);

    /// Waits for outstanding work and releases resources. Safe to call more than once.
    fn shutdown(&self);
}

impl<T: Cache + ?Sized> Cache for Arc<T> {
    fn store(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) {
        (**self).store(target, key, files)
    }

    fn retrieve(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) -> bool {
        (**self).retrieve(target, key, files)
    }

    fn clean(&self, target: &BuildLabel) {
        (**self).clean(target)
    }

    fn clean_all(&self) {
        (**self).clean_all()
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

/// Assembles the caches configured in `config`.
///
/// The directory cache comes before the HTTP cache so that hits from the network are kept
/// locally. Stores happen in the background. Returns `None` if no cache is configured.
pub fn new_cache(config: &TestamentConfig, layout: &RepoLayout) -> Option<Arc<dyn Cache>> {
    let cache_config = config.cache();
    let mut tiers: Vec<Box<dyn Cache>> = vec![];

    if let Some(root) = config.dir_cache_root() {
        tiers.push(Box::new(DirCache::new(
            layout.clone(),
            root,
            cache_config.dir_writable,
        )));
    }
    if !cache_config.http_url.is_empty() {
        tiers.push(Box::new(HttpCache::new(
            layout.clone(),
            &cache_config.http_url,
            cache_config.http_writable,
            cache_config.http_timeout,
        )));
    }

    let inner: Box<dyn Cache> = match tiers.len() {
        0 => return None,
        1 => tiers.pop()?,
        _ => Box::new(MultiCache::new(tiers)),
    };
    Some(Arc::new(AsyncCache::new(inner, cache_config.store_workers)))
}
