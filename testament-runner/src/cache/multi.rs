// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Cache;
use crate::{fingerprint::CacheKey, label::BuildLabel};
use tracing::debug;

/// Several caches tried in order.
///
/// Stores go to every tier. A retrieval returns the first hit and copies what it found into the
/// tiers before it, so the next lookup is served from the fastest tier.
pub struct MultiCache {
    tiers: Vec<Box<dyn Cache>>,
}

impl MultiCache {
    /// Creates a new multi-tier cache, fastest tier first.
    pub fn new(tiers: Vec<Box<dyn Cache>>) -> Self {
        Self { tiers }
    }
}

impl Cache for MultiCache {
    fn store(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) {
        for tier in &self.tiers {
            tier.store(target, key, files);
        }
    }

    fn retrieve(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) -> bool {
        for (index, tier) in self.tiers.iter().enumerate() {
            if tier.retrieve(target, key, files) {
                if index > 0 {
                    debug!("{target}: backfilling {index} faster cache tier(s)");
                }
                for faster in &self.tiers[..index] {
                    faster.store(target, key, files);
                }
                return true;
            }
        }
        false
    }

    fn clean(&self, target: &BuildLabel) {
        for tier in &self.tiers {
            tier.clean(target);
        }
    }

    fn clean_all(&self) {
        for tier in &self.tiers {
            tier.clean_all();
        }
    }

    fn shutdown(&self) {
        for tier in &self.tiers {
            tier.shutdown();
        }
    }
}
