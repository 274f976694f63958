// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for testament.
//!
//! The embedded default configuration is layered under a repository configuration file,
//! `.config/testament.toml` by default.

use crate::errors::{ConfigParseError, ConfigParseErrorKind};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

/// Overall configuration for testament.
#[derive(Clone, Debug)]
pub struct TestamentConfig {
    repo_root: Utf8PathBuf,
    cache: CacheConfig,
    test: TestConfig,
}

impl TestamentConfig {
    /// The default location of the config within the repository.
    pub const CONFIG_PATH: &'static str = ".config/testament.toml";

    /// The default config as a TOML file.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the config from the given file, or if not specified from `.config/testament.toml` in
    /// the repository root.
    ///
    /// An explicitly specified file must exist. The default location is optional.
    pub fn from_sources(
        repo_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let repo_root = repo_root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = repo_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let inner: TestamentConfigImpl = Self::make_default_config()
            .add_source(source)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|error| {
                ConfigParseError::new(&config_file, ConfigParseErrorKind::BuildError(Box::new(error)))
            })?;
        inner
            .validate()
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        Ok(Self {
            repo_root,
            cache: inner.cache,
            test: inner.test,
        })
    }

    /// Returns the default configuration, without reading any files.
    pub fn default_config(repo_root: impl Into<Utf8PathBuf>) -> Self {
        let inner: TestamentConfigImpl = Self::make_default_config()
            .build()
            .and_then(|config| config.try_deserialize())
            .unwrap_or_else(|error| panic!("default config is always valid: {error}"));
        Self {
            repo_root: repo_root.into(),
            cache: inner.cache,
            test: inner.test,
        }
    }

    fn make_default_config() -> config::ConfigBuilder<config::builder::DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// The repository root.
    pub fn repo_root(&self) -> &Utf8Path {
        &self.repo_root
    }

    /// Cache configuration.
    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    /// Test configuration.
    pub fn test(&self) -> &TestConfig {
        &self.test
    }

    /// Mutable access to cache configuration.
    pub fn cache_mut(&mut self) -> &mut CacheConfig {
        &mut self.cache
    }

    /// Mutable access to test configuration.
    pub fn test_mut(&mut self) -> &mut TestConfig {
        &mut self.test
    }

    /// The root of the directory cache, if one is configured.
    pub fn dir_cache_root(&self) -> Option<Utf8PathBuf> {
        if self.cache.dir.as_str().is_empty() {
            None
        } else {
            Some(self.repo_root.join(&self.cache.dir))
        }
    }
}

/// The `[cache]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CacheConfig {
    /// Root of the local directory cache. Empty means disabled.
    pub dir: Utf8PathBuf,

    /// Whether the directory cache is written to.
    pub dir_writable: bool,

    /// Base URL of the HTTP cache. Empty means disabled.
    pub http_url: String,

    /// Whether the HTTP cache is written to.
    pub http_writable: bool,

    /// Per-request timeout for the HTTP cache.
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,

    /// Number of background store threads.
    pub store_workers: usize,
}

/// The `[test]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TestConfig {
    /// Timeout for targets that don't set their own.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// `PATH` for test processes.
    pub path: String,

    /// Whether to tag outputs using extended attributes.
    pub xattrs: bool,

    /// Whether to remove run directories of passing tests.
    pub clean_workdirs: bool,

    /// URL to POST JUnit results to. Empty means disabled.
    pub upload: String,

    /// Timeout for result uploads.
    #[serde(with = "humantime_serde")]
    pub upload_timeout: Duration,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct TestamentConfigImpl {
    cache: CacheConfig,
    test: TestConfig,
}

impl TestamentConfigImpl {
    fn validate(&self) -> Result<(), ConfigParseErrorKind> {
        validate_url("cache.http-url", &self.cache.http_url)?;
        validate_url("test.upload", &self.test.upload)?;
        if self.cache.store_workers == 0 {
            return Err(ConfigParseErrorKind::ZeroValue {
                key: "cache.store-workers",
            });
        }
        Ok(())
    }
}

fn validate_url(key: &'static str, url: &str) -> Result<(), ConfigParseErrorKind> {
    if url.is_empty() {
        return Ok(());
    }
    match url.parse::<http::Uri>() {
        Ok(uri) if uri.scheme().is_some() && uri.authority().is_some() => Ok(()),
        Ok(_) => Err(ConfigParseErrorKind::InvalidUrl {
            key,
            url: url.to_owned(),
            error: None,
        }),
        Err(error) => Err(ConfigParseErrorKind::InvalidUrl {
            key,
            url: url.to_owned(),
            error: Some(error),
        }),
    }
}
