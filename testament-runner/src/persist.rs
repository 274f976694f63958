// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Moving test outputs to their permanent location, and tagging them with the fingerprint they
//! were produced under.
//!
//! Tags are stored in the `user.testament_test` extended attribute. Where extended attributes are
//! disabled or unsupported, a hidden sidecar file next to the output holds the tag instead.

use crate::{
    errors::PersistError,
    fingerprint::CacheKey,
    helpers::{copy_path, remove_path},
    layout::RepoLayout,
    target::BuildTarget,
};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs,
    io::{self, Write},
};
use tracing::debug;

/// Written in place of a results file for tests that don't produce one.
pub const DUMMY_RESULTS: &[u8] = b"=== RUN DummyTest\n--- PASS: DummyTest (0.00s)\nPASS\n";

/// Written in place of a coverage file for tests that don't produce one.
pub const DUMMY_COVERAGE: &[u8] = b"<?xml version=\"1.0\" ?><coverage></coverage>";

/// The extended attribute fingerprints are stored in.
pub const FINGERPRINT_XATTR: &str = "user.testament_test";

/// Places test outputs and manages their fingerprint tags.
#[derive(Clone, Debug)]
pub struct Persister {
    use_xattrs: bool,
}

impl Persister {
    /// Creates a new persister. If `use_xattrs` is false, tags always go to sidecar files.
    pub fn new(use_xattrs: bool) -> Self {
        Self { use_xattrs }
    }

    /// Moves an output from its run directory to its permanent location and tags it with `key`.
    ///
    /// If `from` doesn't exist, `dummy` is written in its place. Without a dummy, a missing output
    /// is skipped. Returns true if anything was placed at `to`.
    pub fn move_output_file(
        &self,
        key: &CacheKey,
        from: &Utf8Path,
        to: &Utf8Path,
        dummy: Option<&[u8]>,
    ) -> Result<bool, PersistError> {
        if fs::symlink_metadata(from).is_err() {
            let Some(dummy) = dummy else {
                debug!("output `{from}` not produced, skipping");
                return Ok(false);
            };
            write_atomic(to, dummy).map_err(|error| PersistError::WriteDummy {
                path: to.to_owned(),
                error,
            })?;
        } else {
            move_path(from, to).map_err(|error| PersistError::Move {
                from: from.to_owned(),
                to: to.to_owned(),
                error,
            })?;
        }
        self.record_attr(to, key)?;
        Ok(true)
    }

    /// Tags `path` with `key`.
    pub fn record_attr(&self, path: &Utf8Path, key: &CacheKey) -> Result<(), PersistError> {
        if self.use_xattrs {
            match set_xattr(path, key.as_bytes()) {
                Ok(()) => {
                    // Drop any stale sidecar tag.
                    let _ = remove_path(&sidecar_path(path));
                    return Ok(());
                }
                Err(error) => debug!("extended attributes unavailable for `{path}`: {error}"),
            }
        }
        write_atomic(&sidecar_path(path), key.to_hex().as_bytes()).map_err(|error| {
            PersistError::RecordAttr {
                path: path.to_owned(),
                error,
            }
        })
    }

    /// Returns true if `path` exists and is tagged with `key`.
    pub fn verify_attr(&self, path: &Utf8Path, key: &CacheKey) -> bool {
        if fs::symlink_metadata(path).is_err() {
            return false;
        }
        if self.use_xattrs
            && let Ok(Some(value)) = get_xattr(path)
        {
            return value == key.as_bytes();
        }
        match fs::read_to_string(sidecar_path(path)) {
            Ok(hex) => hex.trim() == key.to_hex(),
            Err(_) => false,
        }
    }

    /// Removes the permanent outputs of a run: results, coverage and declared test outputs.
    pub fn remove_test_outputs(
        &self,
        layout: &RepoLayout,
        target: &BuildTarget,
        run: u32,
    ) -> Result<(), PersistError> {
        let label = &target.label;
        let out_dir = layout.out_dir(label);
        let mut paths = vec![
            layout.test_results_file(label, run),
            layout.coverage_file(label, run),
        ];
        paths.extend(target.test.outputs.iter().map(|output| out_dir.join(output)));

        for path in paths {
            for path in [sidecar_path(&path), path] {
                remove_path(&path).map_err(|error| PersistError::Remove { path, error })?;
            }
        }
        Ok(())
    }
}

fn sidecar_path(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or(path.as_str());
    path.with_file_name(format!(".{name}.testament_hash"))
}

fn write_atomic(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
        .write(|file| file.write_all(contents))
        .map_err(|error| match error {
            atomicwrites::Error::Internal(error) | atomicwrites::Error::User(error) => error,
        })
}

// Renames, falling back to a copy when the two paths are on different filesystems.
fn move_path(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    remove_path(to)?;
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(error) => {
            debug!("rename of `{from}` failed ({error}), copying instead");
            copy_path(from, to)?;
            remove_path(from)
        }
    }
}

#[cfg(unix)]
fn set_xattr(path: &Utf8Path, value: &[u8]) -> io::Result<()> {
    xattr::set(path, FINGERPRINT_XATTR, value)
}

#[cfg(unix)]
fn get_xattr(path: &Utf8Path) -> io::Result<Option<Vec<u8>>> {
    xattr::get(path, FINGERPRINT_XATTR)
}

#[cfg(not(unix))]
fn set_xattr(_path: &Utf8Path, _value: &[u8]) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(unix))]
fn get_xattr(_path: &Utf8Path) -> io::Result<Option<Vec<u8>>> {
    Ok(None)
}
