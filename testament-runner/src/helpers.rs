// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for testament-runner.

use camino::Utf8Path;
use std::{fs, io};
use walkdir::WalkDir;

/// Utilities for pluralizing various words based on count.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "file" if `count` is 1, otherwise "files".
    pub fn files_str(count: usize) -> &'static str {
        if count == 1 { "file" } else { "files" }
    }
}

/// Copies a file, symlink or directory tree from `from` to `to`, replacing whatever is at `to`.
///
/// Symlinks are copied as symlinks, not followed.
pub(crate) fn copy_path(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    remove_path(to)?;
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let dest = if rel.as_os_str().is_empty() {
            to.as_std_path().to_owned()
        } else {
            to.as_std_path().join(rel)
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            symlink(&fs::read_link(entry.path())?, &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Removes a file, symlink or directory tree. A missing path is not an error.
pub(crate) fn remove_path(path: &Utf8Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(unix)]
pub(crate) fn symlink(target: &std::path::Path, dest: &std::path::Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
pub(crate) fn symlink(target: &std::path::Path, dest: &std::path::Path) -> io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, dest)
    } else {
        std::os::windows::fs::symlink_file(target, dest)
    }
}
