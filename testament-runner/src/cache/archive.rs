// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reproducible gzip-compressed tarballs of test outputs.
//!
//! Every header written here has its modification time and ownership pinned, so archiving the
//! same tree on two machines produces the same bytes.

use crate::errors::{ArchiveCreateError, ArchiveExtractError};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::{
    fs,
    io::{self, Read, Write},
};
use tracing::warn;
use walkdir::WalkDir;

/// The modification time of every entry: 2000-01-01T00:00:00Z.
pub const ARCHIVE_MTIME: u64 = 946_684_800;

/// The uid and gid of every entry.
pub const ARCHIVE_OWNER_ID: u64 = 65534;

/// The user and group name of every entry.
pub const ARCHIVE_OWNER_NAME: &str = "nobody";

/// Writes `paths` (files, symlinks or directories, which are recursed into) to `writer` as a
/// gzip-compressed tarball, naming entries relative to `root`.
///
/// Returns the writer once the gzip stream is finished.
pub fn write_archive<W: Write>(
    root: &Utf8Path,
    paths: &[Utf8PathBuf],
    writer: W,
) -> Result<W, ArchiveCreateError> {
    let mut paths: Vec<&Utf8PathBuf> = paths.iter().collect();
    paths.sort();
    paths.dedup();

    let mut archiver = Archiver {
        root,
        builder: tar::Builder::new(GzEncoder::new(writer, Compression::default())),
    };
    for path in paths {
        archiver.append_tree(path)?;
    }

    let encoder = archiver
        .builder
        .into_inner()
        .map_err(ArchiveCreateError::OutputIo)?;
    encoder.finish().map_err(ArchiveCreateError::OutputIo)
}

struct Archiver<'a, W: Write> {
    root: &'a Utf8Path,
    builder: tar::Builder<GzEncoder<W>>,
}

impl<W: Write> Archiver<'_, W> {
    fn append_tree(&mut self, path: &Utf8Path) -> Result<(), ArchiveCreateError> {
        let abs_path = self.root.join(path);
        for entry in WalkDir::new(&abs_path).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|error| ArchiveCreateError::WalkInput {
                path: abs_path.clone(),
                error,
            })?;
            let src = Utf8Path::from_path(entry.path()).ok_or_else(|| {
                ArchiveCreateError::InputFileRead {
                    path: abs_path.clone(),
                    error: io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8"),
                }
            })?;
            let rel_path = src
                .strip_prefix(self.root)
                .map_err(|_| ArchiveCreateError::OutsideRoot {
                    path: src.to_owned(),
                    root: self.root.to_owned(),
                })?;
            self.append_entry(src, rel_path)?;
        }
        Ok(())
    }

    fn append_entry(&mut self, src: &Utf8Path, rel_path: &Utf8Path) -> Result<(), ArchiveCreateError> {
        let read_err = |error| ArchiveCreateError::InputFileRead {
            path: src.to_owned(),
            error,
        };
        let metadata = fs::symlink_metadata(src).map_err(read_err)?;
        let file_type = metadata.file_type();
        let mut header = pinned_header(&metadata).map_err(read_err)?;

        let result = if file_type.is_symlink() {
            let target = fs::read_link(src).map_err(read_err)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            self.builder.append_link(&mut header, rel_path, target)
        } else if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            self.builder.append_data(&mut header, rel_path, io::empty())
        } else {
            let file = fs::File::open(src).map_err(read_err)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            self.builder.append_data(&mut header, rel_path, file)
        };
        result.map_err(ArchiveCreateError::OutputIo)
    }
}

fn pinned_header(metadata: &fs::Metadata) -> io::Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_mtime(ARCHIVE_MTIME);
    header.set_uid(ARCHIVE_OWNER_ID);
    header.set_gid(ARCHIVE_OWNER_ID);
    header.set_username(ARCHIVE_OWNER_NAME)?;
    header.set_groupname(ARCHIVE_OWNER_NAME)?;
    header.set_mode(entry_mode(metadata));
    Ok(header)
}

#[cfg(unix)]
fn entry_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() { 0o755 } else { 0o644 }
}

/// Extracts a gzip-compressed tarball into `root`.
///
/// Directories are created as needed and existing files are replaced. Entries of types other
/// than regular files, directories and symlinks are skipped with a warning. Returns the number of
/// entries extracted.
pub fn extract_archive<R: Read>(root: &Utf8Path, reader: R) -> Result<usize, ArchiveExtractError> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut count = 0;

    for entry in archive.entries().map_err(ArchiveExtractError::Read)? {
        let mut entry = entry.map_err(ArchiveExtractError::Read)?;
        let rel_path = entry_path(&entry)?;
        let dest = root.join(&rel_path);
        let write_err = |error| ArchiveExtractError::WriteFile {
            path: dest.clone(),
            error,
        };

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(write_err)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                prepare_dest(&dest).map_err(write_err)?;
                let mut file = fs::File::create(&dest).map_err(write_err)?;
                io::copy(&mut entry, &mut file).map_err(write_err)?;
                let mode = entry.header().mode().map_err(ArchiveExtractError::Read)?;
                set_mode(&file, mode).map_err(write_err)?;
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(ArchiveExtractError::Read)?
                    .ok_or_else(|| {
                        ArchiveExtractError::Read(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("symlink `{rel_path}` has no target"),
                        ))
                    })?
                    .into_owned();
                prepare_dest(&dest).map_err(write_err)?;
                make_symlink(&target, &dest).map_err(write_err)?;
            }
            other => {
                warn!("skipping archive entry `{rel_path}` of unsupported type {other:?}");
                continue;
            }
        }
        count += 1;
    }

    Ok(count)
}

fn entry_path<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Utf8PathBuf, ArchiveExtractError> {
    let path_bytes = entry.path_bytes();
    let path_str = std::str::from_utf8(&path_bytes)
        .map_err(|_| ArchiveExtractError::NonUtf8Path(path_bytes.to_vec()))?;
    let path = Utf8PathBuf::from(path_str);
    for component in path.components() {
        match component {
            Utf8Component::Normal(_) => {}
            other => {
                return Err(ArchiveExtractError::InvalidComponent {
                    path: path.clone(),
                    component: other.as_str().to_owned(),
                });
            }
        }
    }
    Ok(path)
}

// Creates the parent directory and clears out whatever was at `dest` before.
fn prepare_dest(dest: &Utf8Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(dest) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(dest),
        Ok(_) => fs::remove_file(dest),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &std::path::Path, dest: &Utf8Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn make_symlink(target: &std::path::Path, dest: &Utf8Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot create symlink to `{}`", target.display()),
    ))
}
