// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::PrepareTestDirError,
    helpers::{remove_path, symlink},
    layout::RepoLayout,
    target::BuildTarget,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{fs, io};

/// Wipes and recreates the run directory of `target`, then links its runtime files into it.
///
/// Build outputs are linked by file name. Runtime data keeps its path relative to the repository
/// root.
pub(crate) fn prepare_test_dir(
    layout: &RepoLayout,
    target: &BuildTarget,
    run: u32,
) -> Result<Utf8PathBuf, PrepareTestDirError> {
    let test_dir = layout.test_dir(&target.label, run);
    remove_path(&test_dir).map_err(|error| PrepareTestDirError::Remove {
        path: test_dir.clone(),
        error,
    })?;
    fs::create_dir_all(&test_dir).map_err(|error| PrepareTestDirError::Create {
        path: test_dir.clone(),
        error,
    })?;

    let outputs = target
        .outputs
        .iter()
        .filter_map(|output| Some((output, Utf8PathBuf::from(output.file_name()?))));
    let data = target.test.data.iter().map(|data| (data, data.clone()));

    for (from, rel) in outputs.chain(data) {
        let from = layout.root().join(from);
        let to = test_dir.join(rel);
        link(&from, &to).map_err(|error| PrepareTestDirError::Link { from, to, error })?;
    }
    Ok(test_dir)
}

fn link(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_path(to)?;
    symlink(from.as_std_path(), to.as_std_path())
}
