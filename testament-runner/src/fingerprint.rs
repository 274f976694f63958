// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime fingerprints of test invocations.
//!
//! A fingerprint covers everything that can change what a test does: the command it runs, its
//! declared environment, the contents of its inputs, and how this particular run is configured.
//! Modification times, ownership and the host environment are deliberately left out so that
//! identical inputs produce identical fingerprints on any machine.

use crate::{errors::FingerprintError, layout::RepoLayout, target::BuildTarget};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::{fmt, fs, io};
use walkdir::WalkDir;

const DIGEST_LEN: usize = 32;

/// The four component digests of a runtime fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeHash {
    /// The test command and any extra arguments.
    pub command: [u8; DIGEST_LEN],

    /// The target's declared environment.
    pub env: [u8; DIGEST_LEN],

    /// The contents of build outputs and runtime data.
    pub inputs: [u8; DIGEST_LEN],

    /// Run index, flakiness, declared outputs and coverage.
    pub run_config: [u8; DIGEST_LEN],
}

impl RuntimeHash {
    /// Folds the components into a single key by XOR-ing them together.
    pub fn collapse(&self) -> CacheKey {
        let mut out = [0u8; DIGEST_LEN];
        for component in [&self.command, &self.env, &self.inputs, &self.run_config] {
            for (o, b) in out.iter_mut().zip(component) {
                *o ^= b;
            }
        }
        CacheKey::new(out.to_vec())
    }
}

/// The key test outputs are stored under.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct CacheKey {
    bytes: Vec<u8>,
}

impl CacheKey {
    /// Creates a key from raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The empty key used for remote execution, where the remote side handles addressing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true for the empty key.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The raw bytes of the key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The lowercase hex form of the key.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// What a single run of a target looks like, for fingerprinting.
#[derive(Clone, Debug)]
pub struct RunSpec<'a> {
    /// The run index, starting at 1.
    pub run: u32,

    /// Extra arguments passed to the test.
    pub test_args: &'a [String],

    /// Whether coverage is collected.
    pub coverage: bool,
}

/// Computes the runtime fingerprint of a run of `target`.
pub fn runtime_hash(
    layout: &RepoLayout,
    target: &BuildTarget,
    spec: &RunSpec<'_>,
) -> Result<RuntimeHash, FingerprintError> {
    let test = &target.test;

    let mut command = Sha256::new();
    write_field(&mut command, test.command.as_bytes());
    for arg in spec.test_args {
        write_field(&mut command, arg.as_bytes());
    }

    // The map is already sorted by key.
    let mut env = Sha256::new();
    for (key, value) in &test.env {
        write_field(&mut env, key.as_bytes());
        write_field(&mut env, value.as_bytes());
    }

    let mut inputs = Sha256::new();
    let mut input_paths: Vec<&Utf8Path> = target
        .outputs
        .iter()
        .chain(&test.data)
        .map(Utf8PathBuf::as_path)
        .collect();
    input_paths.sort();
    input_paths.dedup();
    for path in input_paths {
        hash_input(&mut inputs, layout.root(), path)?;
    }

    let mut run_config = Sha256::new();
    write_field(&mut run_config, target.label.to_string().as_bytes());
    write_field(&mut run_config, &spec.run.to_le_bytes());
    write_field(&mut run_config, &test.max_attempts().to_le_bytes());
    write_field(&mut run_config, &[u8::from(test.no_test_output)]);
    write_field(&mut run_config, &[u8::from(spec.coverage)]);
    for output in &test.outputs {
        write_field(&mut run_config, output.as_bytes());
    }

    Ok(RuntimeHash {
        command: command.finalize().into(),
        env: env.finalize().into(),
        inputs: inputs.finalize().into(),
        run_config: run_config.finalize().into(),
    })
}

// Length-prefix every field so that adjacent fields can't run into each other.
fn write_field(hasher: &mut Sha256, data: &[u8]) {
    hasher.update((data.len() as u64).to_le_bytes());
    hasher.update(data);
}

fn hash_input(hasher: &mut Sha256, root: &Utf8Path, rel_path: &Utf8Path) -> Result<(), FingerprintError> {
    let abs_path = root.join(rel_path);
    for entry in WalkDir::new(&abs_path).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|error| FingerprintError::WalkInput {
            path: abs_path.clone(),
            error,
        })?;
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| FingerprintError::NonUtf8Path(entry.path().to_owned()))?;
        let rel = path.strip_prefix(root).unwrap_or(path);
        write_field(hasher, rel.as_str().as_bytes());

        let read_err = |error| FingerprintError::ReadInput {
            path: path.to_owned(),
            error,
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let link = fs::read_link(path).map_err(read_err)?;
            write_field(hasher, b"l");
            write_field(hasher, link.as_os_str().as_encoded_bytes());
        } else if file_type.is_dir() {
            write_field(hasher, b"d");
        } else {
            let metadata = entry.metadata().map_err(|error| FingerprintError::WalkInput {
                path: path.to_owned(),
                error,
            })?;
            write_field(hasher, b"f");
            write_field(hasher, &[u8::from(is_executable(&metadata))]);
            let mut file = fs::File::open(path).map_err(read_err)?;
            hasher.update(metadata.len().to_le_bytes());
            io::copy(&mut file, hasher).map_err(read_err)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}
