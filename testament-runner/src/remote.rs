// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running tests on a remote executor.

use crate::{errors::RunError, target::BuildTarget};

/// Process-level output of a remote test.
#[derive(Clone, Debug, Default)]
pub struct RemoteTestMetadata {
    /// Captured standard output.
    pub stdout: Vec<u8>,

    /// Captured standard error.
    pub stderr: Vec<u8>,
}

/// Everything a remote executor sends back for one attempt.
#[derive(Debug, Default)]
pub struct RemoteTestOutput {
    /// Process output.
    pub metadata: RemoteTestMetadata,

    /// The contents of each results file the test wrote. Empty if it wrote none.
    pub results: Vec<Vec<u8>>,

    /// The contents of the coverage file, if any.
    pub coverage: Vec<u8>,

    /// Why the attempt failed at the process level, if it did.
    pub error: Option<RunError>,
}

/// Runs tests remotely.
///
/// Remote executors address their own caches, so remote tests are never looked up in or stored
/// to the local cache.
pub trait RemoteClient: Send + Sync {
    /// Runs one attempt of `target`'s tests for the given run. `tid` identifies the calling
    /// thread, for executors that pin work to connections.
    fn test(&self, tid: usize, target: &BuildTarget, run: u32) -> RemoteTestOutput;
}
