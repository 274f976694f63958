// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistent helper processes that some tests talk to.
//!
//! How workers are started and spoken to is up to the launcher; the runner only needs to know
//! whether the worker is up and whether it wants the test command changed.

use crate::{errors::WorkerStartError, target::BuildTarget};

/// What a launcher reports once a worker is running.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerResponse {
    /// If set, replaces the test command for this run.
    pub command: Option<String>,
}

/// Starts persistent workers.
pub trait WorkerLauncher: Send + Sync {
    /// Makes sure the worker for `worker_command` is running, starting it if necessary.
    ///
    /// Called before every run of a test that declares a worker. May be called concurrently for
    /// different targets sharing a worker.
    fn ensure_started(
        &self,
        worker_command: &str,
        test_command: &str,
        target: &BuildTarget,
    ) -> Result<WorkerResponse, WorkerStartError>;
}
