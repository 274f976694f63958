// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events emitted while targets are tested.
//!
//! The runner describes what it's doing through [`TestEvent`]s sent to a [`Reporter`]. Sending
//! events down a channel lets an outer scheduler render progress however it likes, while
//! [`LogReporter`] turns them into log lines.

use crate::label::BuildLabel;
use testament_results::{TestFailure, TestSuite};
use tracing::{error, info, warn};

/// The state of a target as seen by reporters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetStatus {
    /// The target is being tested.
    Testing,

    /// The target was prepared but deliberately not run.
    Stopped,

    /// All tests of the target succeeded.
    Tested,

    /// Some tests of the target failed or errored.
    TestFailed,
}

/// A test event.
#[derive(Clone, Debug)]
pub enum TestEvent {
    /// Testing of a target has progressed.
    Progress {
        /// The thread doing the work.
        tid: usize,

        /// The target.
        label: BuildLabel,

        /// The current status.
        status: TargetStatus,

        /// A short human-readable description, e.g. `Testing (run 2 of 3)...`.
        message: String,
    },

    /// Testing of a target finished.
    TestResult {
        /// The thread doing the work.
        tid: usize,

        /// The target.
        label: BuildLabel,

        /// Whether the target passed.
        status: TargetStatus,

        /// The aggregated results of every run so far.
        results: TestSuite,

        /// A one-line summary, e.g. `3 tests passed.`.
        message: String,

        /// The first failure or error, if the target didn't pass.
        failure: Option<TestFailure>,
    },

    /// Something went wrong that isn't a test failure.
    BuildError {
        /// The thread doing the work.
        tid: usize,

        /// The target.
        label: BuildLabel,

        /// What was being done.
        message: String,

        /// The error and its causes, formatted for display.
        error: String,
    },
}

impl TestEvent {
    /// The label of the target this event is about.
    pub fn label(&self) -> &BuildLabel {
        match self {
            Self::Progress { label, .. }
            | Self::TestResult { label, .. }
            | Self::BuildError { label, .. } => label,
        }
    }
}

/// Receives test events.
pub trait Reporter: Send + Sync {
    /// Reports an event.
    fn report(&self, event: TestEvent);
}

impl Reporter for crossbeam_channel::Sender<TestEvent> {
    fn report(&self, event: TestEvent) {
        // A receiver that has gone away has stopped caring.
        let _ = self.send(event);
    }
}

/// Writes events to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: TestEvent) {
        match event {
            TestEvent::Progress { label, message, .. } => info!("{label}: {message}"),
            TestEvent::TestResult {
                label,
                status: TargetStatus::TestFailed,
                message,
                failure,
                ..
            } => match failure {
                Some(failure) => warn!("{label}: {message}: {}", failure.message),
                None => warn!("{label}: {message}"),
            },
            TestEvent::TestResult { label, message, .. } => info!("{label}: {message}"),
            TestEvent::BuildError {
                label,
                message,
                error,
                ..
            } => error!("{label}: {message}: {error}"),
        }
    }
}
