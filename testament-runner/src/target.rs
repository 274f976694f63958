// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Build targets as seen by the test runner.

use crate::{coverage::TestCoverage, label::BuildLabel};
use camino::Utf8PathBuf;
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use testament_results::TestSuite;

/// How a target's tests are run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestSettings {
    /// The shell command that runs the tests.
    pub command: String,

    /// A command that starts a persistent worker the test talks to, if the test needs one.
    pub worker_command: Option<String>,

    /// The per-attempt timeout. Falls back to the configured default if unset.
    pub timeout: Option<Duration>,

    /// The maximum number of attempts for a flaky test. `0` and `1` both mean a single attempt.
    pub flakiness: u32,

    /// Extra files the test writes into its run directory that are kept alongside its results.
    pub outputs: Vec<String>,

    /// If true, the test is judged only by its exit status and need not write a results file.
    pub no_test_output: bool,

    /// If true, coverage is never collected for this target.
    pub no_coverage: bool,

    /// Environment variables declared on the target.
    pub env: BTreeMap<String, String>,

    /// Runtime data files and directories, relative to the repository root. These are linked into
    /// the run directory and are part of the fingerprint.
    pub data: Vec<Utf8PathBuf>,
}

impl TestSettings {
    /// Creates settings that run the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// The number of attempts a single run may make.
    pub fn max_attempts(&self) -> u32 {
        self.flakiness.max(1)
    }
}

/// The build state of a target, as far as testing is concerned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BuildState {
    /// Not built yet.
    Pending,

    /// Built during this invocation.
    Built,

    /// Outputs were retrieved from a cache.
    Reused,

    /// Outputs were already up to date.
    Unchanged,

    /// Testing stopped after preparing the run directory.
    Stopped,

    /// Tests ran and passed.
    Tested,

    /// Tests ran and failed.
    TestFailed,
}

impl BuildState {
    /// Returns true if the target's outputs are the same as in a previous invocation.
    pub fn is_up_to_date(self) -> bool {
        matches!(self, Self::Reused | Self::Unchanged)
    }
}

/// A compiled target that may be tested.
///
/// The test results are kept behind a lock. Callers mutate them through [`Self::with_results`],
/// which must never be held across I/O or process execution.
#[derive(Debug)]
pub struct BuildTarget {
    /// The target's label.
    pub label: BuildLabel,

    /// Test configuration.
    pub test: TestSettings,

    /// Build outputs, relative to the repository root.
    pub outputs: Vec<Utf8PathBuf>,

    /// Direct dependencies.
    pub dependencies: Vec<BuildLabel>,

    state: Mutex<BuildState>,
    results: Mutex<TestSuite>,
    coverage: Mutex<TestCoverage>,
}

impl BuildTarget {
    /// Creates a new target with the given label and test settings.
    pub fn new(label: BuildLabel, test: TestSettings) -> Self {
        let results = TestSuite::new(label.package_name.clone(), label.name.clone());
        Self {
            label,
            test,
            outputs: vec![],
            dependencies: vec![],
            state: Mutex::new(BuildState::Pending),
            results: Mutex::new(results),
            coverage: Mutex::new(TestCoverage::default()),
        }
    }

    /// Adds build outputs.
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Adds dependencies.
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = BuildLabel>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    /// Returns the current build state.
    pub fn state(&self) -> BuildState {
        *lock(&self.state)
    }

    /// Sets the build state.
    pub fn set_state(&self, state: BuildState) {
        *lock(&self.state) = state;
    }

    /// Runs `f` with exclusive access to the test results.
    pub fn with_results<T>(&self, f: impl FnOnce(&mut TestSuite) -> T) -> T {
        f(&mut lock(&self.results))
    }

    /// Returns a copy of the current test results.
    pub fn results(&self) -> TestSuite {
        lock(&self.results).clone()
    }

    /// Runs `f` with exclusive access to the collected coverage.
    pub fn with_coverage<T>(&self, f: impl FnOnce(&mut TestCoverage) -> T) -> T {
        f(&mut lock(&self.coverage))
    }

    /// Returns a copy of the collected coverage.
    pub fn coverage(&self) -> TestCoverage {
        lock(&self.coverage).clone()
    }

    /// Returns true if the target should collect coverage when coverage is requested.
    pub fn wants_coverage(&self) -> bool {
        !self.test.no_coverage
    }
}

// A panic while a lock is held leaves plain data behind, so recover it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
