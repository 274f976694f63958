// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::serialize::serialize_suites;
use chrono::{DateTime, FixedOffset};
use indexmap::map::IndexMap;
use std::{io, time::Duration};

/// A set of test suites, usually one per tested target.
///
/// This is the unit that gets written out as a JUnit `<testsuites>` document.
#[derive(Clone, Debug, Default)]
pub struct TestSuites {
    /// The name of this report.
    pub name: String,

    /// The suites contained in this report.
    pub suites: Vec<TestSuite>,
}

impl TestSuites {
    /// Creates a new, empty `TestSuites` with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            suites: vec![],
        }
    }

    /// Adds a suite to this report.
    pub fn add_suite(&mut self, suite: TestSuite) -> &mut Self {
        self.suites.push(suite);
        self
    }

    /// The total number of test cases across all suites.
    pub fn tests(&self) -> usize {
        self.suites.iter().map(TestSuite::tests).sum()
    }

    /// The total number of failed cases across all suites.
    pub fn failures(&self) -> usize {
        self.suites.iter().map(TestSuite::failures).sum()
    }

    /// The total number of errored cases across all suites.
    pub fn errors(&self) -> usize {
        self.suites.iter().map(TestSuite::errors).sum()
    }

    /// The sum of the durations of all suites.
    pub fn duration(&self) -> Duration {
        self.suites.iter().map(|suite| suite.duration).sum()
    }

    /// Serializes this report as JUnit XML to the given writer.
    pub fn serialize(&self, writer: impl io::Write) -> Result<(), crate::SerializeError> {
        serialize_suites(self, writer)
    }

    /// Serializes this report as JUnit XML to a string.
    pub fn to_junit_xml(&self) -> Result<String, crate::SerializeError> {
        let mut buf: Vec<u8> = vec![];
        self.serialize(&mut buf)?;
        String::from_utf8(buf).map_err(|error| crate::SerializeError::Utf8(error.utf8_error()))
    }
}

/// The results of testing a single target.
///
/// A suite is built up over one or more attempts. [`Self::add`] folds a parsed attempt into the
/// suite by merging executions per case, and [`Self::collapse`] appends one suite onto another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestSuite {
    /// The package the tested target lives in.
    pub package: String,

    /// The name of the tested target.
    pub name: String,

    /// When the first attempt started, if known.
    pub timestamp: Option<DateTime<FixedOffset>>,

    /// The total wall-clock time across every attempt folded into this suite.
    pub duration: Duration,

    /// True if any attempt was killed for exceeding its timeout.
    pub timed_out: bool,

    /// True if these results were served from a cache instead of being produced by a run.
    pub cached: bool,

    /// Free-form key/value properties. These describe the most recent attempt only.
    pub properties: IndexMap<String, String>,

    /// The test cases, in the order they were first seen.
    pub test_cases: Vec<TestCase>,
}

impl TestSuite {
    /// Creates a new, empty suite for the given package and target name.
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the start timestamp.
    pub fn set_timestamp(&mut self, timestamp: impl Into<DateTime<FixedOffset>>) -> &mut Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Sets the wall-clock duration.
    pub fn set_duration(&mut self, duration: Duration) -> &mut Self {
        self.duration = duration;
        self
    }

    /// Adds a single property, replacing any existing value under the same name.
    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// The number of test cases.
    pub fn tests(&self) -> usize {
        self.test_cases.len()
    }

    /// The number of cases that passed on every execution.
    pub fn passes(&self) -> usize {
        self.count(CaseStatus::Passed)
    }

    /// The number of cases that did not end in a pass and failed at least once.
    pub fn failures(&self) -> usize {
        self.count(CaseStatus::Failed)
    }

    /// The number of cases that did not end in a pass and errored without failing.
    pub fn errors(&self) -> usize {
        self.count(CaseStatus::Errored)
    }

    /// The number of cases that passed on their last execution after failing earlier.
    pub fn flakes(&self) -> usize {
        self.count(CaseStatus::Flaky)
    }

    /// The number of cases where every execution was skipped.
    pub fn skips(&self) -> usize {
        self.count(CaseStatus::Skipped)
    }

    /// Returns true if every case either passed on all executions or was skipped.
    ///
    /// Flaky cases do not count as succeeded here.
    pub fn all_succeeded(&self) -> bool {
        self.test_cases.iter().all(TestCase::is_success)
    }

    /// Returns the case with the given class name and name, if any.
    pub fn case(&self, classname: &str, name: &str) -> Option<&TestCase> {
        self.test_cases
            .iter()
            .find(|case| case.classname == classname && case.name == name)
    }

    /// Folds parsed cases from one attempt into this suite.
    ///
    /// A case with the same class name and name as an existing case has its executions appended
    /// to the existing case. Other cases are appended in order. Cases with no executions are
    /// dropped.
    pub fn add(&mut self, cases: impl IntoIterator<Item = TestCase>) -> &mut Self {
        for case in cases {
            if case.executions.is_empty() {
                continue;
            }
            match self
                .test_cases
                .iter_mut()
                .find(|existing| existing.classname == case.classname && existing.name == case.name)
            {
                Some(existing) => existing.executions.extend(case.executions),
                None => self.test_cases.push(case),
            }
        }
        self
    }

    /// Appends another suite onto this one.
    ///
    /// Cases are appended without merging, durations add up, a timeout in either suite marks the
    /// result as timed out, and properties are replaced by the other suite's properties.
    pub fn collapse(&mut self, other: TestSuite) -> &mut Self {
        let TestSuite {
            package: _,
            name: _,
            timestamp,
            duration,
            timed_out,
            cached,
            properties,
            test_cases,
        } = other;

        if self.timestamp.is_none() {
            self.timestamp = timestamp;
        }
        self.duration += duration;
        self.timed_out |= timed_out;
        self.cached |= cached;
        self.properties = properties;
        self.test_cases
            .extend(test_cases.into_iter().filter(|case| !case.executions.is_empty()));
        self
    }

    fn count(&self, status: CaseStatus) -> usize {
        self.test_cases
            .iter()
            .filter(|case| case.status() == status)
            .count()
    }
}

/// A single named test within a suite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    /// The class, module or package the test belongs to. May be empty.
    pub classname: String,

    /// The name of the test.
    pub name: String,

    /// One entry per physical attempt, in the order they ran.
    pub executions: Vec<TestExecution>,
}

impl TestCase {
    /// Creates a new case with no executions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            classname: String::new(),
            name: name.into(),
            executions: vec![],
        }
    }

    /// Sets the class name.
    pub fn set_classname(&mut self, classname: impl Into<String>) -> &mut Self {
        self.classname = classname.into();
        self
    }

    /// Adds an execution.
    pub fn add_execution(&mut self, execution: TestExecution) -> &mut Self {
        self.executions.push(execution);
        self
    }

    /// Returns true if every execution passed or was skipped.
    pub fn is_success(&self) -> bool {
        !self.executions.is_empty()
            && self
                .executions
                .iter()
                .all(|execution| !execution.outcome.is_failure_or_error())
    }

    /// Returns true if the last execution passed after an earlier one failed or errored.
    pub fn is_flaky(&self) -> bool {
        self.status() == CaseStatus::Flaky
    }

    /// Returns true if every execution was skipped.
    pub fn is_skipped(&self) -> bool {
        self.status() == CaseStatus::Skipped
    }

    /// Returns the overall status of this case across all its executions.
    pub fn status(&self) -> CaseStatus {
        if self.is_success() {
            let any_pass = self
                .executions
                .iter()
                .any(|execution| matches!(execution.outcome, ExecutionOutcome::Pass));
            return if any_pass {
                CaseStatus::Passed
            } else {
                CaseStatus::Skipped
            };
        }
        match self.executions.last() {
            Some(last) if matches!(last.outcome, ExecutionOutcome::Pass) => CaseStatus::Flaky,
            Some(_) => {
                let any_failure = self
                    .executions
                    .iter()
                    .any(|execution| matches!(execution.outcome, ExecutionOutcome::Failure(_)));
                if any_failure {
                    CaseStatus::Failed
                } else {
                    CaseStatus::Errored
                }
            }
            None => CaseStatus::Skipped,
        }
    }

    /// The total time across all executions that recorded one.
    pub fn duration(&self) -> Duration {
        self.executions
            .iter()
            .filter_map(|execution| execution.duration)
            .sum()
    }
}

/// The overall status of a [`TestCase`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CaseStatus {
    /// Every execution passed (skips allowed), and at least one actually ran.
    Passed,

    /// The last execution passed after earlier ones failed or errored.
    Flaky,

    /// The case did not end in a pass, and at least one execution failed.
    Failed,

    /// The case did not end in a pass, and executions errored without failing.
    Errored,

    /// Every execution was skipped.
    Skipped,
}

/// The result of one physical attempt at running a test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestExecution {
    /// How long the attempt took, if reported.
    pub duration: Option<Duration>,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// What happened.
    pub outcome: ExecutionOutcome,
}

impl TestExecution {
    /// Creates a new execution with the given outcome.
    pub fn new(outcome: ExecutionOutcome) -> Self {
        Self {
            duration: None,
            stdout: String::new(),
            stderr: String::new(),
            outcome,
        }
    }

    /// Creates a passing execution.
    pub fn pass() -> Self {
        Self::new(ExecutionOutcome::Pass)
    }

    /// Creates a failed execution.
    pub fn failure(failure: TestFailure) -> Self {
        Self::new(ExecutionOutcome::Failure(failure))
    }

    /// Creates an errored execution.
    pub fn error(failure: TestFailure) -> Self {
        Self::new(ExecutionOutcome::Error(failure))
    }

    /// Creates a skipped execution.
    pub fn skip(message: Option<String>) -> Self {
        Self::new(ExecutionOutcome::Skip { message })
    }

    /// Sets the duration.
    pub fn set_duration(&mut self, duration: Duration) -> &mut Self {
        self.duration = Some(duration);
        self
    }

    /// Sets standard output, stripping characters that cannot appear in XML.
    pub fn set_stdout(&mut self, stdout: impl AsRef<str>) -> &mut Self {
        self.stdout = sanitize_output(stdout.as_ref());
        self
    }

    /// Sets standard output from possibly non-UTF-8 bytes.
    pub fn set_stdout_lossy(&mut self, stdout: impl AsRef<[u8]>) -> &mut Self {
        self.set_stdout(String::from_utf8_lossy(stdout.as_ref()))
    }

    /// Sets standard error, stripping characters that cannot appear in XML.
    pub fn set_stderr(&mut self, stderr: impl AsRef<str>) -> &mut Self {
        self.stderr = sanitize_output(stderr.as_ref());
        self
    }

    /// Sets standard error from possibly non-UTF-8 bytes.
    pub fn set_stderr_lossy(&mut self, stderr: impl AsRef<[u8]>) -> &mut Self {
        self.set_stderr(String::from_utf8_lossy(stderr.as_ref()))
    }
}

/// The outcome of a [`TestExecution`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The test passed.
    Pass,

    /// The test ran and an assertion failed.
    Failure(TestFailure),

    /// The test could not be run properly, or produced unusable results.
    Error(TestFailure),

    /// The test was skipped.
    Skip {
        /// The reason given for the skip, if any.
        message: Option<String>,
    },
}

impl ExecutionOutcome {
    /// Returns true for [`Self::Failure`] and [`Self::Error`].
    pub fn is_failure_or_error(&self) -> bool {
        matches!(self, Self::Failure(_) | Self::Error(_))
    }

    /// Returns the failure details for a failure or error.
    pub fn failure(&self) -> Option<&TestFailure> {
        match self {
            Self::Failure(failure) | Self::Error(failure) => Some(failure),
            Self::Pass | Self::Skip { .. } => None,
        }
    }
}

/// Details about a failed or errored execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestFailure {
    /// A short, one-line description.
    pub message: String,

    /// The kind of failure, e.g. an exception class name.
    pub ty: String,

    /// A longer description, such as a stack trace or the program's output.
    pub traceback: String,
}

impl TestFailure {
    /// Creates a new failure with the given type and message.
    pub fn new(ty: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ty: ty.into(),
            traceback: String::new(),
        }
    }

    /// Sets the traceback.
    pub fn set_traceback(&mut self, traceback: impl AsRef<str>) -> &mut Self {
        self.traceback = sanitize_output(traceback.as_ref());
        self
    }

    /// Builder-style version of [`Self::set_traceback`].
    pub fn with_traceback(mut self, traceback: impl AsRef<str>) -> Self {
        self.set_traceback(traceback);
        self
    }
}

/// Removes characters that are not allowed in XML 1.0 documents.
///
/// Tabs, newlines and carriage returns are kept.
pub(crate) fn sanitize_output(output: &str) -> String {
    output
        .chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r') || !c.is_control())
        .collect()
}
