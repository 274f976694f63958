// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turning the raw output of a test attempt into results.
//!
//! A test reports its outcome twice: through its exit status and through the results file it
//! writes. When the two disagree, or one of them is missing, the disagreement is recorded as an
//! extra synthetic test case named after the target instead of trusting either side.

use crate::{
    errors::{DisplayErrorChain, RunError},
    label::BuildLabel,
};
use camino::Utf8Path;
use std::time::Duration;
use testament_results::{
    TestCase, TestExecution, TestFailure, TestSuite, parse_results_data, parse_results_file,
};
use tracing::debug;

/// The test produced no results file, but exited successfully.
pub const MISSING_RESULTS: &str = "MissingResults";

/// The test failed and wasn't expected to write a results file.
pub const TEST_FAILED: &str = "TestFailed";

/// The test failed and didn't produce usable results.
pub const NO_RESULTS: &str = "NoResults";

/// The exit status disagreed with the reported results.
pub const RETURN_VALUE: &str = "ReturnValue";

/// Where an attempt's results come from.
#[derive(Clone, Copy, Debug)]
pub enum ResultsSource<'a> {
    /// A file or directory of files on disk.
    File(&'a Utf8Path),

    /// Results returned in memory, as from remote execution.
    Data(&'a [Vec<u8>]),
}

impl ResultsSource<'_> {
    fn is_present(&self) -> bool {
        match self {
            Self::File(path) => path.exists(),
            Self::Data(blobs) => !blobs.is_empty(),
        }
    }
}

/// Everything known about one finished attempt.
#[derive(Clone, Copy, Debug)]
pub struct RawTestOutput<'a> {
    /// The target tested.
    pub label: &'a BuildLabel,

    /// The results the test wrote.
    pub results: ResultsSource<'a>,

    /// If true, the test isn't expected to write results.
    pub no_test_output: bool,

    /// Captured standard output.
    pub stdout: &'a [u8],

    /// Captured standard error.
    pub stderr: &'a [u8],

    /// The process-level failure, if any.
    pub error: Option<&'a RunError>,

    /// How long the attempt took.
    pub duration: Duration,
}

/// Parses the output of one attempt into a suite.
///
/// This never fails: every way an attempt can go wrong is represented in the returned suite.
pub fn parse_test_output(raw: &RawTestOutput<'_>) -> TestSuite {
    let label = raw.label;
    let mut suite = TestSuite::new(label.package_name.clone(), label.name.clone());
    suite.set_duration(raw.duration);

    if !raw.results.is_present() {
        let execution = match (raw.error, raw.no_test_output) {
            (None, true) => TestExecution::pass(),
            (None, false) => TestExecution::error(TestFailure::new(
                MISSING_RESULTS,
                "Test failed to produce output results file",
            )),
            (Some(error), true) => TestExecution::failure(TestFailure::new(
                TEST_FAILED,
                format!("Test failed: {error}"),
            )),
            (Some(error), false) => TestExecution::error(
                TestFailure::new(NO_RESULTS, "Test failed with no results")
                    .with_traceback(DisplayErrorChain::new(error).to_string()),
            ),
        };
        suite.add([synthetic_case(&label.name, raw, execution)]);
        return suite;
    }

    let parsed = match raw.results {
        ResultsSource::File(path) => parse_results_file(path),
        ResultsSource::Data(blobs) => parse_results_data(blobs.iter().map(Vec::as_slice)),
    };
    let parsed = match parsed {
        Ok(parsed) => parsed,
        Err(parse_error) => {
            debug!("{label}: failed to parse results: {parse_error}");
            let case = match raw.error {
                Some(error) => synthetic_case(
                    &label.name,
                    raw,
                    TestExecution::error(
                        TestFailure::new(NO_RESULTS, "Test failed with no results")
                            .with_traceback(DisplayErrorChain::new(error).to_string()),
                    ),
                ),
                None => synthetic_case(
                    "Unknown",
                    raw,
                    TestExecution::error(
                        TestFailure::new(NO_RESULTS, "Couldn't parse test output file")
                            .with_traceback(DisplayErrorChain::new(parse_error).to_string()),
                    ),
                ),
            };
            suite.add([case]);
            return suite;
        }
    };

    // Errors alone don't count: a test that only errored may still have exited cleanly.
    let reported_failures = parsed.failures();
    suite.properties = parsed.properties;
    suite.add(parsed.test_cases);

    match raw.error {
        Some(error) if reported_failures == 0 => {
            suite.add([synthetic_case(
                &label.name,
                raw,
                TestExecution::error(
                    TestFailure::new(RETURN_VALUE, "Test returned nonzero but reported no errors")
                        .with_traceback(DisplayErrorChain::new(error).to_string()),
                ),
            )]);
        }
        None if reported_failures > 0 => {
            suite.add([synthetic_case(
                &label.name,
                raw,
                TestExecution::failure(TestFailure::new(
                    RETURN_VALUE,
                    "Test returned 0 but still reported failures",
                )),
            )]);
        }
        _ => {}
    }
    suite
}

fn synthetic_case(name: &str, raw: &RawTestOutput<'_>, mut execution: TestExecution) -> TestCase {
    execution
        .set_duration(raw.duration)
        .set_stdout_lossy(raw.stdout)
        .set_stderr_lossy(raw.stderr);
    let mut case = TestCase::new(name);
    case.add_execution(execution);
    case
}
