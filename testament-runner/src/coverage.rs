// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line coverage collected from tests.
//!
//! Coverage file formats are language-specific and are handled by a [`CoverageParser`]. This
//! module holds the format-independent model and how coverage from several runs combines.

use crate::{errors::CoverageParseError, target::BuildTarget};
use camino::Utf8Path;
use std::{collections::BTreeMap, fs, io};

/// The coverage state of a single line.
///
/// Variants are ordered so that combining two observations of a line keeps the maximum.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LineCoverage {
    /// The line contains no executable code.
    #[default]
    NotExecutable,

    /// The line is executable but was not run.
    Uncovered,

    /// The line was run at least once.
    Covered,
}

/// Coverage for a set of files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestCoverage {
    /// Per-file line coverage, indexed by line number starting from 0.
    pub files: BTreeMap<String, Vec<LineCoverage>>,
}

impl TestCoverage {
    /// Creates empty coverage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no file has any coverage recorded.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Combines `other` into `self`, keeping the higher state of each line.
    pub fn aggregate(&mut self, other: TestCoverage) {
        for (file, lines) in other.files {
            let existing = self.files.entry(file).or_default();
            if existing.len() < lines.len() {
                existing.resize(lines.len(), LineCoverage::NotExecutable);
            }
            for (line, state) in existing.iter_mut().zip(lines) {
                *line = (*line).max(state);
            }
        }
    }

    /// Returns the fraction of executable lines that were covered, or `None` if there are none.
    pub fn line_rate(&self) -> Option<f64> {
        let (mut covered, mut executable) = (0usize, 0usize);
        for state in self.files.values().flatten() {
            match state {
                LineCoverage::Covered => {
                    covered += 1;
                    executable += 1;
                }
                LineCoverage::Uncovered => executable += 1,
                LineCoverage::NotExecutable => {}
            }
        }
        (executable > 0).then(|| covered as f64 / executable as f64)
    }
}

/// Parses coverage data written by a test.
pub trait CoverageParser: Send + Sync {
    /// Parses coverage data produced by the given run of `target`.
    fn parse(
        &self,
        target: &BuildTarget,
        data: &[u8],
        run: u32,
    ) -> Result<TestCoverage, CoverageParseError>;
}

/// A parser that ignores its input. Used when no language-specific parser is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullCoverageParser;

impl CoverageParser for NullCoverageParser {
    fn parse(
        &self,
        _target: &BuildTarget,
        _data: &[u8],
        _run: u32,
    ) -> Result<TestCoverage, CoverageParseError> {
        Ok(TestCoverage::new())
    }
}

/// Reads and parses a coverage file. A missing file is empty coverage.
pub fn parse_coverage_file(
    parser: &dyn CoverageParser,
    target: &BuildTarget,
    path: &Utf8Path,
    run: u32,
) -> Result<TestCoverage, CoverageParseError> {
    match fs::read(path) {
        Ok(data) => parser.parse(target, &data, run),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(TestCoverage::new()),
        Err(error) => Err(CoverageParseError::new(
            &target.label,
            format!("error reading `{path}`: {error}"),
        )),
    }
}
