// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsers for the results files that tests write.
//!
//! Two formats are understood: JUnit/XUnit XML, and the textual output of `go test -v`. The
//! format is detected from the content, so callers never need to say which one they have.

mod junit;

use crate::{ResultsParseError, ResultsParseErrorKind, TestSuite};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// The format a results file was detected as.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultsFormat {
    /// JUnit or XUnit XML.
    JUnitXml,

    /// Output of `go test -v`.
    GoTest,

    /// Empty or whitespace-only content.
    Empty,
}

impl ResultsFormat {
    /// Sniffs the format of some results content.
    pub fn detect(data: &str) -> Option<Self> {
        let trimmed = data.trim_start_matches('\u{feff}').trim_start();
        if trimmed.is_empty() {
            Some(Self::Empty)
        } else if trimmed.starts_with('<') {
            Some(Self::JUnitXml)
        } else if go_test::looks_like_go_test(trimmed) {
            Some(Self::GoTest)
        } else {
            None
        }
    }
}

/// Parses the results at `path`.
///
/// If `path` is a directory, every regular file below it is parsed (in sorted order) and the
/// resulting cases are folded into a single suite.
pub fn parse_results_file(path: &Utf8Path) -> Result<TestSuite, ResultsParseError> {
    let metadata = fs::metadata(path)
        .map_err(|error| ResultsParseError::new(Some(path.to_owned()), ResultsParseErrorKind::Read(error)))?;
    if !metadata.is_dir() {
        let data = fs::read(path).map_err(|error| {
            ResultsParseError::new(Some(path.to_owned()), ResultsParseErrorKind::Read(error))
        })?;
        return parse_results_bytes(&data).map_err(|error| error.with_path(path));
    }

    let mut files = vec![];
    collect_files(path, &mut files)?;
    files.sort();

    let mut suite = TestSuite::default();
    for file in files {
        let data = fs::read(&file).map_err(|error| {
            ResultsParseError::new(Some(file.clone()), ResultsParseErrorKind::Read(error))
        })?;
        let parsed = parse_results_bytes(&data).map_err(|error| error.with_path(&file))?;
        merge_parsed(&mut suite, parsed);
    }
    Ok(suite)
}

/// Parses results from several in-memory blobs, folding them into a single suite.
///
/// This is how results returned by remote execution are handled.
pub fn parse_results_data<'a>(
    blobs: impl IntoIterator<Item = &'a [u8]>,
) -> Result<TestSuite, ResultsParseError> {
    let mut suite = TestSuite::default();
    for blob in blobs {
        merge_parsed(&mut suite, parse_results_bytes(blob)?);
    }
    Ok(suite)
}

/// Parses a single results blob.
pub fn parse_results_bytes(data: &[u8]) -> Result<TestSuite, ResultsParseError> {
    let data = std::str::from_utf8(data).map_err(ResultsParseErrorKind::InvalidUtf8)?;
    parse_results_str(data)
}

/// Parses a single results string.
pub fn parse_results_str(data: &str) -> Result<TestSuite, ResultsParseError> {
    match ResultsFormat::detect(data) {
        Some(ResultsFormat::JUnitXml) => Ok(junit::parse(data)?),
        Some(ResultsFormat::GoTest) => Ok(go_test::parse(data)?),
        Some(ResultsFormat::Empty) => Ok(TestSuite::default()),
        None => Err(ResultsParseErrorKind::UnknownFormat.into()),
    }
}

fn merge_parsed(suite: &mut TestSuite, parsed: TestSuite) {
    let TestSuite {
        timestamp,
        duration,
        properties,
        test_cases,
        ..
    } = parsed;
    if suite.timestamp.is_none() {
        suite.timestamp = timestamp;
    }
    suite.duration += duration;
    suite.properties.extend(properties);
    suite.add(test_cases);
}

fn collect_files(dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> Result<(), ResultsParseError> {
    let read_err =
        |error| ResultsParseError::new(Some(dir.to_owned()), ResultsParseErrorKind::Read(error));
    for entry in dir.read_dir_utf8().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let file_type = entry.file_type().map_err(read_err)?;
        if file_type.is_dir() {
            collect_files(entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.into_path());
        }
    }
    Ok(())
}
