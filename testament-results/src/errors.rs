// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by this crate.

use camino::Utf8PathBuf;
use std::{num::ParseFloatError, str::Utf8Error};
use thiserror::Error;

/// An error that occurred while parsing a results file.
#[derive(Debug, Error)]
#[error(
    "failed to parse test results{}",
    path.as_ref().map(|path| format!(" at `{path}`")).unwrap_or_default()
)]
pub struct ResultsParseError {
    path: Option<Utf8PathBuf>,
    #[source]
    kind: ResultsParseErrorKind,
}

impl ResultsParseError {
    pub(crate) fn new(path: Option<Utf8PathBuf>, kind: ResultsParseErrorKind) -> Self {
        Self { path, kind }
    }

    pub(crate) fn with_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    /// Returns the path that failed to parse, if the input came from a file.
    pub fn path(&self) -> Option<&camino::Utf8Path> {
        self.path.as_deref()
    }

    /// Returns the kind of error that occurred.
    pub fn kind(&self) -> &ResultsParseErrorKind {
        &self.kind
    }
}

impl From<ResultsParseErrorKind> for ResultsParseError {
    fn from(kind: ResultsParseErrorKind) -> Self {
        Self::new(None, kind)
    }
}

/// The kind of error that occurred while parsing a results file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResultsParseErrorKind {
    /// An error occurred while reading the file or directory.
    #[error("error reading results")]
    Read(#[source] std::io::Error),

    /// The results were not valid UTF-8.
    #[error("results are not valid UTF-8")]
    InvalidUtf8(#[source] Utf8Error),

    /// The results did not look like any known format.
    #[error("results are neither JUnit XML nor Go test output")]
    UnknownFormat,

    /// The XML was malformed.
    #[error("malformed XML")]
    Xml(#[source] quick_xml::Error),

    /// The XML document ended while elements were still open.
    #[error("XML document ended with unclosed element `{0}`")]
    UnclosedElement(String),

    /// The XML root element was not `<testsuites>` or `<testsuite>`.
    #[error("unexpected root element `{0}`, expected `testsuites` or `testsuite`")]
    UnexpectedRoot(String),

    /// A `time` attribute was not a valid non-negative number of seconds.
    #[error("invalid time `{value}` on `{element}`")]
    InvalidTime {
        /// The element that carried the attribute.
        element: String,

        /// The attribute value.
        value: String,

        /// The underlying parse error, if the value wasn't a number at all.
        #[source]
        error: Option<ParseFloatError>,
    },

    /// A Go test result line carried a malformed duration.
    #[error("invalid duration on line {line}: `{text}`")]
    InvalidGoDuration {
        /// The 1-based line number.
        line: usize,

        /// The full line.
        text: String,
    },
}

impl From<quick_xml::Error> for ResultsParseErrorKind {
    fn from(error: quick_xml::Error) -> Self {
        Self::Xml(error)
    }
}

/// An error that occurred while serializing results as JUnit XML.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SerializeError {
    /// The XML writer failed.
    #[error("error writing XML")]
    Xml(#[from] quick_xml::Error),

    /// The underlying writer failed.
    #[error("error writing to output")]
    Io(#[from] std::io::Error),

    /// The serialized output was not valid UTF-8.
    #[error("serialized output is not valid UTF-8")]
    Utf8(#[source] Utf8Error),
}
