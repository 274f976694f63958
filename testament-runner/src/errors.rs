// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testament.

use camino::{Utf8Path, Utf8PathBuf};
use config::ConfigError;
use std::{borrow::Cow, error::Error, fmt, time::Duration};
use testament_results::SerializeError;
use thiserror::Error;

/// Displays an error along with the chain of errors that caused it.
///
/// Used wherever an error ends up as text in a report, such as the traceback of a synthetic test
/// case.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: Error> DisplayErrorChain<E> {
    /// Wraps an error for display.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        if source.is_some() {
            write!(f, "\n  caused by:")?;
        }
        while let Some(cause) = source {
            write!(f, "\n  - {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}

/// An error that occurred while parsing a build label.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid build label `{input}`: {reason}")]
pub struct LabelParseError {
    input: String,
    reason: Cow<'static, str>,
}

impl LabelParseError {
    pub(crate) fn new(input: impl Into<String>, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Returns the input that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// A target was looked up in the build graph but wasn't there.
#[derive(Clone, Debug, Error)]
#[error("target `{label}` not found in build graph")]
pub struct TargetNotFoundError {
    label: String,
}

impl TargetNotFoundError {
    pub(crate) fn new(label: impl fmt::Display) -> Self {
        Self {
            label: label.to_string(),
        }
    }
}

/// An error that occurred while reading or validating configuration.
#[derive(Debug, Error)]
#[error("failed to parse testament config at `{config_file}`")]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8Path {
        &self.config_file
    }

    /// Returns the kind of error that occurred.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of a [`ConfigParseError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// The configuration could not be read or deserialized.
    #[error("error building config")]
    BuildError(#[source] Box<ConfigError>),

    /// A URL setting was not a valid absolute URL.
    #[error("invalid URL `{url}` for `{key}`")]
    InvalidUrl {
        /// The config key.
        key: &'static str,

        /// The value that was provided.
        url: String,

        /// The underlying parse error, if any.
        #[source]
        error: Option<http::uri::InvalidUri>,
    },

    /// A numeric setting was out of range.
    #[error("`{key}` must be at least 1")]
    ZeroValue {
        /// The config key.
        key: &'static str,
    },
}

/// An error that occurred while computing the runtime fingerprint of a target.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FingerprintError {
    /// A declared input couldn't be read.
    #[error("error reading input `{path}`")]
    ReadInput {
        /// The path that couldn't be read.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A declared input directory couldn't be walked.
    #[error("error walking input directory `{path}`")]
    WalkInput {
        /// The directory being walked.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: walkdir::Error,
    },

    /// A path under a declared input wasn't valid UTF-8.
    #[error("input path `{}` is not valid UTF-8", .0.display())]
    NonUtf8Path(std::path::PathBuf),
}

/// An error that occurred while writing a cache archive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveCreateError {
    /// A file or directory to be archived couldn't be read.
    #[error("error reading `{path}` to archive")]
    InputFileRead {
        /// The path that couldn't be read.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A directory to be archived couldn't be walked.
    #[error("error walking `{path}` to archive")]
    WalkInput {
        /// The directory being walked.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: walkdir::Error,
    },

    /// An archive path was not relative to the archive root.
    #[error("`{path}` is not under archive root `{root}`")]
    OutsideRoot {
        /// The path.
        path: Utf8PathBuf,

        /// The archive root.
        root: Utf8PathBuf,
    },

    /// Writing the archive stream failed.
    #[error("error writing archive")]
    OutputIo(#[source] std::io::Error),
}

/// An error that occurred while extracting a cache archive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveExtractError {
    /// Reading the archive stream failed.
    #[error("I/O error reading archive")]
    Read(#[source] std::io::Error),

    /// A path in the archive wasn't valid UTF-8.
    #[error("path in archive `{}` wasn't valid UTF-8", String::from_utf8_lossy(.0))]
    NonUtf8Path(Vec<u8>),

    /// A path in the archive contained a component other than a plain name.
    #[error("path in archive `{path}` contains an invalid component `{component}`")]
    InvalidComponent {
        /// The path.
        path: Utf8PathBuf,

        /// The offending component.
        component: String,
    },

    /// A file or directory couldn't be written to disk.
    #[error("error writing `{path}` to disk")]
    WriteFile {
        /// The path being written.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while talking to an HTTP cache.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HttpCacheError {
    /// The request couldn't be sent or the response couldn't be received.
    #[error("error sending request to `{url}`")]
    Request {
        /// The URL.
        url: String,

        /// The underlying error.
        #[source]
        error: Box<ureq::Error>,
    },

    /// The server responded with an unexpected status.
    #[error("`{url}` responded with status {status}: {body}")]
    Status {
        /// The URL.
        url: String,

        /// The HTTP status.
        status: u16,

        /// The response body, which carries the server's explanation.
        body: String,
    },

    /// The archive couldn't be written.
    #[error("error creating archive")]
    Archive(#[from] ArchiveCreateError),

    /// The archive couldn't be extracted.
    #[error("error extracting archive")]
    Extract(#[from] ArchiveExtractError),
}

/// An error that occurred in the local directory cache.
#[derive(Debug, Error)]
#[error("{action} `{path}`")]
pub struct DirCacheError {
    action: &'static str,
    path: Utf8PathBuf,
    #[source]
    error: std::io::Error,
}

impl DirCacheError {
    pub(crate) fn new(action: &'static str, path: impl Into<Utf8PathBuf>, error: std::io::Error) -> Self {
        Self {
            action,
            path: path.into(),
            error,
        }
    }
}

/// An error that occurred while preparing a test's run directory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PrepareTestDirError {
    /// The old run directory couldn't be removed.
    #[error("error removing test directory `{path}`")]
    Remove {
        /// The directory.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The run directory couldn't be created.
    #[error("error creating test directory `{path}`")]
    Create {
        /// The directory.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A runtime file couldn't be linked into the run directory.
    #[error("error linking `{from}` into test directory as `{to}`")]
    Link {
        /// The source file.
        from: Utf8PathBuf,

        /// The destination in the run directory.
        to: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while moving test outputs to their permanent location.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistError {
    /// An output couldn't be moved.
    #[error("error moving `{from}` to `{to}`")]
    Move {
        /// The ephemeral location.
        from: Utf8PathBuf,

        /// The permanent location.
        to: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A placeholder output couldn't be written.
    #[error("error writing placeholder output `{path}`")]
    WriteDummy {
        /// The permanent location.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The fingerprint tag couldn't be recorded.
    #[error("error recording fingerprint on `{path}`")]
    RecordAttr {
        /// The tagged file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A previous output couldn't be removed.
    #[error("error removing previous output `{path}`")]
    Remove {
        /// The output.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}

/// An error that occurred while uploading test results.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UploadError {
    /// The results couldn't be serialized.
    #[error("error serializing results for upload")]
    Serialize(#[from] SerializeError),

    /// The request couldn't be sent.
    #[error("error uploading results to `{url}`")]
    Request {
        /// The URL.
        url: String,

        /// The underlying error.
        #[source]
        error: Box<ureq::Error>,
    },

    /// The server rejected the upload.
    #[error("uploading results to `{url}` failed with status {status}")]
    Status {
        /// The URL.
        url: String,

        /// The HTTP status.
        status: u16,
    },
}

/// A process-level failure of one test attempt.
///
/// The `Display` form of this error is what ends up as the traceback of synthetic failure cases.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The test process couldn't be started.
    #[error("failed to start test")]
    Spawn(#[source] std::io::Error),

    /// The test process exited unsuccessfully.
    #[error("{}", describe_exit(*.code))]
    Exit {
        /// The exit code, or `None` if the process was killed by a signal.
        code: Option<i32>,
    },

    /// The test process exceeded its timeout and was killed.
    #[error("test timed out after {}", format_secs(*.0))]
    TimedOut(Duration),

    /// A previous step needed to run the test failed.
    #[error(transparent)]
    Prepare(PrepareTestDirError),

    /// Remote execution failed.
    #[error(transparent)]
    Remote(RemoteTestError),
}

impl RunError {
    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_owned(),
    }
}

fn format_secs(duration: Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

/// A persistent test worker couldn't be started.
#[derive(Debug, Error)]
#[error("failed to start test worker `{command}`: {message}")]
pub struct WorkerStartError {
    command: String,
    message: String,
}

impl WorkerStartError {
    /// Creates a new error for the given worker command.
    pub fn new(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Returns the worker command that failed to start.
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Remote execution of a test failed.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct RemoteTestError {
    message: String,
}

impl RemoteTestError {
    /// Creates a new error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Coverage data couldn't be parsed.
#[derive(Clone, Debug, Error)]
#[error("error parsing coverage for `{label}`: {message}")]
pub struct CoverageParseError {
    label: String,
    message: String,
}

impl CoverageParseError {
    /// Creates a new error.
    pub fn new(label: impl fmt::Display, message: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            message: message.into(),
        }
    }
}

/// An error from one of the cache backends.
///
/// Cache operations are best-effort, so these are logged rather than returned from the
/// [`Cache`](crate::cache::Cache) trait.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// An HTTP cache failed.
    #[error(transparent)]
    Http(#[from] HttpCacheError),

    /// A directory cache failed.
    #[error(transparent)]
    Dir(#[from] DirCacheError),
}
