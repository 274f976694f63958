// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running test processes.

use crate::{
    errors::RunError,
    label::BuildLabel,
    layout::{COVERAGE_FILE, RepoLayout, TEST_RESULTS_FILE},
    target::BuildTarget,
};
use camino::Utf8PathBuf;
use crossbeam_channel::RecvTimeoutError;
use duct::cmd;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::debug;

/// A request to run one attempt of a test.
#[derive(Clone, Debug)]
pub struct ExecRequest {
    /// The target being tested.
    pub label: BuildLabel,

    /// The shell command to run, including any extra test arguments.
    pub command: String,

    /// The directory to run in.
    pub dir: Utf8PathBuf,

    /// The complete environment of the process.
    pub env: BTreeMap<String, String>,

    /// How long the attempt may take before it is killed.
    pub timeout: Duration,

    /// The run index, starting at 1.
    pub run: u32,

    /// The attempt within the run, starting at 1.
    pub attempt: u32,
}

/// The result of one attempt.
#[derive(Debug, Default)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: Vec<u8>,

    /// Captured standard error.
    pub stderr: Vec<u8>,

    /// Why the attempt failed at the process level, or `None` if it exited successfully.
    pub error: Option<RunError>,
}

/// Runs test processes.
pub trait TestExecutor: Send + Sync {
    /// Runs one attempt and waits for it to finish or time out.
    fn execute(&self, request: &ExecRequest) -> ExecOutput;
}

/// Runs tests through `sh -c`.
#[derive(Clone, Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    /// Creates a new shell executor.
    pub fn new() -> Self {
        Self
    }
}

impl TestExecutor for ShellExecutor {
    fn execute(&self, request: &ExecRequest) -> ExecOutput {
        debug!(
            "{}: running `{}` in {}",
            request.label, request.command, request.dir
        );
        let handle = match cmd("sh", ["-c", request.command.as_str()])
            .dir(request.dir.as_std_path())
            .full_env(&request.env)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()
        {
            Ok(handle) => Arc::new(handle),
            Err(error) => {
                return ExecOutput {
                    error: Some(RunError::Spawn(error)),
                    ..Default::default()
                };
            }
        };

        // A waiter thread lets the deadline be enforced from here.
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let waiter = Arc::clone(&handle);
        let spawned = std::thread::Builder::new()
            .name(format!("testament-wait-{}", request.label.name))
            .spawn(move || {
                let _ = sender.send(waiter.wait().map(|_| ()));
            });
        if let Err(error) = spawned {
            let _ = handle.kill();
            return ExecOutput {
                error: Some(RunError::Spawn(error)),
                ..Default::default()
            };
        }

        match receiver.recv_timeout(request.timeout) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                return ExecOutput {
                    error: Some(RunError::Spawn(error)),
                    ..Default::default()
                };
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                debug!("{}: killing test after {:?}", request.label, request.timeout);
                let _ = handle.kill();
                return ExecOutput {
                    error: Some(RunError::TimedOut(request.timeout)),
                    ..Default::default()
                };
            }
        }

        // The waiter has already observed completion, so this returns immediately.
        match handle.wait() {
            Ok(output) => ExecOutput {
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
                error: (!output.status.success()).then(|| RunError::Exit {
                    code: output.status.code(),
                }),
            },
            Err(error) => ExecOutput {
                error: Some(RunError::Spawn(error)),
                ..Default::default()
            },
        }
    }
}

/// Settings that apply to every test's environment.
#[derive(Clone, Debug)]
pub struct EnvSettings<'a> {
    /// `PATH` for the process.
    pub path: &'a str,

    /// Whether coverage is collected.
    pub coverage: bool,

    /// Extra arguments for the test.
    pub test_args: &'a [String],
}

/// Builds the complete environment of a test process.
///
/// The environment is hermetic: nothing is inherited from the calling process. A target's
/// declared variables take precedence over the standard ones.
pub fn test_env(
    layout: &RepoLayout,
    target: &BuildTarget,
    run: u32,
    settings: &EnvSettings<'_>,
) -> BTreeMap<String, String> {
    let label = &target.label;
    let test_dir = layout.test_dir(label, run);
    let mut env = BTreeMap::new();

    env.insert("PATH".to_owned(), settings.path.to_owned());
    env.insert("HOME".to_owned(), test_dir.to_string());
    env.insert("TEST_DIR".to_owned(), test_dir.to_string());
    env.insert("TMP_DIR".to_owned(), test_dir.to_string());
    env.insert("TMPDIR".to_owned(), test_dir.to_string());
    env.insert("PKG".to_owned(), label.package_name.clone());
    env.insert("NAME".to_owned(), label.name.clone());
    env.insert(
        "RESULTS_FILE".to_owned(),
        test_dir.join(TEST_RESULTS_FILE).to_string(),
    );
    env.insert("TEST_RUN".to_owned(), run.to_string());
    if let Some(output) = target.outputs.first() {
        env.insert("TEST".to_owned(), layout.root().join(output).to_string());
    }
    if settings.coverage {
        env.insert("COVERAGE".to_owned(), "true".to_owned());
        env.insert(
            "COVERAGE_FILE".to_owned(),
            test_dir.join(COVERAGE_FILE).to_string(),
        );
    }
    if !settings.test_args.is_empty() {
        env.insert("TESTS".to_owned(), settings.test_args.join(" "));
    }
    for (key, value) in &target.test.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Returns the command line for a test: the command followed by any extra arguments.
pub fn test_command(command: &str, test_args: &[String]) -> String {
    if test_args.is_empty() {
        command.to_owned()
    } else {
        format!("{command} {}", test_args.join(" "))
    }
}
