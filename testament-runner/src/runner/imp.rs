// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::prepare::prepare_test_dir;
use crate::{
    cache::{Cache, new_cache},
    config::{TestConfig, TestamentConfig},
    coverage::{CoverageParser, NullCoverageParser, TestCoverage, parse_coverage_file},
    errors::{
        CoverageParseError, DisplayErrorChain, PersistError, RemoteTestError, RunError,
        TargetNotFoundError, WorkerStartError,
    },
    exec::{EnvSettings, ExecRequest, ShellExecutor, TestExecutor, test_command, test_env},
    fingerprint::{CacheKey, RunSpec, runtime_hash},
    graph::BuildGraph,
    helpers::{plural, remove_path},
    label::BuildLabel,
    layout::RepoLayout,
    output::{RawTestOutput, ResultsSource, parse_test_output},
    persist::{DUMMY_COVERAGE, DUMMY_RESULTS, Persister},
    remote::{RemoteClient, RemoteTestOutput},
    reporter::{LogReporter, Reporter, TargetStatus, TestEvent},
    target::{BuildState, BuildTarget},
    time::stopwatch,
    upload::ResultsUploader,
    worker::WorkerLauncher,
};
use std::{error::Error, fs, sync::Arc};
use testament_results::{
    CaseStatus, TestCase, TestExecution, TestFailure, TestSuite, parse_results_file,
};
use tracing::{debug, warn};

/// The failure type of the synthetic case recorded when a test's worker can't be started.
pub const WORKER_FAIL: &str = "WorkerFail";

/// Test runner options.
///
/// Collaborators that aren't set fall back to defaults: tests run through `sh`, coverage data is
/// ignored, events go to the log and the cache is assembled from configuration.
pub struct TestRunnerBuilder {
    num_runs: u32,
    test_args: Vec<String>,
    coverage: bool,
    prepare_shell: bool,
    remote: Option<Arc<dyn RemoteClient>>,
    worker_launcher: Option<Arc<dyn WorkerLauncher>>,
    coverage_parser: Option<Arc<dyn CoverageParser>>,
    reporter: Option<Arc<dyn Reporter>>,
    cache: Option<Arc<dyn Cache>>,
    executor: Option<Arc<dyn TestExecutor>>,
}

impl Default for TestRunnerBuilder {
    fn default() -> Self {
        Self {
            num_runs: 1,
            test_args: vec![],
            coverage: false,
            prepare_shell: false,
            remote: None,
            worker_launcher: None,
            coverage_parser: None,
            reporter: None,
            cache: None,
            executor: None,
        }
    }
}

impl TestRunnerBuilder {
    /// Sets how many independent runs of each target are requested. Values below 1 are treated
    /// as 1.
    ///
    /// With more than one run, flaky targets get a single attempt per run and nothing is cached.
    pub fn set_num_runs(&mut self, num_runs: u32) -> &mut Self {
        self.num_runs = num_runs.max(1);
        self
    }

    /// Sets extra arguments passed to every test. Results of tests run with arguments are never
    /// cached.
    pub fn set_test_args(&mut self, test_args: Vec<String>) -> &mut Self {
        self.test_args = test_args;
        self
    }

    /// Sets whether coverage is collected.
    pub fn set_coverage(&mut self, coverage: bool) -> &mut Self {
        self.coverage = coverage;
        self
    }

    /// If set, run directories are prepared but tests aren't run.
    pub fn set_prepare_shell(&mut self, prepare_shell: bool) -> &mut Self {
        self.prepare_shell = prepare_shell;
        self
    }

    /// Sets the client used for remote runs.
    pub fn set_remote_client(&mut self, remote: Arc<dyn RemoteClient>) -> &mut Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the launcher for persistent test workers.
    pub fn set_worker_launcher(&mut self, launcher: Arc<dyn WorkerLauncher>) -> &mut Self {
        self.worker_launcher = Some(launcher);
        self
    }

    /// Sets the coverage parser.
    pub fn set_coverage_parser(&mut self, parser: Arc<dyn CoverageParser>) -> &mut Self {
        self.coverage_parser = Some(parser);
        self
    }

    /// Sets where events are reported.
    pub fn set_reporter(&mut self, reporter: Arc<dyn Reporter>) -> &mut Self {
        self.reporter = Some(reporter);
        self
    }

    /// Sets the cache, replacing the one configuration would produce.
    pub fn set_cache(&mut self, cache: Arc<dyn Cache>) -> &mut Self {
        self.cache = Some(cache);
        self
    }

    /// Sets how test processes are run.
    pub fn set_executor(&mut self, executor: Arc<dyn TestExecutor>) -> &mut Self {
        self.executor = Some(executor);
        self
    }

    /// Creates a new test runner for targets in `graph`.
    pub fn build<'g>(self, config: &TestamentConfig, graph: &'g BuildGraph) -> TestRunner<'g> {
        let layout = RepoLayout::new(config.repo_root());
        let test_config = config.test().clone();
        let cache = self.cache.or_else(|| new_cache(config, &layout));
        let uploader = (!test_config.upload.is_empty())
            .then(|| ResultsUploader::new(test_config.upload.clone(), test_config.upload_timeout));

        TestRunner {
            graph,
            persister: Persister::new(test_config.xattrs),
            layout,
            config: test_config,
            num_runs: self.num_runs,
            test_args: self.test_args,
            coverage: self.coverage,
            prepare_shell: self.prepare_shell,
            remote: self.remote,
            worker_launcher: self.worker_launcher,
            coverage_parser: self
                .coverage_parser
                .unwrap_or_else(|| Arc::new(NullCoverageParser)),
            reporter: self.reporter.unwrap_or_else(|| Arc::new(LogReporter)),
            cache,
            executor: self.executor.unwrap_or_else(|| Arc::new(ShellExecutor::new())),
            uploader,
        }
    }
}

/// Tests targets, deciding for each run whether its results can be reused.
///
/// Created using [`TestRunnerBuilder::build`]. A runner may be shared between threads; distinct
/// targets can be tested concurrently.
pub struct TestRunner<'g> {
    graph: &'g BuildGraph,
    layout: RepoLayout,
    config: TestConfig,
    persister: Persister,
    num_runs: u32,
    test_args: Vec<String>,
    coverage: bool,
    prepare_shell: bool,
    remote: Option<Arc<dyn RemoteClient>>,
    worker_launcher: Option<Arc<dyn WorkerLauncher>>,
    coverage_parser: Arc<dyn CoverageParser>,
    reporter: Arc<dyn Reporter>,
    cache: Option<Arc<dyn Cache>>,
    executor: Arc<dyn TestExecutor>,
    uploader: Option<ResultsUploader>,
}

// One (target, run) pair being tested.
struct RunContext<'a> {
    tid: usize,
    target: &'a BuildTarget,
    remote: bool,
    run: u32,
    key: CacheKey,
    needs_coverage: bool,
}

impl TestRunner<'_> {
    /// The repository layout tests run in.
    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    /// Tests one run of the target with the given label. Runs are numbered from 1.
    ///
    /// Test failures and errors preparing the test are reported through the reporter; the only
    /// error returned is an unknown label.
    pub fn test(
        &self,
        tid: usize,
        label: &BuildLabel,
        remote: bool,
        run: u32,
    ) -> Result<(), TargetNotFoundError> {
        let target = self.graph.target_or_err(label)?;
        self.test_target(tid, target, remote, run);
        Ok(())
    }

    /// Tests one run of `target`.
    pub fn test_target(&self, tid: usize, target: &BuildTarget, remote: bool, run: u32) {
        let label = &target.label;
        let needs_coverage = self.coverage && target.wants_coverage();

        // Remote executors address their own caches.
        let key = if remote {
            CacheKey::empty()
        } else {
            let spec = RunSpec {
                run,
                test_args: &self.test_args,
                coverage: needs_coverage,
            };
            match runtime_hash(&self.layout, target, &spec) {
                Ok(hash) => hash.collapse(),
                Err(error) => {
                    self.build_error(tid, target, "Failed to calculate target hash", &error);
                    return;
                }
            }
        };
        let cx = RunContext {
            tid,
            target,
            remote,
            run,
            key,
            needs_coverage,
        };

        if !remote
            && !self.prepare_shell
            && self.num_runs <= 1
            && !self.need_to_run(&cx)
            && self.use_cached_results(&cx)
        {
            debug!("{label}: run {run} is up to date, not rerunning");
            self.finish(&cx);
            return;
        }

        if let Err(error) = self.persister.remove_test_outputs(&self.layout, target, run) {
            self.build_error(tid, target, "Failed to remove test outputs", &error);
            return;
        }
        if self.prepare_shell {
            if let Err(error) = prepare_test_dir(&self.layout, target, run) {
                self.build_error(tid, target, "Failed to prepare test directory", &error);
                return;
            }
            target.set_state(BuildState::Stopped);
            self.reporter.report(TestEvent::Progress {
                tid,
                label: label.clone(),
                status: TargetStatus::Stopped,
                message: format!("Test directory prepared at {}", self.layout.test_dir(label, run)),
            });
            return;
        }

        let mut command = test_command(&target.test.command, &self.test_args);
        if !remote && let Some(worker_command) = &target.test.worker_command {
            self.reporter.report(TestEvent::Progress {
                tid,
                label: label.clone(),
                status: TargetStatus::Testing,
                message: "Starting test worker...".to_owned(),
            });
            match self.start_worker(worker_command, &command, target) {
                Ok(Some(replacement)) => command = replacement,
                Ok(None) => {}
                Err(error) => {
                    self.worker_failed(&cx, worker_command, &error);
                    return;
                }
            }
        }

        // Separate runs were asked for explicitly, so each gets exactly one attempt.
        let num_attempts = if self.num_runs > 1 {
            1
        } else {
            target.test.max_attempts()
        };
        let mut run_results = TestSuite::new(label.package_name.clone(), label.name.clone());
        let mut run_coverage = TestCoverage::new();
        for attempt in 1..=num_attempts {
            self.reporter.report(TestEvent::Progress {
                tid,
                label: label.clone(),
                status: TargetStatus::Testing,
                message: self.status_message(run, attempt, num_attempts),
            });
            // Every attempt starts from a fresh run directory.
            if !remote && let Err(error) = prepare_test_dir(&self.layout, target, run) {
                self.build_error(tid, target, "Failed to prepare test directory", &error);
                return;
            }
            let (suite, coverage) = if remote {
                self.run_remote(&cx)
            } else {
                self.run_local(&cx, &command, attempt)
            };
            run_coverage.aggregate(coverage);
            let succeeded = suite.all_succeeded();
            merge_attempt(&mut run_results, suite);
            if succeeded {
                break;
            }
            debug!("{label}: attempt {attempt} of {num_attempts} failed");
        }

        let succeeded = run_results.all_succeeded();
        target.with_results(|results| {
            results.collapse(run_results);
        });
        target.with_coverage(|coverage| coverage.aggregate(run_coverage));

        if succeeded && !remote {
            if self.num_runs == 1
                && self.test_args.is_empty()
                && let Err(error) = self.persist_outputs(&cx)
            {
                self.build_error(tid, target, "Failed to move test outputs", &error);
                return;
            }
            if self.config.clean_workdirs {
                let test_dir = self.layout.test_dir(label, run);
                if let Err(error) = remove_path(&test_dir) {
                    warn!("{label}: failed to remove test directory {test_dir}: {error}");
                }
            }
        }
        self.finish(&cx);
    }

    /// Waits for background cache work to finish.
    pub fn shutdown(&self) {
        if let Some(cache) = &self.cache {
            cache.shutdown();
        }
    }

    // Returns false if the outputs of this run are already in place, either from an earlier
    // invocation or retrieved from the cache.
    fn need_to_run(&self, cx: &RunContext<'_>) -> bool {
        let label = &cx.target.label;
        let results_file = self.layout.test_results_file(label, cx.run);

        if cx.target.state().is_up_to_date() && fs::symlink_metadata(&results_file).is_ok() {
            if cx.needs_coverage
                && !self
                    .persister
                    .verify_attr(&self.layout.coverage_file(label, cx.run), &cx.key)
            {
                debug!("{label}: rerunning, coverage is missing or stale");
                return true;
            }
            if !self.persister.verify_attr(&results_file, &cx.key) {
                debug!("{label}: rerunning, results are stale");
                return true;
            }
            return false;
        }

        let Some(cache) = &self.cache else {
            return true;
        };
        // Declared outputs are optional, so only the results and coverage decide a hit.
        let mut required = vec![self.layout.test_results_name(label, cx.run)];
        if cx.needs_coverage {
            required.push(self.layout.coverage_name(label, cx.run));
        }
        if !cache.retrieve(label, &cx.key, &required) {
            debug!("{label}: rerunning, {} not in cache", cx.key);
            return true;
        }

        let out_dir = self.layout.out_dir(label);
        for name in &self.output_names(cx) {
            let path = out_dir.join(name);
            if fs::symlink_metadata(&path).is_err() {
                continue;
            }
            if let Err(error) = self.persister.record_attr(&path, &cx.key) {
                warn!("{label}: {}", DisplayErrorChain::new(&error));
            }
        }
        false
    }

    // Loads the results of an up-to-date run. Returns false if they can't be trusted, in which
    // case the cache has been invalidated and the test needs to run again.
    fn use_cached_results(&self, cx: &RunContext<'_>) -> bool {
        let label = &cx.target.label;
        let results_file = self.layout.test_results_file(label, cx.run);

        let reason = match parse_results_file(&results_file) {
            Ok(mut suite) if suite.failures() == 0 && suite.errors() == 0 => {
                suite.package = label.package_name.clone();
                suite.name = label.name.clone();
                suite.cached = true;
                let coverage = if cx.needs_coverage {
                    coverage_or_empty(parse_coverage_file(
                        self.coverage_parser.as_ref(),
                        cx.target,
                        &self.layout.coverage_file(label, cx.run),
                        cx.run,
                    ))
                } else {
                    TestCoverage::new()
                };
                cx.target.with_results(|results| *results = suite);
                cx.target.with_coverage(|existing| *existing = coverage);
                return true;
            }
            Ok(_) => "cached results contain failures".to_owned(),
            Err(error) => format!(
                "cached results couldn't be parsed: {}",
                DisplayErrorChain::new(&error)
            ),
        };

        warn!("{label}: {reason}, invalidating cache and rerunning");
        if let Some(cache) = &self.cache {
            cache.clean(label);
        }
        if let Err(error) = self
            .persister
            .remove_test_outputs(&self.layout, cx.target, cx.run)
        {
            warn!("{label}: {}", DisplayErrorChain::new(&error));
        }
        false
    }

    fn start_worker(
        &self,
        worker_command: &str,
        command: &str,
        target: &BuildTarget,
    ) -> Result<Option<String>, WorkerStartError> {
        let Some(launcher) = &self.worker_launcher else {
            return Err(WorkerStartError::new(
                worker_command,
                "no worker launcher is configured",
            ));
        };
        let response = launcher.ensure_started(worker_command, command, target)?;
        Ok(response.command)
    }

    fn worker_failed(&self, cx: &RunContext<'_>, worker_command: &str, error: &WorkerStartError) {
        let execution = TestExecution::failure(
            TestFailure::new(WORKER_FAIL, "Failed to start test worker")
                .with_traceback(DisplayErrorChain::new(error).to_string()),
        );
        let mut case = TestCase::new(worker_command);
        case.add_execution(execution);
        cx.target.with_results(|results| {
            results.add([case]);
        });
        self.finish(cx);
    }

    fn run_local(
        &self,
        cx: &RunContext<'_>,
        command: &str,
        attempt: u32,
    ) -> (TestSuite, TestCoverage) {
        let target = cx.target;
        let label = &target.label;
        let results_file = self.layout.run_results_file(label, cx.run);
        let coverage_file = self.layout.run_coverage_file(label, cx.run);
        let env = test_env(
            &self.layout,
            target,
            cx.run,
            &EnvSettings {
                path: &self.config.path,
                coverage: cx.needs_coverage,
                test_args: &self.test_args,
            },
        );
        let request = ExecRequest {
            label: label.clone(),
            command: command.to_owned(),
            dir: self.layout.test_dir(label, cx.run),
            env,
            timeout: target.test.timeout.unwrap_or(self.config.timeout),
            run: cx.run,
            attempt,
        };

        let stopwatch = stopwatch();
        let output = self.executor.execute(&request);
        let snapshot = stopwatch.snapshot();

        let mut suite = parse_test_output(&RawTestOutput {
            label,
            results: ResultsSource::File(&results_file),
            no_test_output: target.test.no_test_output,
            stdout: &output.stdout,
            stderr: &output.stderr,
            error: output.error.as_ref(),
            duration: snapshot.duration,
        });
        suite.set_timestamp(snapshot.start_time);
        suite.timed_out = output.error.as_ref().is_some_and(RunError::is_timeout);

        let coverage = if cx.needs_coverage {
            coverage_or_empty(parse_coverage_file(
                self.coverage_parser.as_ref(),
                target,
                &coverage_file,
                cx.run,
            ))
        } else {
            TestCoverage::new()
        };
        (suite, coverage)
    }

    fn run_remote(&self, cx: &RunContext<'_>) -> (TestSuite, TestCoverage) {
        let target = cx.target;
        let stopwatch = stopwatch();
        let output = match &self.remote {
            Some(client) => client.test(cx.tid, target, cx.run),
            None => RemoteTestOutput {
                error: Some(RunError::Remote(RemoteTestError::new(
                    "no remote executor is configured",
                ))),
                ..Default::default()
            },
        };
        let snapshot = stopwatch.snapshot();

        let mut suite = parse_test_output(&RawTestOutput {
            label: &target.label,
            results: ResultsSource::Data(&output.results),
            no_test_output: target.test.no_test_output,
            stdout: &output.metadata.stdout,
            stderr: &output.metadata.stderr,
            error: output.error.as_ref(),
            duration: snapshot.duration,
        });
        suite.set_timestamp(snapshot.start_time);
        suite.timed_out = output.error.as_ref().is_some_and(RunError::is_timeout);

        let coverage = if cx.needs_coverage && !output.coverage.is_empty() {
            coverage_or_empty(
                self.coverage_parser
                    .parse(target, &output.coverage, cx.run),
            )
        } else {
            TestCoverage::new()
        };
        (suite, coverage)
    }

    // The files a run may place in its output directory, relative to it.
    fn output_names(&self, cx: &RunContext<'_>) -> Vec<String> {
        let label = &cx.target.label;
        let mut names = vec![self.layout.test_results_name(label, cx.run)];
        if cx.needs_coverage {
            names.push(self.layout.coverage_name(label, cx.run));
        }
        names.extend(cx.target.test.outputs.iter().cloned());
        names
    }

    // Moves the outputs of a passing run into place and stores them in the cache.
    fn persist_outputs(&self, cx: &RunContext<'_>) -> Result<(), PersistError> {
        let label = &cx.target.label;
        let test_dir = self.layout.test_dir(label, cx.run);
        let out_dir = self.layout.out_dir(label);

        let mut moves = vec![(
            self.layout.run_results_file(label, cx.run),
            self.layout.test_results_name(label, cx.run),
            Some(DUMMY_RESULTS),
        )];
        if cx.needs_coverage {
            moves.push((
                self.layout.run_coverage_file(label, cx.run),
                self.layout.coverage_name(label, cx.run),
                Some(DUMMY_COVERAGE),
            ));
        }
        moves.extend(
            cx.target
                .test
                .outputs
                .iter()
                .map(|output| (test_dir.join(output), output.clone(), None)),
        );

        let mut stored = Vec::with_capacity(moves.len());
        for (from, name, dummy) in moves {
            if self
                .persister
                .move_output_file(&cx.key, &from, &out_dir.join(&name), dummy)?
            {
                stored.push(name);
            }
        }

        debug!(
            "{label}: placed {} output {} for run {}",
            stored.len(),
            plural::files_str(stored.len()),
            cx.run
        );
        if let Some(cache) = &self.cache {
            cache.store(label, &cx.key, &stored);
        }
        Ok(())
    }

    fn finish(&self, cx: &RunContext<'_>) {
        let target = cx.target;
        let results = target.results();
        if let Some(uploader) = &self.uploader
            && let Err(error) = uploader.upload(&results)
        {
            warn!("{}: {}", target.label, DisplayErrorChain::new(&error));
        }

        let (status, message, failure) = summarize(&results);
        target.set_state(match status {
            TargetStatus::Tested => BuildState::Tested,
            _ => BuildState::TestFailed,
        });
        self.reporter.report(TestEvent::TestResult {
            tid: cx.tid,
            label: target.label.clone(),
            status,
            results,
            message,
            failure,
        });
    }

    fn build_error(&self, tid: usize, target: &BuildTarget, message: &str, error: &dyn Error) {
        target.set_state(BuildState::TestFailed);
        self.reporter.report(TestEvent::BuildError {
            tid,
            label: target.label.clone(),
            message: message.to_owned(),
            error: DisplayErrorChain::new(error).to_string(),
        });
    }

    fn status_message(&self, run: u32, attempt: u32, num_attempts: u32) -> String {
        let run_status = if self.num_runs > 1 {
            format!(" (run {run} of {})", self.num_runs)
        } else {
            String::new()
        };
        let flake_status = if num_attempts > 1 {
            format!(" (flake {attempt} of {num_attempts})")
        } else {
            String::new()
        };
        format!("Testing{run_status}{flake_status}...")
    }
}

// Folds one attempt into the results of its run. Repeated cases gain executions.
fn merge_attempt(run_results: &mut TestSuite, attempt: TestSuite) {
    if run_results.timestamp.is_none() {
        run_results.timestamp = attempt.timestamp;
    }
    run_results.duration += attempt.duration;
    run_results.timed_out |= attempt.timed_out;
    run_results.properties = attempt.properties;
    run_results.add(attempt.test_cases);
}

fn coverage_or_empty(result: Result<TestCoverage, CoverageParseError>) -> TestCoverage {
    result.unwrap_or_else(|error| {
        warn!("{error}");
        TestCoverage::new()
    })
}

fn summarize(results: &TestSuite) -> (TargetStatus, String, Option<TestFailure>) {
    let passed = results
        .test_cases
        .iter()
        .all(|case| case.is_success() || case.is_flaky());
    if passed {
        let (flakes, skips) = (results.flakes(), results.skips());
        let count = results.tests() - skips;
        let tests = plural::tests_str(count);
        let message = match (flakes, skips) {
            (0, 0) => format!("{count} {tests} passed."),
            (0, skips) => format!("{count} {tests} passed. {skips} skipped"),
            (flakes, 0) => format!("{count} {tests} passed ({flakes} flaky)"),
            (flakes, skips) => format!("{count} {tests} passed ({flakes} flaky). {skips} skipped"),
        };
        return (TargetStatus::Tested, message, None);
    }

    let (message, status) = if results.failures() > 0 {
        ("Tests failed", CaseStatus::Failed)
    } else if results.errors() > 0 {
        ("Tests errored", CaseStatus::Errored)
    } else {
        return (
            TargetStatus::TestFailed,
            "Something went wrong".to_owned(),
            None,
        );
    };
    let failure = results
        .test_cases
        .iter()
        .filter(|case| case.status() == status)
        .flat_map(|case| case.executions.iter().rev())
        .find_map(|execution| execution.outcome.failure())
        .cloned();
    (TargetStatus::TestFailed, message.to_owned(), failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::test_helpers::{CacheOp, RecordingCache},
        exec::ExecOutput,
        layout::TEST_RESULTS_FILE,
        remote::RemoteTestMetadata,
        target::TestSettings,
        worker::WorkerResponse,
    };
    use camino_tempfile::Utf8TempDir;
    use crossbeam_channel::Receiver;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::{sync::Mutex, time::Duration};
    use test_case::test_case;
    use testament_results::ExecutionOutcome;

    const PASSING: &str = indoc! {"
        === RUN   TestOne
        --- PASS: TestOne (0.01s)
        PASS
    "};

    const FAILING: &str = indoc! {"
        === RUN   TestOne
        --- FAIL: TestOne (0.01s)
            one_test.go:10: boom
        FAIL
    "};

    type ExecFn = dyn Fn(&ExecRequest) -> ExecOutput + Send + Sync;

    struct FakeExecutor {
        requests: Mutex<Vec<ExecRequest>>,
        f: Box<ExecFn>,
    }

    impl FakeExecutor {
        fn new(f: impl Fn(&ExecRequest) -> ExecOutput + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::default(),
                f: Box::new(f),
            })
        }

        fn requests(&self) -> Vec<ExecRequest> {
            self.requests.lock().expect("lock not poisoned").clone()
        }
    }

    impl TestExecutor for FakeExecutor {
        fn execute(&self, request: &ExecRequest) -> ExecOutput {
            self.requests
                .lock()
                .expect("lock not poisoned")
                .push(request.clone());
            (self.f)(request)
        }
    }

    fn pass(request: &ExecRequest) -> ExecOutput {
        fs::write(request.dir.join(TEST_RESULTS_FILE), PASSING).expect("wrote results");
        ExecOutput::default()
    }

    fn fail(request: &ExecRequest) -> ExecOutput {
        fs::write(request.dir.join(TEST_RESULTS_FILE), FAILING).expect("wrote results");
        ExecOutput {
            error: Some(RunError::Exit { code: Some(1) }),
            ..Default::default()
        }
    }

    fn config(dir: &Utf8TempDir) -> TestamentConfig {
        let mut config = TestamentConfig::default_config(dir.path());
        config.test_mut().xattrs = false;
        config
    }

    fn target(settings: TestSettings) -> BuildTarget {
        BuildTarget::new(BuildLabel::new("pkg", "t"), settings)
    }

    fn runner_builder(executor: Arc<FakeExecutor>) -> (TestRunnerBuilder, Receiver<TestEvent>) {
        let (sender, events) = crossbeam_channel::unbounded();
        let mut builder = TestRunnerBuilder::default();
        builder.set_executor(executor).set_reporter(Arc::new(sender));
        (builder, events)
    }

    fn messages(events: &Receiver<TestEvent>) -> Vec<String> {
        events
            .try_iter()
            .map(|event| match event {
                TestEvent::Progress { message, .. }
                | TestEvent::TestResult { message, .. }
                | TestEvent::BuildError { message, .. } => message,
            })
            .collect()
    }

    #[test]
    fn flaky_target_stops_after_first_pass() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(|request| {
            if request.attempt == 1 {
                fail(request)
            } else {
                pass(request)
            }
        });
        let cache = Arc::new(RecordingCache::new(false));
        let (mut builder, events) = runner_builder(executor.clone());
        builder.set_cache(cache.clone());
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);

        let mut settings = TestSettings::new("./t_test");
        settings.flakiness = 3;
        let target = target(settings);
        runner.test_target(0, &target, false, 1);

        assert_eq!(executor.requests().len(), 2);
        let results = target.results();
        assert_eq!(results.tests(), 1);
        assert_eq!(results.test_cases[0].executions.len(), 2);
        assert!(results.test_cases[0].is_flaky());
        assert_eq!(target.state(), BuildState::Tested);

        // Flaky results are reported as passing but never cached.
        assert!(
            !cache
                .ops()
                .iter()
                .any(|op| matches!(op, CacheOp::Store(..)))
        );
        assert_eq!(
            messages(&events),
            vec![
                "Testing (flake 1 of 3)...",
                "Testing (flake 2 of 3)...",
                "1 test passed (1 flaky)",
            ]
        );
    }

    #[test]
    fn flaky_target_that_never_passes() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(fail);
        let (builder, events) = runner_builder(executor.clone());
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);

        let mut settings = TestSettings::new("./t_test");
        settings.flakiness = 3;
        let target = target(settings);
        runner.test_target(0, &target, false, 1);

        assert_eq!(executor.requests().len(), 3);
        let results = target.results();
        assert_eq!(results.tests(), 1);
        assert_eq!(results.test_cases[0].executions.len(), 3);
        assert_eq!(target.state(), BuildState::TestFailed);

        let failure = events
            .try_iter()
            .find_map(|event| match event {
                TestEvent::TestResult {
                    message, failure, ..
                } => Some((message, failure)),
                _ => None,
            })
            .expect("result reported");
        assert_eq!(failure.0, "Tests failed");
        assert!(failure.1.is_some());
    }

    #[test]
    fn each_attempt_starts_in_a_fresh_directory() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let leftovers = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&leftovers);
        let executor = FakeExecutor::new(move |request| {
            let scratch = request.dir.join("scratch.tmp");
            seen.lock()
                .expect("lock not poisoned")
                .push(scratch.exists());
            fs::write(&scratch, "left behind").expect("wrote scratch file");
            if request.attempt == 1 {
                fail(request)
            } else {
                pass(request)
            }
        });
        let (builder, _events) = runner_builder(executor.clone());
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);

        let mut settings = TestSettings::new("./t_test");
        settings.flakiness = 3;
        let target = target(settings);
        runner.test_target(0, &target, false, 1);

        assert_eq!(executor.requests().len(), 2);
        assert_eq!(*leftovers.lock().expect("lock not poisoned"), vec![false, false]);
        assert_eq!(target.state(), BuildState::Tested);
    }

    #[test]
    fn multiple_runs_are_separate_cases() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let cache = Arc::new(RecordingCache::new(true));
        let (mut builder, events) = runner_builder(executor.clone());
        builder.set_num_runs(3).set_cache(cache.clone());
        let mut graph = BuildGraph::new();
        let mut settings = TestSettings::new("./t_test");
        // Ignored when runs are requested explicitly.
        settings.flakiness = 2;
        let label = graph.add_target(target(settings)).label.clone();
        let runner = builder.build(&config(&dir), &graph);

        for run in 1..=3 {
            runner.test(0, &label, false, run).expect("target exists");
        }

        assert_eq!(executor.requests().len(), 3);
        let results = graph.target(&label).expect("target exists").results();
        assert_eq!(results.tests(), 3);
        assert!(
            results
                .test_cases
                .iter()
                .all(|case| case.executions.len() == 1)
        );
        // Neither looked up nor stored.
        assert!(cache.ops().is_empty());
        assert!(messages(&events).contains(&"Testing (run 2 of 3)...".to_owned()));
    }

    #[test]
    fn unknown_label() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let (builder, _events) = runner_builder(FakeExecutor::new(pass));
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);
        runner
            .test(0, &BuildLabel::new("pkg", "missing"), false, 1)
            .expect_err("target doesn't exist");
    }

    #[test]
    fn up_to_date_results_are_reused() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let graph = BuildGraph::new();
        let target = target(TestSettings::new("./t_test"));

        let (builder, _events) = runner_builder(executor.clone());
        let runner = builder.build(&config(&dir), &graph);
        runner.test_target(0, &target, false, 1);
        assert_eq!(executor.requests().len(), 1);
        assert!(
            runner
                .layout()
                .test_results_file(&target.label, 1)
                .exists()
        );

        target.set_state(BuildState::Unchanged);
        let (builder, events) = runner_builder(executor.clone());
        let runner = builder.build(&config(&dir), &graph);
        runner.test_target(0, &target, false, 1);

        assert_eq!(executor.requests().len(), 1, "nothing was executed");
        let results = target.results();
        assert!(results.cached);
        assert_eq!(results.tests(), 1);
        assert_eq!(messages(&events), vec!["1 test passed."]);
    }

    #[test]
    fn stale_results_are_rerun() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let graph = BuildGraph::new();
        let target = target(TestSettings::new("./t_test"));

        let (builder, _events) = runner_builder(executor.clone());
        builder
            .build(&config(&dir), &graph)
            .test_target(0, &target, false, 1);

        // Different arguments make a different fingerprint.
        target.set_state(BuildState::Unchanged);
        let (mut builder, _events) = runner_builder(executor.clone());
        builder.set_test_args(vec!["TestOne".to_owned()]);
        builder
            .build(&config(&dir), &graph)
            .test_target(0, &target, false, 1);

        assert_eq!(executor.requests().len(), 2);
        assert_eq!(executor.requests()[1].command, "./t_test TestOne");
        assert_eq!(executor.requests()[1].env["TESTS"], "TestOne");
    }

    #[test_case(vec![], true ; "no arguments")]
    #[test_case(vec!["TestOne".to_owned()], false ; "with arguments")]
    fn store_gated_on_test_args(test_args: Vec<String>, stored: bool) {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let cache = Arc::new(RecordingCache::new(false));
        let (mut builder, _events) = runner_builder(FakeExecutor::new(pass));
        builder
            .set_cache(cache.clone())
            .set_test_args(test_args);
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);
        let target = target(TestSettings::new("./t_test"));
        runner.test_target(0, &target, false, 1);

        let stores: Vec<_> = cache
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                CacheOp::Store(_, _, files) => Some(files),
                _ => None,
            })
            .collect();
        if stored {
            assert_eq!(stores, vec![vec![".test_results_t_1".to_owned()]]);
        } else {
            assert_eq!(stores, Vec::<Vec<String>>::new());
        }
        assert_eq!(
            runner
                .layout()
                .test_results_file(&target.label, 1)
                .exists(),
            stored
        );
    }

    #[test]
    fn cache_hit_skips_execution() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let cache = Arc::new(RecordingCache::new(true));
        let (mut builder, _events) = runner_builder(executor.clone());
        builder.set_cache(cache.clone());
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);
        let target = target(TestSettings::new("./t_test"));

        // Stands in for the file the cache would have written.
        let results_file = runner.layout().test_results_file(&target.label, 1);
        fs::create_dir_all(results_file.parent().expect("has parent")).expect("created out dir");
        fs::write(&results_file, PASSING).expect("wrote results");

        runner.test_target(0, &target, false, 1);
        assert_eq!(executor.requests().len(), 0);
        assert!(target.results().cached);
        assert!(matches!(cache.ops().as_slice(), [CacheOp::Retrieve(..)]));
    }

    #[test]
    fn cached_failures_are_invalidated() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let cache = Arc::new(RecordingCache::new(true));
        let (mut builder, _events) = runner_builder(executor.clone());
        builder.set_cache(cache.clone());
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);
        let target = target(TestSettings::new("./t_test"));

        let results_file = runner.layout().test_results_file(&target.label, 1);
        fs::create_dir_all(results_file.parent().expect("has parent")).expect("created out dir");
        fs::write(&results_file, FAILING).expect("wrote results");

        runner.test_target(0, &target, false, 1);
        assert_eq!(executor.requests().len(), 1);
        assert!(!target.results().cached);
        assert_eq!(target.state(), BuildState::Tested);

        let ops = cache.ops();
        assert!(matches!(ops[0], CacheOp::Retrieve(..)));
        assert_eq!(ops[1], CacheOp::Clean(target.label.clone()));
        assert!(matches!(ops[2], CacheOp::Store(..)));
    }

    #[test]
    fn coverage_placeholder_is_persisted_and_stored() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let cache = Arc::new(RecordingCache::new(false));
        // Writes results but never any coverage.
        let executor = FakeExecutor::new(pass);
        let (mut builder, _events) = runner_builder(executor.clone());
        builder.set_coverage(true).set_cache(cache.clone());
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);
        let target = target(TestSettings::new("./t_test"));
        runner.test_target(0, &target, false, 1);

        assert_eq!(executor.requests()[0].env["COVERAGE"], "true");
        let coverage_file = runner.layout().coverage_file(&target.label, 1);
        assert_eq!(
            fs::read(&coverage_file).expect("coverage placeholder written"),
            DUMMY_COVERAGE
        );

        let ops = cache.ops();
        let [CacheOp::Retrieve(_, _, required), CacheOp::Store(_, _, stored)] = ops.as_slice()
        else {
            panic!("expected a lookup and a store, got {ops:?}");
        };
        let expected = vec![".test_results_t_1".to_owned(), ".test_coverage_t_1".to_owned()];
        assert_eq!(required, &expected);
        assert_eq!(stored, &expected);
    }

    #[test_case(false, 1 ; "coverage up to date")]
    #[test_case(true, 2 ; "coverage tag stale")]
    fn stale_coverage_forces_rerun(retag: bool, expected_runs: usize) {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let graph = BuildGraph::new();
        let target = target(TestSettings::new("./t_test"));

        let (mut builder, _events) = runner_builder(executor.clone());
        builder.set_coverage(true);
        let runner = builder.build(&config(&dir), &graph);
        runner.test_target(0, &target, false, 1);
        assert_eq!(executor.requests().len(), 1);

        let coverage_file = runner.layout().coverage_file(&target.label, 1);
        if retag {
            Persister::new(false)
                .record_attr(&coverage_file, &CacheKey::new(vec![0; 32]))
                .expect("retagged coverage");
        }

        target.set_state(BuildState::Unchanged);
        let (mut builder, _events) = runner_builder(executor.clone());
        builder.set_coverage(true);
        builder
            .build(&config(&dir), &graph)
            .test_target(0, &target, false, 1);

        assert_eq!(executor.requests().len(), expected_runs);
        assert_eq!(target.results().cached, !retag);
    }

    #[test]
    fn worker_failure_is_a_test_failure() {
        struct FailingLauncher;

        impl WorkerLauncher for FailingLauncher {
            fn ensure_started(
                &self,
                worker_command: &str,
                _test_command: &str,
                _target: &BuildTarget,
            ) -> Result<WorkerResponse, WorkerStartError> {
                Err(WorkerStartError::new(worker_command, "connection refused"))
            }
        }

        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let (mut builder, _events) = runner_builder(executor.clone());
        builder
            .set_worker_launcher(Arc::new(FailingLauncher));
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);

        let mut settings = TestSettings::new("./t_test");
        settings.worker_command = Some("//tools:worker".to_owned());
        let target = target(settings);
        runner.test_target(0, &target, false, 1);

        assert_eq!(executor.requests().len(), 0);
        let results = target.results();
        let case = results.case("", "//tools:worker").expect("worker case");
        let failure = case.executions[0]
            .outcome
            .failure()
            .expect("worker case failed");
        assert_eq!(failure.ty, WORKER_FAIL);
        assert_eq!(failure.message, "Failed to start test worker");
        assert!(failure.traceback.contains("connection refused"));
        assert_eq!(target.state(), BuildState::TestFailed);
    }

    #[test]
    fn worker_may_replace_command() {
        struct Launcher;

        impl WorkerLauncher for Launcher {
            fn ensure_started(
                &self,
                _worker_command: &str,
                test_command: &str,
                _target: &BuildTarget,
            ) -> Result<WorkerResponse, WorkerStartError> {
                Ok(WorkerResponse {
                    command: Some(format!("{test_command} --worker")),
                })
            }
        }

        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let (mut builder, events) = runner_builder(executor.clone());
        builder.set_worker_launcher(Arc::new(Launcher));
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);

        let mut settings = TestSettings::new("./t_test");
        settings.worker_command = Some("//tools:worker".to_owned());
        runner.test_target(0, &target(settings), false, 1);

        assert_eq!(executor.requests()[0].command, "./t_test --worker");
        assert_eq!(
            messages(&events),
            vec!["Starting test worker...", "Testing...", "1 test passed."]
        );
    }

    #[test]
    fn remote_runs_bypass_local_cache() {
        struct Remote;

        impl RemoteClient for Remote {
            fn test(&self, _tid: usize, _target: &BuildTarget, _run: u32) -> RemoteTestOutput {
                RemoteTestOutput {
                    metadata: RemoteTestMetadata {
                        stdout: b"remote".to_vec(),
                        stderr: vec![],
                    },
                    results: vec![PASSING.as_bytes().to_vec()],
                    ..Default::default()
                }
            }
        }

        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let cache = Arc::new(RecordingCache::new(true));
        let (mut builder, _events) = runner_builder(executor.clone());
        builder
            .set_cache(cache.clone())
            .set_remote_client(Arc::new(Remote));
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);
        let target = target(TestSettings::new("./t_test"));
        target.set_state(BuildState::Unchanged);
        runner.test_target(0, &target, true, 1);

        assert_eq!(executor.requests().len(), 0);
        assert!(cache.ops().is_empty());
        assert_eq!(target.results().passes(), 1);
        assert_eq!(target.state(), BuildState::Tested);
        assert!(
            !runner
                .layout()
                .test_results_file(&target.label, 1)
                .exists()
        );
    }

    #[test]
    fn prepare_shell_stops_before_running() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(pass);
        let (mut builder, _events) = runner_builder(executor.clone());
        builder.set_prepare_shell(true);
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);
        let target = target(TestSettings::new("./t_test"));
        runner.test_target(0, &target, false, 1);

        assert_eq!(executor.requests().len(), 0);
        assert_eq!(target.state(), BuildState::Stopped);
        assert!(runner.layout().test_dir(&target.label, 1).is_dir());
    }

    #[test]
    fn timeout_is_recorded() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let executor = FakeExecutor::new(|request| ExecOutput {
            error: Some(RunError::TimedOut(request.timeout)),
            ..Default::default()
        });
        let (builder, events) = runner_builder(executor.clone());
        let graph = BuildGraph::new();
        let runner = builder.build(&config(&dir), &graph);
        let mut settings = TestSettings::new("./t_test");
        settings.timeout = Some(Duration::from_secs(3));
        let target = target(settings);
        runner.test_target(0, &target, false, 1);

        assert_eq!(executor.requests()[0].timeout, Duration::from_secs(3));
        let results = target.results();
        assert!(results.timed_out);
        assert_eq!(results.errors(), 1);
        assert_eq!(messages(&events).last().map(String::as_str), Some("Tests errored"));
    }

    #[test]
    fn clean_workdirs_removes_run_directory() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let mut config = config(&dir);
        config.test_mut().clean_workdirs = true;
        let (builder, _events) = runner_builder(FakeExecutor::new(pass));
        let graph = BuildGraph::new();
        let runner = builder.build(&config, &graph);
        let target = target(TestSettings::new("./t_test"));
        runner.test_target(0, &target, false, 1);

        assert!(!runner.layout().test_dir(&target.label, 1).exists());
        assert!(
            runner
                .layout()
                .test_results_file(&target.label, 1)
                .exists()
        );
    }

    fn case(name: &str, outcomes: Vec<ExecutionOutcome>) -> TestCase {
        let mut case = TestCase::new(name);
        for outcome in outcomes {
            case.add_execution(TestExecution::new(outcome));
        }
        case
    }

    fn failure(message: &str) -> TestFailure {
        TestFailure::new("Failure", message)
    }

    #[test_case(vec![], "0 tests passed." ; "empty")]
    #[test_case(vec![case("a", vec![ExecutionOutcome::Pass])], "1 test passed." ; "one pass")]
    #[test_case(
        vec![
            case("a", vec![ExecutionOutcome::Pass]),
            case("b", vec![ExecutionOutcome::Skip { message: None }]),
        ],
        "1 test passed. 1 skipped"
        ; "skipped"
    )]
    #[test_case(
        vec![
            case("a", vec![ExecutionOutcome::Pass]),
            case("b", vec![ExecutionOutcome::Failure(failure("x")), ExecutionOutcome::Pass]),
        ],
        "2 tests passed (1 flaky)"
        ; "flaky"
    )]
    #[test_case(
        vec![
            case("a", vec![ExecutionOutcome::Error(failure("broken"))]),
            case("b", vec![ExecutionOutcome::Failure(failure("first"))]),
        ],
        "Tests failed"
        ; "failure wins over error"
    )]
    #[test_case(
        vec![case("a", vec![ExecutionOutcome::Error(failure("broken"))])],
        "Tests errored"
        ; "errored"
    )]
    fn summary_message(cases: Vec<TestCase>, expected: &str) {
        let mut suite = TestSuite::new("pkg", "t");
        suite.add(cases);
        let (status, message, failure) = summarize(&suite);
        assert_eq!(message, expected);
        match status {
            TargetStatus::Tested => assert!(failure.is_none()),
            _ => assert!(failure.is_some()),
        }
    }

    #[test]
    fn summary_reports_first_failure() {
        let mut suite = TestSuite::new("pkg", "t");
        suite.add([
            case("a", vec![ExecutionOutcome::Failure(failure("first"))]),
            case("b", vec![ExecutionOutcome::Failure(failure("second"))]),
        ]);
        let (_, _, failure) = summarize(&suite);
        assert_eq!(failure.map(|failure| failure.message).as_deref(), Some("first"));
    }
}
