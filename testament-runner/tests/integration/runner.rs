// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use crossbeam_channel::Receiver;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::{
    fs,
    sync::Arc,
    time::{Duration, Instant},
};
use testament_runner::{
    config::TestamentConfig,
    graph::BuildGraph,
    label::BuildLabel,
    reporter::TestEvent,
    runner::{TestRunner, TestRunnerBuilder},
    target::{BuildState, BuildTarget, TestSettings},
};

fn label() -> BuildLabel {
    BuildLabel::new("pkg", "t")
}

fn graph_with(settings: TestSettings) -> BuildGraph {
    let mut graph = BuildGraph::new();
    graph.add_target(BuildTarget::new(label(), settings));
    graph
}

fn runner<'g>(
    config: &TestamentConfig,
    graph: &'g BuildGraph,
) -> (TestRunner<'g>, Receiver<TestEvent>) {
    let (sender, events) = crossbeam_channel::unbounded();
    let mut builder = TestRunnerBuilder::default();
    builder.set_reporter(Arc::new(sender));
    (builder.build(config, graph), events)
}

fn state(graph: &BuildGraph) -> Option<BuildState> {
    graph.target(&label()).map(|target| target.state())
}

#[test]
fn passing_test() -> Result<()> {
    let repo = RepoFixture::new()?;
    let graph = graph_with(TestSettings::new(repo.recording_command(PASSING_GO)));
    let config = repo.config();
    let (runner, events) = runner(&config, &graph);

    runner.test(0, &label(), false, 1)?;
    runner.shutdown();

    assert_eq!(last_result_message(&events).as_deref(), Some("1 test passed."));
    assert_eq!(state(&graph), Some(BuildState::Tested));
    assert_eq!(repo.run_count(), 1);
    let results_file = repo.layout().test_results_file(&label(), 1);
    ensure!(results_file.exists(), "results were moved into place");
    Ok(())
}

#[test]
fn failing_test() -> Result<()> {
    let repo = RepoFixture::new()?;
    let command = format!("{}; exit 1", repo.recording_command(FAILING_GO));
    let graph = graph_with(TestSettings::new(command));
    let config = repo.config();
    let (runner, events) = runner(&config, &graph);

    runner.test(0, &label(), false, 1)?;

    assert_eq!(last_result_message(&events).as_deref(), Some("Tests failed"));
    assert_eq!(state(&graph), Some(BuildState::TestFailed));
    let results_file = repo.layout().test_results_file(&label(), 1);
    ensure!(!results_file.exists(), "failed results are not moved into place");
    Ok(())
}

#[test]
fn nonzero_exit_with_passing_results_fails() -> Result<()> {
    let repo = RepoFixture::new()?;
    let command = format!("{}; exit 3", repo.recording_command(PASSING_GO));
    let graph = graph_with(TestSettings::new(command));
    let config = repo.config();
    let (runner, _events) = runner(&config, &graph);

    runner.test(0, &label(), false, 1)?;

    assert_eq!(state(&graph), Some(BuildState::TestFailed));
    Ok(())
}

#[test]
fn flaky_test_is_retried() -> Result<()> {
    let repo = RepoFixture::new()?;
    let marker = repo.root().join("attempted");
    let command = format!(
        "if [ -e '{marker}' ]; then {pass}; else touch '{marker}'; {fail}; exit 1; fi",
        pass = repo.recording_command(PASSING_GO),
        fail = repo.recording_command(FAILING_GO),
    );
    let mut settings = TestSettings::new(command);
    settings.flakiness = 3;
    let graph = graph_with(settings);
    let config = repo.config();
    let (runner, events) = runner(&config, &graph);

    runner.test(0, &label(), false, 1)?;

    assert_eq!(
        last_result_message(&events).as_deref(),
        Some("1 test passed (1 flaky)")
    );
    assert_eq!(repo.run_count(), 2);
    Ok(())
}

#[test]
fn dir_cache_reuses_results() -> Result<()> {
    let repo = RepoFixture::new()?;
    let mut config = repo.config();
    config.cache_mut().dir = "cache".into();
    let command = repo.recording_command(PASSING_GO);

    {
        let graph = graph_with(TestSettings::new(command.clone()));
        let (runner, _events) = runner(&config, &graph);
        runner.test(0, &label(), false, 1)?;
        runner.shutdown();
    }
    assert_eq!(repo.run_count(), 1);
    fs::remove_dir_all(repo.layout().out_dir(&label()))?;

    let graph = graph_with(TestSettings::new(command));
    let (runner, events) = runner(&config, &graph);
    runner.test(0, &label(), false, 1)?;
    runner.shutdown();

    assert_eq!(repo.run_count(), 1, "second run was served from the cache");
    assert_eq!(last_result_message(&events).as_deref(), Some("1 test passed."));
    let target = graph.target(&label()).expect("target exists");
    ensure!(target.results().cached, "results are marked as cached");
    ensure!(
        repo.layout().test_results_file(&label(), 1).exists(),
        "results were restored"
    );
    Ok(())
}

#[test]
fn dir_cache_restores_declared_outputs() -> Result<()> {
    let repo = RepoFixture::new()?;
    let mut config = repo.config();
    config.cache_mut().dir = "cache".into();
    let command = format!("echo log > produced.log; {}", repo.recording_command(PASSING_GO));
    let settings = || {
        let mut settings = TestSettings::new(command.clone());
        // Only one of these is ever written.
        settings.outputs = vec!["produced.log".to_owned(), "missing.log".to_owned()];
        settings
    };

    {
        let graph = graph_with(settings());
        let (runner, _events) = runner(&config, &graph);
        runner.test(0, &label(), false, 1)?;
        runner.shutdown();
    }
    let out_dir = repo.layout().out_dir(&label());
    fs::remove_dir_all(&out_dir)?;

    let graph = graph_with(settings());
    let (runner, _events) = runner(&config, &graph);
    runner.test(0, &label(), false, 1)?;
    runner.shutdown();

    assert_eq!(repo.run_count(), 1, "second run was served from the cache");
    assert_eq!(fs::read_to_string(out_dir.join("produced.log"))?, "log\n");
    ensure!(!out_dir.join("missing.log").exists(), "nothing invented");
    Ok(())
}

#[test]
fn timeout_kills_test() -> Result<()> {
    let repo = RepoFixture::new()?;
    let mut settings = TestSettings::new("exec sleep 10");
    settings.timeout = Some(Duration::from_millis(200));
    let graph = graph_with(settings);
    let config = repo.config();
    let (runner, _events) = runner(&config, &graph);

    let start = Instant::now();
    runner.test(0, &label(), false, 1)?;

    ensure!(
        start.elapsed() < Duration::from_secs(5),
        "test was killed, took {:?}",
        start.elapsed()
    );
    assert_eq!(state(&graph), Some(BuildState::TestFailed));
    let target = graph.target(&label()).expect("target exists");
    ensure!(target.results().timed_out, "timeout is recorded");
    Ok(())
}

#[test]
fn test_environment() -> Result<()> {
    let repo = RepoFixture::new()?;
    let command = format!(
        "[ \"$GREETING\" = hello ] && [ \"$PKG\" = pkg ] && [ \"$NAME\" = t ] \
         && [ \"$TEST_RUN\" = 1 ] || exit 1; {}",
        repo.recording_command(PASSING_GO)
    );
    let mut settings = TestSettings::new(command);
    settings.env = btreemap! { "GREETING".to_owned() => "hello".to_owned() };
    let graph = graph_with(settings);
    let config = repo.config();
    let (runner, events) = runner(&config, &graph);

    runner.test(0, &label(), false, 1)?;

    assert_eq!(last_result_message(&events).as_deref(), Some("1 test passed."));
    Ok(())
}
