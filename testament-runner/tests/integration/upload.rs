// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use std::sync::Arc;
use testament_runner::{
    graph::BuildGraph,
    label::BuildLabel,
    runner::TestRunnerBuilder,
    target::{BuildTarget, TestSettings},
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

#[tokio::test(flavor = "multi_thread")]
async fn results_are_posted_after_testing() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/results"))
        .and(header("Content-Type", "application/xml"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let repo = RepoFixture::new()?;
    let mut config = repo.config();
    config.test_mut().upload = format!("{}/results", server.uri());
    let command = repo.recording_command(PASSING_GO);

    let message = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
        let label = BuildLabel::new("pkg", "t");
        let mut graph = BuildGraph::new();
        graph.add_target(BuildTarget::new(label.clone(), TestSettings::new(command)));

        let (sender, events) = crossbeam_channel::unbounded();
        let mut builder = TestRunnerBuilder::default();
        builder.set_reporter(Arc::new(sender));
        let runner = builder.build(&config, &graph);
        runner.test(0, &label, false, 1)?;
        runner.shutdown();
        Ok(last_result_message(&events))
    })
    .await??;
    ensure!(
        message.as_deref() == Some("1 test passed."),
        "unexpected message {message:?}"
    );

    let requests = server
        .received_requests()
        .await
        .expect("request recording is enabled");
    ensure!(requests.len() == 1, "one upload");
    let body = String::from_utf8(requests[0].body.clone())?;
    ensure!(body.contains("<testsuite "), "body is JUnit XML: {body}");
    ensure!(body.contains(r#"name="t""#), "suite is named after the target: {body}");
    ensure!(body.contains(r#"package="pkg""#), "suite carries the package: {body}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_upload_does_not_fail_the_test() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let repo = RepoFixture::new()?;
    let mut config = repo.config();
    config.test_mut().upload = server.uri();
    let command = repo.recording_command(PASSING_GO);

    let message = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
        let label = BuildLabel::new("pkg", "t");
        let mut graph = BuildGraph::new();
        graph.add_target(BuildTarget::new(label.clone(), TestSettings::new(command)));

        let (sender, events) = crossbeam_channel::unbounded();
        let mut builder = TestRunnerBuilder::default();
        builder.set_reporter(Arc::new(sender));
        builder.build(&config, &graph).test(0, &label, false, 1)?;
        Ok(last_result_message(&events))
    })
    .await??;

    ensure!(
        message.as_deref() == Some("1 test passed."),
        "unexpected message {message:?}"
    );
    Ok(())
}
