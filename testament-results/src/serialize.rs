// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialize [`TestSuites`] as JUnit XML.
//!
//! Each case is written once. Its last execution becomes the primary status, and earlier failed
//! executions are written as `flakyFailure`/`flakyError` (when the case eventually passed) or
//! `rerunFailure`/`rerunError` (when it did not).

use crate::{ExecutionOutcome, SerializeError, TestCase, TestExecution, TestSuite, TestSuites};
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};
use std::{io, time::Duration};

static TESTSUITES_TAG: &str = "testsuites";
static TESTSUITE_TAG: &str = "testsuite";
static TESTCASE_TAG: &str = "testcase";
static PROPERTIES_TAG: &str = "properties";
static PROPERTY_TAG: &str = "property";
static FAILURE_TAG: &str = "failure";
static ERROR_TAG: &str = "error";
static SKIPPED_TAG: &str = "skipped";
static FLAKY_FAILURE_TAG: &str = "flakyFailure";
static FLAKY_ERROR_TAG: &str = "flakyError";
static RERUN_FAILURE_TAG: &str = "rerunFailure";
static RERUN_ERROR_TAG: &str = "rerunError";
static STACK_TRACE_TAG: &str = "stackTrace";
static SYSTEM_OUT_TAG: &str = "system-out";
static SYSTEM_ERR_TAG: &str = "system-err";

pub(crate) fn serialize_suites(
    suites: &TestSuites,
    writer: impl io::Write,
) -> Result<(), SerializeError> {
    let mut writer = Writer::new_with_indent(writer, b' ', 4);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let TestSuites { name, suites } = suites;
    let mut tag = BytesStart::new(TESTSUITES_TAG);
    tag.push_attribute(("name", name.as_str()));
    tag.push_attribute(("tests", suites.iter().map(TestSuite::tests).sum::<usize>().to_string().as_str()));
    tag.push_attribute(("failures", suites.iter().map(TestSuite::failures).sum::<usize>().to_string().as_str()));
    tag.push_attribute(("errors", suites.iter().map(TestSuite::errors).sum::<usize>().to_string().as_str()));
    tag.push_attribute((
        "time",
        serialize_time(suites.iter().map(|suite| suite.duration).sum()).as_str(),
    ));
    writer.write_event(Event::Start(tag))?;

    for suite in suites {
        serialize_suite(suite, &mut writer)?;
    }

    writer.write_event(Event::End(BytesEnd::new(TESTSUITES_TAG)))?;
    // Add a trailing newline.
    writer.write_indent()?;
    Ok(())
}

fn serialize_suite(
    suite: &TestSuite,
    writer: &mut Writer<impl io::Write>,
) -> Result<(), SerializeError> {
    // Use the destructuring syntax to ensure that all fields are handled.
    let TestSuite {
        package,
        name,
        timestamp,
        duration,
        timed_out,
        cached,
        properties,
        test_cases,
    } = suite;

    let mut tag = BytesStart::new(TESTSUITE_TAG);
    tag.push_attribute(("name", name.as_str()));
    if !package.is_empty() {
        tag.push_attribute(("package", package.as_str()));
    }
    tag.push_attribute(("tests", suite.tests().to_string().as_str()));
    tag.push_attribute(("failures", suite.failures().to_string().as_str()));
    tag.push_attribute(("errors", suite.errors().to_string().as_str()));
    tag.push_attribute(("skipped", suite.skips().to_string().as_str()));
    tag.push_attribute(("time", serialize_time(*duration).as_str()));
    if let Some(timestamp) = timestamp {
        tag.push_attribute(("timestamp", timestamp.to_rfc3339().as_str()));
    }
    if *timed_out {
        tag.push_attribute(("timed-out", "true"));
    }
    if *cached {
        tag.push_attribute(("cached", "true"));
    }
    writer.write_event(Event::Start(tag))?;

    if !properties.is_empty() {
        writer.write_event(Event::Start(BytesStart::new(PROPERTIES_TAG)))?;
        for (name, value) in properties {
            let mut property = BytesStart::new(PROPERTY_TAG);
            property.push_attribute(("name", name.as_str()));
            property.push_attribute(("value", value.as_str()));
            writer.write_event(Event::Empty(property))?;
        }
        writer.write_event(Event::End(BytesEnd::new(PROPERTIES_TAG)))?;
    }

    for case in test_cases {
        serialize_case(case, writer)?;
    }

    writer.write_event(Event::End(BytesEnd::new(TESTSUITE_TAG)))?;
    Ok(())
}

fn serialize_case(case: &TestCase, writer: &mut Writer<impl io::Write>) -> Result<(), SerializeError> {
    let Some((primary, earlier)) = case.executions.split_last() else {
        return Ok(());
    };
    let passed_eventually = matches!(primary.outcome, ExecutionOutcome::Pass);

    let mut tag = BytesStart::new(TESTCASE_TAG);
    tag.push_attribute(("name", case.name.as_str()));
    if !case.classname.is_empty() {
        tag.push_attribute(("classname", case.classname.as_str()));
    }
    tag.push_attribute(("time", serialize_time(case.duration()).as_str()));
    writer.write_event(Event::Start(tag))?;

    match &primary.outcome {
        ExecutionOutcome::Pass => {}
        ExecutionOutcome::Failure(failure) | ExecutionOutcome::Error(failure) => {
            let tag_name = if matches!(primary.outcome, ExecutionOutcome::Failure(_)) {
                FAILURE_TAG
            } else {
                ERROR_TAG
            };
            let mut tag = BytesStart::new(tag_name);
            tag.push_attribute(("message", failure.message.as_str()));
            tag.push_attribute(("type", failure.ty.as_str()));
            serialize_with_text(tag, &failure.traceback, writer)?;
        }
        ExecutionOutcome::Skip { message } => {
            let mut tag = BytesStart::new(SKIPPED_TAG);
            if let Some(message) = message {
                tag.push_attribute(("message", message.as_str()));
            }
            writer.write_event(Event::Empty(tag))?;
        }
    }

    for execution in earlier {
        serialize_rerun(execution, passed_eventually, writer)?;
    }

    serialize_output(SYSTEM_OUT_TAG, &primary.stdout, writer)?;
    serialize_output(SYSTEM_ERR_TAG, &primary.stderr, writer)?;

    writer.write_event(Event::End(BytesEnd::new(TESTCASE_TAG)))?;
    Ok(())
}

fn serialize_rerun(
    execution: &TestExecution,
    passed_eventually: bool,
    writer: &mut Writer<impl io::Write>,
) -> Result<(), SerializeError> {
    let (tag_name, failure) = match (&execution.outcome, passed_eventually) {
        (ExecutionOutcome::Failure(failure), true) => (FLAKY_FAILURE_TAG, failure),
        (ExecutionOutcome::Error(failure), true) => (FLAKY_ERROR_TAG, failure),
        (ExecutionOutcome::Failure(failure), false) => (RERUN_FAILURE_TAG, failure),
        (ExecutionOutcome::Error(failure), false) => (RERUN_ERROR_TAG, failure),
        // JUnit has nowhere to put an earlier pass or skip.
        (ExecutionOutcome::Pass | ExecutionOutcome::Skip { .. }, _) => return Ok(()),
    };

    let mut tag = BytesStart::new(tag_name);
    tag.push_attribute(("message", failure.message.as_str()));
    tag.push_attribute(("type", failure.ty.as_str()));
    if let Some(duration) = execution.duration {
        tag.push_attribute(("time", serialize_time(duration).as_str()));
    }
    writer.write_event(Event::Start(tag))?;
    serialize_output(STACK_TRACE_TAG, &failure.traceback, writer)?;
    serialize_output(SYSTEM_OUT_TAG, &execution.stdout, writer)?;
    serialize_output(SYSTEM_ERR_TAG, &execution.stderr, writer)?;
    writer.write_event(Event::End(BytesEnd::new(tag_name)))?;
    Ok(())
}

fn serialize_with_text(
    tag: BytesStart<'_>,
    text: &str,
    writer: &mut Writer<impl io::Write>,
) -> Result<(), SerializeError> {
    if text.is_empty() {
        writer.write_event(Event::Empty(tag))?;
        return Ok(());
    }
    let end = BytesEnd::new(String::from_utf8_lossy(tag.name().as_ref()).into_owned());
    writer.write_event(Event::Start(tag))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(end))?;
    Ok(())
}

fn serialize_output(
    tag_name: &'static str,
    output: &str,
    writer: &mut Writer<impl io::Write>,
) -> Result<(), SerializeError> {
    if output.is_empty() {
        return Ok(());
    }
    writer.write_event(Event::Start(BytesStart::new(tag_name)))?;
    writer.write_event(Event::Text(BytesText::new(output)))?;
    writer.write_event(Event::End(BytesEnd::new(tag_name)))?;
    Ok(())
}

// Serialize time as seconds with 3 decimal points.
fn serialize_time(time: Duration) -> String {
    format!("{:.3}", time.as_secs_f64())
}
