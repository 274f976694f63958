// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JUnit/XUnit XML parsing.
//!
//! The document is first read into a small element tree, then interpreted. Besides the usual
//! `failure`/`error`/`skipped` children, the Maven Surefire `flakyFailure`/`flakyError` and
//! `rerunFailure`/`rerunError` extensions are understood as earlier executions of the same case.

use crate::{
    ExecutionOutcome, ResultsParseErrorKind, TestCase, TestExecution, TestFailure, TestSuite,
};
use chrono::DateTime;
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use std::time::Duration;

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, ResultsParseErrorKind> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = vec![];
        for attribute in start.attributes() {
            let attribute = attribute.map_err(quick_xml::Error::from)?;
            let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
            let value = attribute.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Default::default()
        })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    fn duration(&self) -> Result<Option<Duration>, ResultsParseErrorKind> {
        let Some(value) = self.attr("time") else {
            return Ok(None);
        };
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }
        let invalid = |error| ResultsParseErrorKind::InvalidTime {
            element: self.name.clone(),
            value: value.to_owned(),
            error,
        };
        // Some producers emit thousands separators.
        let secs: f64 = value.replace(',', "").parse().map_err(|e| invalid(Some(e)))?;
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|_| invalid(None))
    }
}

fn read_tree(input: &str) -> Result<Element, ResultsParseErrorKind> {
    let mut reader = Reader::from_str(input);
    let mut stack: Vec<Element> = vec![];
    let mut root = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(Element::from_start(&start)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                // Mismatched end tags are rejected by the reader itself.
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut root, element);
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(cdata) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(ResultsParseErrorKind::UnclosedElement(open.name));
    }
    root.ok_or_else(|| ResultsParseErrorKind::UnexpectedRoot(String::new()))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        // Only the first root element counts.
        None => {
            root.get_or_insert(element);
        }
    }
}

pub(super) fn parse(input: &str) -> Result<TestSuite, ResultsParseErrorKind> {
    let root = read_tree(input)?;
    let mut suite = TestSuite::default();
    match root.name.as_str() {
        "testsuites" => {
            for child in root.children_named("testsuite") {
                parse_testsuite(child, &mut suite)?;
            }
        }
        "testsuite" => parse_testsuite(&root, &mut suite)?,
        other => return Err(ResultsParseErrorKind::UnexpectedRoot(other.to_owned())),
    }
    Ok(suite)
}

fn parse_testsuite(element: &Element, suite: &mut TestSuite) -> Result<(), ResultsParseErrorKind> {
    if suite.timestamp.is_none() {
        suite.timestamp = element
            .attr("timestamp")
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok());
    }
    if let Some(duration) = element.duration()? {
        suite.duration += duration;
    }
    if let Some(properties) = element.child("properties") {
        for property in properties.children_named("property") {
            if let Some(name) = property.attr("name") {
                let value = property.attr("value").unwrap_or(property.text.trim());
                suite.add_property(name, value);
            }
        }
    }

    let mut cases = vec![];
    for child in &element.children {
        match child.name.as_str() {
            "testcase" => cases.push(parse_testcase(child)?),
            // Nested suites are flattened.
            "testsuite" => parse_testsuite(child, suite)?,
            _ => {}
        }
    }
    suite.add(cases);
    Ok(())
}

fn parse_testcase(element: &Element) -> Result<TestCase, ResultsParseErrorKind> {
    let mut case = TestCase::new(element.attr("name").unwrap_or_default());
    case.set_classname(element.attr("classname").unwrap_or_default());

    let mut primary_outcome = ExecutionOutcome::Pass;
    for child in &element.children {
        let execution = match child.name.as_str() {
            "failure" => {
                primary_outcome = ExecutionOutcome::Failure(failure_details(child, "Failure"));
                continue;
            }
            "error" => {
                primary_outcome = ExecutionOutcome::Error(failure_details(child, "Error"));
                continue;
            }
            "skipped" => {
                primary_outcome = ExecutionOutcome::Skip {
                    message: child.attr("message").map(str::to_owned),
                };
                continue;
            }
            "flakyFailure" | "rerunFailure" => {
                TestExecution::failure(failure_details(child, "Failure"))
            }
            "flakyError" | "rerunError" => TestExecution::error(failure_details(child, "Error")),
            _ => continue,
        };
        case.add_execution(with_output_and_time(execution, child)?);
    }

    let primary = with_output_and_time(TestExecution::new(primary_outcome), element)?;
    case.add_execution(primary);
    Ok(case)
}

fn failure_details(element: &Element, default_ty: &str) -> TestFailure {
    let ty = element.attr("type").unwrap_or(default_ty);
    let text = element.text.trim();
    let message = match element.attr("message") {
        Some(message) => message.to_owned(),
        None => text.lines().next().unwrap_or_default().to_owned(),
    };
    let traceback = match element.child("stackTrace") {
        Some(stack_trace) => stack_trace.text.trim(),
        None => text,
    };
    TestFailure::new(ty, message).with_traceback(traceback)
}

fn with_output_and_time(
    mut execution: TestExecution,
    element: &Element,
) -> Result<TestExecution, ResultsParseErrorKind> {
    if let Some(duration) = element.duration()? {
        execution.set_duration(duration);
    }
    if let Some(stdout) = element.child("system-out") {
        execution.set_stdout(stdout.text.trim());
    }
    if let Some(stderr) = element.child("system-err") {
        execution.set_stderr(stderr.text.trim());
    }
    Ok(execution)
}
