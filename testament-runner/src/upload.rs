// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Uploading results to a collection server.

use crate::errors::UploadError;
use std::time::Duration;
use testament_results::{TestSuite, TestSuites};
use tracing::debug;
use ureq::Agent;

/// POSTs results to a URL as JUnit XML.
#[derive(Debug)]
pub struct ResultsUploader {
    url: String,
    agent: Agent,
}

impl ResultsUploader {
    /// Creates an uploader for the given URL.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            url: url.into(),
            agent,
        }
    }

    /// Uploads the results of one target.
    pub fn upload(&self, suite: &TestSuite) -> Result<(), UploadError> {
        let mut suites = TestSuites::new("testament");
        suites.add_suite(suite.clone());
        let body = suites.to_junit_xml()?;

        let response = self
            .agent
            .post(&self.url)
            .header("Content-Type", "application/xml")
            .send(body.as_bytes())
            .map_err(|error| UploadError::Request {
                url: self.url.clone(),
                error: Box::new(error),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        debug!(
            "uploaded results for {}:{} to {}",
            suite.package, suite.name, self.url
        );
        Ok(())
    }
}
