// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The canonical test result model used by testament.
//!
//! A [`TestSuite`] holds the results of testing one target. Each [`TestCase`] owns one
//! [`TestExecution`] per physical attempt, so a flaky test that needed three attempts is a single
//! case with three executions.
//!
//! Results files written by tests are read with [`parse_results_file`] (JUnit/XUnit XML or Go test
//! output), and aggregated results can be written back out as JUnit XML through [`TestSuites`].

mod errors;
mod parse;
mod report;
mod serialize;

pub use errors::*;
pub use parse::*;
pub use report::*;
