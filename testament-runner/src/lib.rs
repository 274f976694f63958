// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Test execution and result caching for the testament build tool.
//!
//! For each run of a target, the [`runner::TestRunner`] derives a fingerprint of everything the
//! test depends on, decides whether earlier results can be reused, and otherwise runs the test,
//! retrying flaky targets. Results from a passing run are moved into place, tagged with their
//! fingerprint and stored in a [`cache::Cache`].

pub mod cache;
pub mod config;
pub mod coverage;
pub mod errors;
pub mod exec;
pub mod fingerprint;
pub mod graph;
mod helpers;
pub mod label;
pub mod layout;
pub mod output;
pub mod persist;
pub mod remote;
pub mod reporter;
pub mod runner;
pub mod target;
mod time;
pub mod upload;
pub mod worker;
