// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`], which tests one run of one target at a
//! time. Scheduling targets across threads is up to the caller.

mod imp;
mod prepare;

pub use imp::*;
