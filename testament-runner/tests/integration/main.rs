// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod fixtures;
mod http_cache;
#[cfg(unix)]
mod runner;
#[cfg(unix)]
mod upload;
