// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use std::{fs, sync::Once};
use testament_runner::{
    config::TestamentConfig, label::BuildLabel, layout::RepoLayout, reporter::TestEvent,
};

pub(crate) const PASSING_GO: &str = "=== RUN   TestOne\n--- PASS: TestOne (0.00s)\nPASS\n";
pub(crate) const FAILING_GO: &str =
    "=== RUN   TestOne\n--- FAIL: TestOne (0.00s)\n    one_test.go:3: boom\nFAIL\n";

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = color_eyre::install();
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// A scratch repository.
pub(crate) struct RepoFixture {
    dir: Utf8TempDir,
}

impl RepoFixture {
    pub(crate) fn new() -> Result<Self> {
        test_init();
        Ok(Self {
            dir: Utf8TempDir::new()?,
        })
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        self.dir.path()
    }

    pub(crate) fn layout(&self) -> RepoLayout {
        RepoLayout::new(self.root())
    }

    /// The default configuration, with sidecar tags so results don't depend on the filesystem.
    pub(crate) fn config(&self) -> TestamentConfig {
        let mut config = TestamentConfig::default_config(self.root());
        config.test_mut().xattrs = false;
        config
    }

    /// Writes a file into a target's output directory.
    pub(crate) fn write_output(
        &self,
        label: &BuildLabel,
        name: &str,
        contents: &str,
    ) -> Result<Utf8PathBuf> {
        let path = self.layout().out_dir(label).join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// The number of lines in `runs.log` at the root, which test commands append to.
    pub(crate) fn run_count(&self) -> usize {
        fs::read_to_string(self.root().join("runs.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    /// A shell command that records that it ran, then writes `results` to the results file.
    pub(crate) fn recording_command(&self, results: &str) -> String {
        format!(
            "echo run >> '{}'; printf '{}' > \"$RESULTS_FILE\"",
            self.root().join("runs.log"),
            results.replace('\n', "\\n")
        )
    }
}

/// Returns the summary message of the last result event.
pub(crate) fn last_result_message(events: &crossbeam_channel::Receiver<TestEvent>) -> Option<String> {
    events
        .try_iter()
        .filter_map(|event| match event {
            TestEvent::TestResult { message, .. } => Some(message),
            _ => None,
        })
        .last()
}
