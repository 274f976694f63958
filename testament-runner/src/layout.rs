// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Where test outputs live on disk.

use crate::label::BuildLabel;
use camino::{Utf8Path, Utf8PathBuf};

/// The directory under the repository root that holds all generated files.
pub const OUT_DIR: &str = "testament-out";

/// The name of the results file a test writes inside its run directory.
pub const TEST_RESULTS_FILE: &str = "test.results";

/// The name of the coverage file a test writes inside its run directory.
pub const COVERAGE_FILE: &str = "test.coverage";

/// Paths for a repository.
///
/// Methods returning paths come in two forms: relative to the repository root (`*_rel`), which is
/// how paths are named inside cache archives, and absolute.
#[derive(Clone, Debug)]
pub struct RepoLayout {
    root: Utf8PathBuf,
}

impl RepoLayout {
    /// Creates a layout rooted at the given repository root.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The repository root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// `testament-out/bin/<pkg>`, relative to the root.
    pub fn out_dir_rel(&self, label: &BuildLabel) -> Utf8PathBuf {
        join_package(Utf8Path::new(OUT_DIR).join("bin"), &label.package_name)
    }

    /// The directory a target's permanent outputs are written to.
    pub fn out_dir(&self, label: &BuildLabel) -> Utf8PathBuf {
        self.root.join(self.out_dir_rel(label))
    }

    /// The directory a single run of a target's tests executes in.
    pub fn test_dir(&self, label: &BuildLabel, run: u32) -> Utf8PathBuf {
        join_package(self.root.join(OUT_DIR).join("tmp"), &label.package_name)
            .join(format!("{}._test", label.name))
            .join(format!("run_{run}"))
    }

    /// The file name of a run's permanent results file, relative to the output directory.
    pub fn test_results_name(&self, label: &BuildLabel, run: u32) -> String {
        format!(".test_results_{}_{run}", label.name)
    }

    /// The file name of a run's permanent coverage file, relative to the output directory.
    pub fn coverage_name(&self, label: &BuildLabel, run: u32) -> String {
        format!(".test_coverage_{}_{run}", label.name)
    }

    /// The permanent results file for a run.
    pub fn test_results_file(&self, label: &BuildLabel, run: u32) -> Utf8PathBuf {
        self.out_dir(label).join(self.test_results_name(label, run))
    }

    /// The permanent coverage file for a run.
    pub fn coverage_file(&self, label: &BuildLabel, run: u32) -> Utf8PathBuf {
        self.out_dir(label).join(self.coverage_name(label, run))
    }

    /// The results file a test writes during a run.
    pub fn run_results_file(&self, label: &BuildLabel, run: u32) -> Utf8PathBuf {
        self.test_dir(label, run).join(TEST_RESULTS_FILE)
    }

    /// The coverage file a test writes during a run.
    pub fn run_coverage_file(&self, label: &BuildLabel, run: u32) -> Utf8PathBuf {
        self.test_dir(label, run).join(COVERAGE_FILE)
    }
}

fn join_package(base: Utf8PathBuf, package_name: &str) -> Utf8PathBuf {
    if package_name.is_empty() {
        base
    } else {
        base.join(package_name)
    }
}
