// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The build graph, as far as the test runner needs it.
//!
//! Construction of the graph happens elsewhere. Here targets can be looked up by label, and
//! reverse dependencies found for impact analysis.

use crate::{errors::TargetNotFoundError, label::BuildLabel, target::BuildTarget};
use indexmap::{IndexMap, IndexSet};
use std::{collections::VecDeque, sync::Arc};

/// A set of targets with their dependency edges.
#[derive(Debug, Default)]
pub struct BuildGraph {
    targets: IndexMap<BuildLabel, Arc<BuildTarget>>,
    reverse_deps: IndexMap<BuildLabel, Vec<BuildLabel>>,
}

impl BuildGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target, recording it as a reverse dependency of each of its dependencies.
    ///
    /// Returns the shared handle to the target.
    pub fn add_target(&mut self, target: BuildTarget) -> Arc<BuildTarget> {
        for dep in &target.dependencies {
            let revdeps = self.reverse_deps.entry(dep.clone()).or_default();
            if !revdeps.contains(&target.label) {
                revdeps.push(target.label.clone());
            }
        }
        let target = Arc::new(target);
        self.targets.insert(target.label.clone(), Arc::clone(&target));
        target
    }

    /// Looks up a target.
    pub fn target(&self, label: &BuildLabel) -> Option<&Arc<BuildTarget>> {
        self.targets.get(label)
    }

    /// Looks up a target, returning an error if it doesn't exist.
    pub fn target_or_err(&self, label: &BuildLabel) -> Result<&Arc<BuildTarget>, TargetNotFoundError> {
        self.target(label).ok_or_else(|| TargetNotFoundError::new(label))
    }

    /// Iterates over all targets in insertion order.
    pub fn targets(&self) -> impl Iterator<Item = &Arc<BuildTarget>> + '_ {
        self.targets.values()
    }

    /// Returns the targets that directly depend on `label`.
    pub fn reverse_dependencies(&self, label: &BuildLabel) -> Vec<&Arc<BuildTarget>> {
        self.reverse_deps
            .get(label)
            .into_iter()
            .flatten()
            .filter_map(|revdep| self.targets.get(revdep))
            .collect()
    }

    /// Finds the transitive reverse dependencies of `labels`, sorted.
    ///
    /// `max_depth` bounds how many edges away from the starting labels to look; `None` means no
    /// bound. A hidden target generated by the target it was reached from doesn't use up depth,
    /// and hidden targets are left out of the result, unless `hidden` is set.
    pub fn find_revdeps(
        &self,
        labels: &[BuildLabel],
        hidden: bool,
        max_depth: Option<usize>,
    ) -> Result<Vec<BuildLabel>, TargetNotFoundError> {
        let mut open = OpenSet::default();
        for label in labels {
            let target = self.target_or_err(label)?;
            open.push(&target.label, 0);
        }

        let mut found = IndexSet::new();
        while let Some((label, depth)) = open.pop() {
            // Nodes at the edge of the budget were only queued because reaching them was free.
            if max_depth.is_some_and(|max| depth + 1 > max) {
                continue;
            }
            for revdep in self.reverse_dependencies(&label) {
                let is_child = revdep.label.is_hidden() && revdep.label.parent() == label;
                let next_depth = if hidden || !is_child { depth + 1 } else { depth };
                if hidden || !revdep.label.is_hidden() {
                    found.insert(revdep.label.clone());
                }
                open.push(&revdep.label, next_depth);
            }
        }

        let mut found: Vec<_> = found.into_iter().collect();
        found.sort();
        Ok(found)
    }
}

/// The queue of targets still to visit. Each target is only ever queued once.
#[derive(Default)]
struct OpenSet {
    queue: VecDeque<(BuildLabel, usize)>,
    seen: IndexSet<BuildLabel>,
}

impl OpenSet {
    fn push(&mut self, label: &BuildLabel, depth: usize) {
        if self.seen.insert(label.clone()) {
            self.queue.push_back((label.clone(), depth));
        }
    }

    fn pop(&mut self) -> Option<(BuildLabel, usize)> {
        self.queue.pop_front()
    }
}
