// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Build labels: the `//package:name` identifiers of targets.

use crate::errors::LabelParseError;
use std::{fmt, str::FromStr};

/// Identifies a single target: the package it lives in and its name within that package.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildLabel {
    /// The package path, e.g. `src/core`. Empty for the repository root package.
    pub package_name: String,

    /// The target's name within its package.
    pub name: String,
}

impl BuildLabel {
    /// Creates a new label without validating it.
    pub fn new(package_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            name: name.into(),
        }
    }

    /// Parses an absolute label, `//package:name` or `//package` (short for
    /// `//package:<last package component>`).
    pub fn parse(input: &str) -> Result<Self, LabelParseError> {
        let Some(rest) = input.strip_prefix("//") else {
            return Err(LabelParseError::new(input, "absolute labels must start with `//`"));
        };
        let (package_name, name) = match rest.split_once(':') {
            Some((package_name, name)) => (package_name, name),
            None => {
                let name = rest.rsplit('/').next().unwrap_or(rest);
                (rest, name)
            }
        };
        validate_package(input, package_name)?;
        validate_name(input, name)?;
        Ok(Self::new(package_name, name))
    }

    /// Parses a label that may be relative (`:name`) to `current_package`.
    pub fn parse_relative(input: &str, current_package: &str) -> Result<Self, LabelParseError> {
        match input.strip_prefix(':') {
            Some(name) => {
                validate_package(input, current_package)?;
                validate_name(input, name)?;
                Ok(Self::new(current_package, name))
            }
            None => Self::parse(input),
        }
    }

    /// Returns true if this is an internal target generated by another rule.
    ///
    /// Hidden targets have names starting with an underscore.
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('_')
    }

    /// Returns the label of the rule that generated this one.
    ///
    /// For a hidden target `_name#tag` this is `name` in the same package; any other label is its
    /// own parent.
    pub fn parent(&self) -> BuildLabel {
        if !self.is_hidden() {
            return self.clone();
        }
        let name = self.name.trim_start_matches('_');
        let name = name.split('#').next().unwrap_or(name);
        Self::new(self.package_name.clone(), name)
    }

    /// Returns the package name with `/` replaced by `.`, as used for test suite package names.
    pub fn dotted_package(&self) -> String {
        self.package_name.replace('/', ".")
    }
}

fn validate_package(input: &str, package_name: &str) -> Result<(), LabelParseError> {
    if package_name.is_empty() {
        return Ok(());
    }
    for component in package_name.split('/') {
        if component.is_empty() {
            return Err(LabelParseError::new(input, "package has an empty path component"));
        }
        if component == "." || component == ".." {
            return Err(LabelParseError::new(
                input,
                format!("package may not contain `{component}`"),
            ));
        }
    }
    if package_name.contains(':') {
        return Err(LabelParseError::new(input, "package may not contain `:`"));
    }
    Ok(())
}

fn validate_name(input: &str, name: &str) -> Result<(), LabelParseError> {
    if name.is_empty() {
        return Err(LabelParseError::new(input, "target name is empty"));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, ':' | '/' | ' ' | '\t' | '\n')) {
        return Err(LabelParseError::new(
            input,
            format!("target name may not contain {c:?}"),
        ));
    }
    Ok(())
}

impl fmt::Display for BuildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}", self.package_name, self.name)
    }
}

impl FromStr for BuildLabel {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
