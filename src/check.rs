// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Errors raised when observed cluster state contradicts an expected
//! invariant, and the combined error type returned by whole workflows.

use std::fmt;

use crate::{config::ConfigError, remote::ExecError, state::StateError};

/// Observed state contradicted an expectation. These indicate a real defect
/// in the system under test, so they are never retried.
#[derive(Debug, PartialEq)]
pub struct CheckError {
    pub what: String,
}

impl CheckError {
    pub fn new(what: impl Into<String>) -> Self {
        CheckError { what: what.into() }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "validation failed: {}", self.what)
    }
}

impl std::error::Error for CheckError {}

/// Require `cond`, otherwise produce a CheckError built by `what`.
pub fn ensure<F: FnOnce() -> String>(cond: bool, what: F) -> Result<(), CheckError> {
    if cond {
        Ok(())
    } else {
        Err(CheckError::new(what()))
    }
}

/// Everything a workflow can fail with. Commands report these once at the
/// CLI boundary; the variant decides whether diagnostics are worth taking.
#[derive(Debug)]
pub enum WorkflowError {
    /// Bad or missing configuration. Failed fast, nothing was retried.
    Config(ConfigError),
    /// A remote command failed after its retry budget was spent.
    Exec(ExecError),
    /// An invariant did not hold.
    Check(CheckError),
    /// The event journal could not be read or written.
    State(StateError),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkflowError::Config(e) => write!(f, "{e}"),
            WorkflowError::Exec(e) => write!(f, "{e}"),
            WorkflowError::Check(e) => write!(f, "{e}"),
            WorkflowError::State(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<ConfigError> for WorkflowError {
    fn from(e: ConfigError) -> Self {
        WorkflowError::Config(e)
    }
}

impl From<ExecError> for WorkflowError {
    fn from(e: ExecError) -> Self {
        WorkflowError::Exec(e)
    }
}

impl From<CheckError> for WorkflowError {
    fn from(e: CheckError) -> Self {
        WorkflowError::Check(e)
    }
}

impl From<StateError> for WorkflowError {
    fn from(e: StateError) -> Self {
        WorkflowError::State(e)
    }
}
