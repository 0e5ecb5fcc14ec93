// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::serialize::Tag;

/// Errors that can occur during analysis.
#[derive(Clone, Debug, Error)]
pub enum CheckerError {
    #[error("malformed serialized data: unexpected tag {0}")]
    Corrupt(Tag),

    #[error("malformed serialized data: {0}")]
    Truncated(&'static str),

    #[error("database entry not found: {0}")]
    MissingEntry(String),

    #[error("timestamp conflict writing {0}, re-merge required")]
    StampConflict(String),

    #[error("transaction primitive failed: {0}")]
    TransactionFailed(String),

    #[error("solvers disagree on satisfiability, failed backend: {backend}")]
    SolverDisagreement { backend: String },

    #[error("solver timed out within its soft budget")]
    SoftTimeout,

    #[error("assertion exceeded the hard time limit")]
    HardTimeout,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CheckerError {
    fn from(err: std::io::Error) -> Self {
        CheckerError::Io(err.to_string())
    }
}

pub type CheckerResult<T> = Result<T, CheckerError>;
