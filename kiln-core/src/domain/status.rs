//! Commit status values
//!
//! The hosting service only understands four status strings. Anything else
//! is a programming error and fails to parse.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Status of a commit as reported to the source host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatus {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitStatus {
    /// The wire representation expected by the source host
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Pending => "pending",
            CommitStatus::Success => "success",
            CommitStatus::Failure => "failure",
            CommitStatus::Error => "error",
        }
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the four status values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown commit status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for CommitStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommitStatus::Pending),
            "success" => Ok(CommitStatus::Success),
            "failure" => Ok(CommitStatus::Failure),
            "error" => Ok(CommitStatus::Error),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}
