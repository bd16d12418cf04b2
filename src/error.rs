//! Error Taxonomy
//!
//! Component-local contract violations surface as typed errors and are
//! never swallowed. Only the controller decides whether a failure is
//! cycle-local or loop-fatal.

use std::time::Duration;
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, LoopError>;

/// Errors raised by the feedback loop and its components
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoopError {
    /// Metric sample recorded out of order
    #[error("Invalid cycle {cycle_id}: last recorded cycle is {last}")]
    InvalidCycle { cycle_id: u64, last: u64 },

    /// Commit referenced a parent version that does not exist
    #[error("Unknown parent version: {0}")]
    UnknownParent(u64),

    /// Version lookup failed
    #[error("Policy version not found: {0}")]
    NotFound(u64),

    /// Attempt to activate a version that was never accepted
    #[error("Policy version {0} was never accepted")]
    NotAccepted(u64),

    /// Agent task collaborator failed
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Malformed configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Objective references a metric the window does not contain
    #[error("Metric '{0}' missing from window")]
    MissingMetric(String),

    /// NaN or infinite metric value or objective score
    #[error("Metric '{0}' is not finite")]
    NonFiniteMetric(String),

    /// Persisted state could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Cycle requested while the loop is not running
    #[error("Loop is not running (status: {0})")]
    NotRunning(String),
}

/// Failures reported by the agent task collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    /// Convenience constructor for runner implementations
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid objective config: {0}")]
    InvalidObjective(String),

    #[error("Invalid adapter config: {0}")]
    InvalidAdapter(String),

    #[error("Invalid loop config: {0}")]
    InvalidLoop(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

impl LoopError {
    /// Policy store consistency violations indicate a controller bug
    pub fn is_store_inconsistency(&self) -> bool {
        matches!(
            self,
            LoopError::UnknownParent(_) | LoopError::NotFound(_) | LoopError::NotAccepted(_)
        )
    }
}
