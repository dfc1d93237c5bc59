//! Error types for the herald-runner crate.

use herald_list::ListError;
use herald_spool::SpoolError;
use thiserror::Error;

/// Errors that stop a runner, or that a dispatcher reports for one entry.
///
/// Anything a dispatcher returns is treated as unexpected: the entry being
/// dispatched is moved to the shunt queue and the runner carries on.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Queue error: {0}")]
    Spool(#[from] SpoolError),

    #[error("List error: {0}")]
    List(#[from] ListError),

    /// A pipeline names a stage nobody registered.
    #[error("Unknown pipeline stage: {0}")]
    UnknownStage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
