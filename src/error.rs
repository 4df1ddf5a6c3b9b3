//! Error types for taskmux
//!
//! This module provides the error codes reported by scheduler operations.
//! A failed call never damages the scheduler itself; the registry stays
//! consistent and the loop keeps running.

use thiserror::Error;

/// Main error type for scheduler operations
#[derive(Error, Debug)]
pub enum Error {
    /// An argument did not make sense for the operation
    #[error("invalid argument")]
    InvalidArgument,

    /// The scheduler or task has been stopped or invalidated
    #[error("scheduler or task is no longer valid")]
    NotValid,

    /// A task or event with the same identity is already registered
    #[error("already exists")]
    AlreadyExists,

    /// No task, event or subscription matched the request
    #[error("not found")]
    NotFound,

    /// The configured task ceiling was reached
    #[error("task limit reached")]
    Limit,

    /// An allocation could not be satisfied
    #[error("out of memory")]
    OutOfMemory,

    /// The platform poller reported an I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;
