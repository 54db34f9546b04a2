//! Typed error kinds surfaced at component boundaries.
//!
//! Plumbing code uses `anyhow`; these enums exist where callers need to
//! branch on the kind of failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("could not decode oracle response: {0}")]
    Decode(String),

    #[error("prompt of ~{estimated} tokens exceeds the ceiling of {ceiling}")]
    SizeExceeded { estimated: usize, ceiling: usize },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Command '{command}' contains dangerous pattern '{pattern}'")]
    Rejected { command: String, pattern: String },

    #[error("Parameter mismatch: {0}")]
    InvalidParams(String),

    #[error("Tool '{0}' is not supported.")]
    UnknownTool(String),

    #[error("Command execution timed out")]
    Timeout,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Fatal conditions that end a call-tree build early.
#[derive(Debug, Error)]
pub enum BuildAbort {
    #[error("body of `{function}` is too large for the oracle context")]
    LengthExceeded { function: String },
}
