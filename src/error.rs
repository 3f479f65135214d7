use thiserror::Error;

/// Toolchain-level failures: I/O, report writing, invalid CLI input.
///
/// Language-level problems (lex/parse/semantic/runtime faults in a
/// PipeTest program) are never surfaced through this type; they are
/// accumulated as [`crate::diagnostics::Diagnostic`] records instead.
#[derive(Error, Debug)]
pub enum PipeTestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("report error: {0}")]
    ReportError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipeTestError>;
