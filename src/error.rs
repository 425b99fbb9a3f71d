use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors raised while scanning a build definition.
///
/// Every variant aborts the scan; there is no partial result.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The context could not be fetched (network, auth, not found).
    #[error("context '{context}' is unavailable: {message}")]
    ContextUnavailable { context: String, message: String },

    /// The context was fetched but cannot be used (bad archive, bad layout).
    #[error("context '{context}' is invalid: {message}")]
    ContextInvalid { context: String, message: String },

    #[error("build definition not found at {}", path.display())]
    DefinitionNotFound { path: PathBuf },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: build argument '{name}' is not declared or has no value")]
    UnresolvedArgument { name: String, line: usize },

    #[error("stage '{stage}' is part of a cyclic or forward stage reference")]
    CyclicStageReference { stage: String },

    #[error("target stage '{target}' not found in build definition")]
    TargetNotFound { target: String },

    #[error("deadline exceeded while {during}")]
    DeadlineExceeded { during: &'static str },

    #[error("'{command}' failed with exit code {exit_code}: {stderr}")]
    ProcessExecutionFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

impl ScanError {
    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        ScanError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::ContextUnavailable { .. } => ErrorKind::ContextUnavailable,
            ScanError::ContextInvalid { .. } => ErrorKind::ContextInvalid,
            ScanError::DefinitionNotFound { .. } => ErrorKind::DefinitionNotFound,
            ScanError::Syntax { .. } => ErrorKind::SyntaxError,
            ScanError::UnresolvedArgument { .. } => ErrorKind::UnresolvedArgument,
            ScanError::CyclicStageReference { .. } => ErrorKind::CyclicStageReference,
            ScanError::TargetNotFound { .. } => ErrorKind::TargetNotFound,
            ScanError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            ScanError::ProcessExecutionFailed { .. } => ErrorKind::ProcessExecutionFailed,
        }
    }
}

/// Machine-readable error category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ContextUnavailable,
    ContextInvalid,
    DefinitionNotFound,
    SyntaxError,
    UnresolvedArgument,
    CyclicStageReference,
    TargetNotFound,
    DeadlineExceeded,
    ProcessExecutionFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ContextUnavailable => "ContextUnavailable",
            ErrorKind::ContextInvalid => "ContextInvalid",
            ErrorKind::DefinitionNotFound => "DefinitionNotFound",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::UnresolvedArgument => "UnresolvedArgument",
            ErrorKind::CyclicStageReference => "CyclicStageReference",
            ErrorKind::TargetNotFound => "TargetNotFound",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::ProcessExecutionFailed => "ProcessExecutionFailed",
        }
    }

    /// Process exit code used by the CLI. 1 is left for glue errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::ContextUnavailable => 10,
            ErrorKind::ContextInvalid => 11,
            ErrorKind::DefinitionNotFound => 12,
            ErrorKind::SyntaxError => 20,
            ErrorKind::UnresolvedArgument => 21,
            ErrorKind::CyclicStageReference => 22,
            ErrorKind::TargetNotFound => 23,
            ErrorKind::DeadlineExceeded => 30,
            ErrorKind::ProcessExecutionFailed => 40,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
