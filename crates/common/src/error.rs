//! Error types for the common crate
//!
//! This module defines the error types used throughout the Model Hub workspace.
//! Every error can be classified into a closed [`ErrorKind`] so that transport
//! layers can map it to a status code without inspecting message text.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result type for Model Hub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error, independent of its message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    ResourceExhausted,
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Common error type for Model Hub operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Destination path escapes the model store or contains traversal
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists error
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation rejected because of the current state of the target
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Resource exhaustion, e.g. the inference server ran out of memory
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// External service error
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Cancelled error
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Structured error carrying a kind and a details map
    #[error("{kind}: {message}")]
    Status {
        kind: ErrorKind,
        message: String,
        details: BTreeMap<String, String>,
    },
}

impl Error {
    /// Builds a structured error without details
    pub fn status(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Status {
            kind,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    /// Attaches a detail entry; non-structured errors are converted first
    pub fn with_detail(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (kind, message, mut details) = match self {
            Error::Status { kind, message, details } => (kind, message, details),
            other => (other.kind(), other.to_string(), BTreeMap::new()),
        };
        details.insert(key.into(), value.into());
        Error::Status { kind, message, details }
    }

    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::Config(_) => ErrorKind::FailedPrecondition,
            Error::InvalidPath(_) | Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::ExternalService(_) => ErrorKind::Unavailable,
            Error::Timeout(_) => ErrorKind::DeadlineExceeded,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Status { kind, .. } => *kind,
        }
    }

    /// Details attached to a structured error, empty for the other variants
    pub fn details(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Error::Status { details, .. } => Some(details),
            _ => None,
        }
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true if the error is an already exists error
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Returns true if the error is a precondition failure
    pub fn is_failed_precondition(&self) -> bool {
        self.kind() == ErrorKind::FailedPrecondition
    }

    /// Returns true if the error is a resource exhaustion error
    pub fn is_resource_exhausted(&self) -> bool {
        self.kind() == ErrorKind::ResourceExhausted
    }

    /// Returns true if the error is a timeout error
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::DeadlineExceeded
    }

    /// Returns true if the error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
