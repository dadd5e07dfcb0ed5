//! Terminal call status reported to the client.

use std::fmt;

/// Canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    /// Upper-case wire name of the code (e.g. `"DEADLINE_EXCEEDED"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a call: a code plus an optional human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {}", .description.as_deref().unwrap_or("<no description>"))]
pub struct Status {
    code: Code,
    description: Option<String>,
}

impl Status {
    /// Creates a status with the given code and no description.
    #[must_use]
    pub const fn new(code: Code) -> Self {
        Self {
            code,
            description: None,
        }
    }

    /// Creates a status with the given code and description.
    #[must_use]
    pub fn with_description(code: Code, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }

    #[must_use]
    pub const fn ok() -> Self {
        Self::new(Code::Ok)
    }

    #[must_use]
    pub fn cancelled(description: impl Into<String>) -> Self {
        Self::with_description(Code::Cancelled, description)
    }

    #[must_use]
    pub fn deadline_exceeded(description: impl Into<String>) -> Self {
        Self::with_description(Code::DeadlineExceeded, description)
    }

    #[must_use]
    pub fn internal(description: impl Into<String>) -> Self {
        Self::with_description(Code::Internal, description)
    }

    #[must_use]
    pub fn unknown(description: impl Into<String>) -> Self {
        Self::with_description(Code::Unknown, description)
    }

    #[must_use]
    pub fn unimplemented(description: impl Into<String>) -> Self {
        Self::with_description(Code::Unimplemented, description)
    }

    #[must_use]
    pub fn invalid_argument(description: impl Into<String>) -> Self {
        Self::with_description(Code::InvalidArgument, description)
    }

    #[must_use]
    pub fn unavailable(description: impl Into<String>) -> Self {
        Self::with_description(Code::Unavailable, description)
    }

    #[must_use]
    pub const fn code(&self) -> Code {
        self.code
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.code, Code::Ok)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
