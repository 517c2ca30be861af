//! Shared error types for the bridge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the bridge.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// No valid credential could be obtained.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// The identity provider rejected the initial login.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// No packages were found by any discovery strategy.
    #[error("Package discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// A package's interface description is not well-formed.
    #[error("Spec for package '{package}' is unparseable: {reason}")]
    SpecUnparseable {
        /// The package whose description was rejected.
        package: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Two leaf fields of one operation flatten to the same parameter name.
    #[error("Ambiguous flattening in operation '{operation}': parameter '{name}' is produced twice")]
    AmbiguousFlattening {
        /// The operation that failed to compile.
        operation: String,
        /// The colliding flattened name.
        name: String,
    },

    /// The operation's request schema has a shape the compiler cannot express.
    #[error("Unsupported schema in operation '{operation}': {reason}")]
    UnsupportedSchema {
        /// The operation that failed to compile.
        operation: String,
        /// Which shape was rejected, and where.
        reason: String,
    },

    /// Transient failures persisted past the retry budget.
    #[error("Retries exhausted after {attempts} attempt(s): {message}")]
    TransientExhausted {
        /// Last observed HTTP status, if the last attempt got a response.
        status: Option<u16>,
        /// Last observed error message.
        message: String,
        /// Number of attempts that were made.
        attempts: u32,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The engine answered with a well-formed client error.
    #[error("Engine rejected request ({status}): {message}")]
    BusinessRejected {
        /// The HTTP status code returned by the engine.
        status: u16,
        /// The error message from the engine's error body.
        message: String,
    },

    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A tool was invoked with arguments that do not match its parameters.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`BridgeError`], as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthExpired,
    Authentication,
    DiscoveryUnavailable,
    SpecUnparseable,
    AmbiguousFlattening,
    UnsupportedSchema,
    TransientExhausted,
    Cancelled,
    BusinessRejected,
    NotFound,
    InvalidArgument,
    Config,
    Serialization,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::Authentication => "authentication",
            ErrorKind::DiscoveryUnavailable => "discovery_unavailable",
            ErrorKind::SpecUnparseable => "spec_unparseable",
            ErrorKind::AmbiguousFlattening => "ambiguous_flattening",
            ErrorKind::UnsupportedSchema => "unsupported_schema",
            ErrorKind::TransientExhausted => "transient_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BusinessRejected => "business_rejected",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Config => "config",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl BridgeError {
    /// The coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::AuthExpired(_) => ErrorKind::AuthExpired,
            BridgeError::Authentication(_) => ErrorKind::Authentication,
            BridgeError::DiscoveryUnavailable(_) => ErrorKind::DiscoveryUnavailable,
            BridgeError::SpecUnparseable { .. } => ErrorKind::SpecUnparseable,
            BridgeError::AmbiguousFlattening { .. } => ErrorKind::AmbiguousFlattening,
            BridgeError::UnsupportedSchema { .. } => ErrorKind::UnsupportedSchema,
            BridgeError::TransientExhausted { .. } => ErrorKind::TransientExhausted,
            BridgeError::Cancelled => ErrorKind::Cancelled,
            BridgeError::BusinessRejected { .. } => ErrorKind::BusinessRejected,
            BridgeError::NotFound(_) => ErrorKind::NotFound,
            BridgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BridgeError::Config(_) => ErrorKind::Config,
            BridgeError::Serialization(_) => ErrorKind::Serialization,
            BridgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The HTTP status attached to this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            BridgeError::TransientExhausted { status, .. } => *status,
            BridgeError::BusinessRejected { status, .. } => Some(*status),
            BridgeError::AuthExpired(_) => Some(401),
            _ => None,
        }
    }

    /// Whether a caller could reasonably retry at a higher level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::TransientExhausted { .. })
    }

    /// Structured failure record suitable for handing back to an agent.
    pub fn to_failure(&self) -> ToolFailure {
        ToolFailure {
            kind: self.kind(),
            http_status: self.http_status(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Serializable failure view of a [`BridgeError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Error classification.
    pub kind: ErrorKind,
    /// HTTP status, when the engine produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Human-readable message.
    pub message: String,
    /// Whether retrying later may succeed.
    pub retryable: bool,
}

/// Alias for Result with BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
