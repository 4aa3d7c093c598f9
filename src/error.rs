//! Error types for the signer controller
//!
//! The split between retryable and non-retryable failures is the core of the
//! error design: a malformed CSR never becomes an [`Error`] at all (see
//! [`crate::csr::CsrParseError`]), while every dependency failure does, so
//! the controller runtime redelivers the request.

use std::time::Duration;

use thiserror::Error;

/// Main error type for signer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The stored object changed between read and guarded write
    #[error("conflict writing {name}: object was modified since it was read")]
    Conflict {
        /// Name of the object that could not be updated
        name: String,
    },

    /// The CA failed to produce a certificate
    #[error("error signing CSR {name}: {message}")]
    Signer {
        /// Name of the CSR being signed
        name: String,
        /// Description of what failed
        message: String,
    },

    /// A dependency call exceeded its time bound
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out (e.g. "sign", "persist")
        operation: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Invalid operator configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "persist", "controller")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for the named object
    pub fn conflict(name: impl Into<String>) -> Self {
        Self::Conflict { name: name.into() }
    }

    /// Create a signer error for the named CSR
    pub fn signer(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Signer {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Dependency failures (API server, signer, conflicts, timeouts) are
    /// retryable. Serialization and configuration errors require a code or
    /// config fix and are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                // 409 is an optimistic-lock conflict; the next read resolves it
                kube::Error::Api(ae) if ae.code == 409 => true,
                // Other 4xx responses won't change on retry
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Conflict { .. } => true,
            Error::Signer { .. } => true,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Short, stable label for this error's class (used as a metric attribute)
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::Conflict { .. } => "conflict",
            Error::Signer { .. } => "signer",
            Error::Timeout { .. } => "timeout",
            Error::Serialization { .. } => "serialization",
            Error::Config { .. } => "config",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
