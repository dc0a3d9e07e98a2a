//! Unified error taxonomy for the transport core.
//!
//! Transports raise the specific kind; the protocol layer decides retry vs
//! bubble based on the kind alone.

use thiserror::Error;

use crate::error_code::ErrorCode;

/// Errors surfaced by transports and protocols.
#[derive(Debug, Error)]
pub enum KasaError {
    /// The underlying socket or HTTP connection could not be opened.
    /// `fatal` is set for host-down / host-unreachable / connection-refused,
    /// which are not worth retrying.
    #[error("unable to connect to the device: {host}: {message}")]
    Connection {
        host: String,
        message: String,
        fatal: bool,
    },

    /// I/O did not complete within the configured timeout.
    #[error("timeout querying the device: {host}: {message}")]
    Timeout { host: String, message: String },

    /// Credentials mismatch, auth-class device code, or a failed
    /// certificate/confirm check. Never retried.
    #[error("{message}")]
    Authentication {
        message: String,
        error_code: Option<ErrorCode>,
    },

    /// Device code from the retryable set, or a recoverable HTTP condition
    /// such as a 500 after a completed handshake.
    #[error("{message}")]
    Retryable {
        message: String,
        error_code: Option<ErrorCode>,
    },

    /// Device-side timeout code, retried with backoff.
    #[error("{message}")]
    DeviceTimeout {
        message: String,
        error_code: ErrorCode,
    },

    /// Any other non-success device code.
    #[error("{message}")]
    Device {
        message: String,
        error_code: ErrorCode,
    },

    /// Malformed responses and unexpected states. Fatal.
    #[error("{0}")]
    Protocol(String),
}

impl KasaError {
    /// Device error code attached to this error, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            KasaError::Authentication { error_code, .. }
            | KasaError::Retryable { error_code, .. } => *error_code,
            KasaError::Device { error_code, .. }
            | KasaError::DeviceTimeout { error_code, .. } => Some(*error_code),
            _ => None,
        }
    }

    /// Whether the protocol retry loop should try this send again.
    pub fn is_retryable(&self) -> bool {
        match self {
            KasaError::Connection { fatal, .. } => !fatal,
            KasaError::Timeout { .. }
            | KasaError::Retryable { .. }
            | KasaError::DeviceTimeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, KasaError::Authentication { .. })
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        KasaError::Protocol(message.into())
    }
}

/// Map a non-success device code to the matching error kind.
///
/// The message should already carry host and method context; the code name
/// and numeric value are appended here so every log line shows both.
pub fn error_for_code(code: ErrorCode, message: &str) -> KasaError {
    let message = format!("{message}: {code}");
    if code.is_timeout() {
        KasaError::DeviceTimeout {
            message,
            error_code: code,
        }
    } else if code.is_retryable() {
        KasaError::Retryable {
            message,
            error_code: Some(code),
        }
    } else if code.is_authentication() {
        KasaError::Authentication {
            message,
            error_code: Some(code),
        }
    } else {
        KasaError::Device {
            message,
            error_code: code,
        }
    }
}
