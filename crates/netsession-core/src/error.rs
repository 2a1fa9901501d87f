//! Error types for netsession core

use std::fmt;
use thiserror::Error;

/// Errors delivered to completion callbacks and returned by session operations
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Server trust rejected for {host}")]
    TrustRejected { host: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid resume data: {0}")]
    InvalidResumeData(String),

    #[error("Session has been invalidated")]
    SessionInvalidated,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl SessionError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Transport(e) => matches!(
                e.kind,
                TransportErrorKind::Connect | TransportErrorKind::Timeout | TransportErrorKind::Body
            ),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }

    /// Serialization error carried by this error, if any
    pub fn serialization(&self) -> Option<&SerializationError> {
        match self {
            SessionError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(error: std::io::Error) -> Self {
        SessionError::Io(error.to_string())
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(error: reqwest::Error) -> Self {
        SessionError::Transport(error.into())
    }
}

/// Broad classification of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Tls,
    Redirect,
    Body,
    Status,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Redirect => "redirect",
            TransportErrorKind::Body => "body",
            TransportErrorKind::Status => "status",
            TransportErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A failure reported by the underlying session (DNS, TLS, reset, timeout)
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            TransportErrorKind::Timeout
        } else if error.is_connect() {
            TransportErrorKind::Connect
        } else if error.is_redirect() {
            TransportErrorKind::Redirect
        } else if error.is_body() || error.is_decode() {
            TransportErrorKind::Body
        } else if error.is_status() {
            TransportErrorKind::Status
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, error.to_string())
    }
}

/// Response validation or decoding failure
#[derive(Debug, Clone, Error)]
pub enum SerializationError {
    #[error("Request failed: unacceptable status code {status}")]
    UnacceptableStatusCode { status: u16, data: Option<Vec<u8>> },

    #[error("Request failed: unacceptable content type {content_type}")]
    UnacceptableContentType {
        content_type: String,
        data: Option<Vec<u8>>,
    },

    #[error("Failed to decode response: {message}")]
    Decode { message: String, data: Option<Vec<u8>> },
}

impl SerializationError {
    /// Raw body that failed validation or decoding
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            SerializationError::UnacceptableStatusCode { data, .. }
            | SerializationError::UnacceptableContentType { data, .. }
            | SerializationError::Decode { data, .. } => data.as_deref(),
        }
    }
}

/// Reasons a presented certificate chain was not trusted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    #[error("No certificates were presented")]
    EmptyChain,

    #[error("Malformed certificate: {0}")]
    Malformed(String),

    #[error("Certificate is expired or not yet valid: {subject}")]
    Expired { subject: String },

    #[error("Certificate chain is broken at position {position}")]
    BrokenChain { position: usize },

    #[error("Certificate chain does not end in a trusted anchor")]
    UntrustedRoot,

    #[error("Certificate is not valid for {domain}")]
    HostnameMismatch { domain: String },

    #[error("No presented certificate matches the pinned set")]
    PinningMismatch,

    #[error("Failed to load certificates: {0}")]
    Io(String),
}
