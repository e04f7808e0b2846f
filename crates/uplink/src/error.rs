//! Uplink error types and timeout classification.

use std::fmt;
use thiserror::Error;

/// Network failure codes. The three timeout-class codes are treated as
/// transient by the publish-gate and the service-unavailable escalation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkErrorCode {
    Etimedout,
    EsocketTimedout,
    Econnreset,
    Other,
}

impl NetworkErrorCode {
    pub fn is_timeout_class(&self) -> bool {
        matches!(self, Self::Etimedout | Self::EsocketTimedout | Self::Econnreset)
    }
}

impl fmt::Display for NetworkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Etimedout => "ETIMEDOUT",
            Self::EsocketTimedout => "ESOCKETTIMEDOUT",
            Self::Econnreset => "ECONNRESET",
            Self::Other => "EUNKNOWN",
        };
        write!(f, "{code}")
    }
}

/// Errors produced by an uplink.
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Conditional fetch answered `304 Not Modified`. A sentinel, not a
    /// failure: the caller's cached copy is still valid.
    #[error("remote returned 304 Not Modified")]
    NotModified,

    #[error("network error ({code}): {message}")]
    Network {
        code: NetworkErrorCode,
        message: String,
    },

    #[error("remote returned status {status}")]
    RemoteStatus { status: u16 },

    #[error("invalid upstream response: {0}")]
    Validation(String),

    #[error("invalid url: {0}")]
    Url(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl UplinkError {
    /// Whether this failure is transient (timeout-class).
    pub fn is_timeout_class(&self) -> bool {
        matches!(self, Self::Network { code, .. } if code.is_timeout_class())
    }

    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }

    /// HTTP status of the remote answer, when there was one.
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            Self::NotModified => Some(304),
            Self::RemoteStatus { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UplinkError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            if err.is_body() {
                NetworkErrorCode::EsocketTimedout
            } else {
                NetworkErrorCode::Etimedout
            }
        } else if err.is_connect() || err.is_body() || err.is_request() {
            NetworkErrorCode::Econnreset
        } else {
            NetworkErrorCode::Other
        };
        Self::Network {
            code,
            message: err.to_string(),
        }
    }
}

/// Result type for uplink operations.
pub type UplinkResult<T> = std::result::Result<T, UplinkError>;
