//! Error types for the storefront client

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Client error types
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Credential storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    /// The session could not be recovered; the host should send the user
    /// back to a sign-in surface.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether a resilient operation may try again after this error.
    ///
    /// Only failures that say nothing about the request itself qualify:
    /// timeouts, network faults and 408/429/5xx answers.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Timeout { .. } => true,
            ClientError::HttpRequest(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            ClientError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, ClientError::SessionExpired(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
