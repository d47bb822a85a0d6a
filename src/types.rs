//! Type definitions for session credentials

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Session credentials (access + refresh) and the identity they belong to
///
/// Both tokens are always non-empty; an envelope that would violate this
/// cannot be constructed or decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct CredentialEnvelope {
    pub access_token: String,
    pub refresh_token: String,
    /// Opaque user identifier
    pub subject: String,
    /// Any extra fields the backend issued alongside the tokens (role, name, ...)
    #[serde(default)]
    pub issued_fields: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    access_token: String,
    refresh_token: String,
    subject: String,
    #[serde(default)]
    issued_fields: Map<String, Value>,
}

impl TryFrom<RawEnvelope> for CredentialEnvelope {
    type Error = ClientError;

    fn try_from(raw: RawEnvelope) -> Result<Self> {
        CredentialEnvelope::new(raw.access_token, raw.refresh_token, raw.subject)
            .map(|envelope| envelope.with_issued_fields(raw.issued_fields))
    }
}

impl CredentialEnvelope {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        subject: impl Into<String>,
    ) -> Result<Self> {
        let access_token = access_token.into();
        let refresh_token = refresh_token.into();

        if access_token.is_empty() || refresh_token.is_empty() {
            return Err(ClientError::InvalidResponse(
                "credential envelope requires both an access and a refresh token".to_string(),
            ));
        }

        Ok(Self {
            access_token,
            refresh_token,
            subject: subject.into(),
            issued_fields: Map::new(),
        })
    }

    pub fn with_issued_fields(mut self, fields: Map<String, Value>) -> Self {
        self.issued_fields = fields;
        self
    }

    /// Swap in a rotated token pair, keeping identity and issued fields
    pub(crate) fn rotate(&mut self, access_token: &str, refresh_token: &str) {
        self.access_token = access_token.to_string();
        self.refresh_token = refresh_token.to_string();
    }
}

/// Body of `POST /auth/refresh-token`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Successful refresh answer; the refresh token is rotated on every use
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub token: String,
    pub refresh_token: String,
}

/// Session notifications for the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { subject: String },
    Refreshed,
    /// The session is gone for good; the host should redirect to sign-in.
    Expired { reason: String },
    LoggedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_rejects_partial_tokens() {
        assert!(CredentialEnvelope::new("", "refresh", "user-1").is_err());
        assert!(CredentialEnvelope::new("access", "", "user-1").is_err());
        assert!(CredentialEnvelope::new("access", "refresh", "user-1").is_ok());
    }

    #[test]
    fn test_envelope_decode_enforces_invariant() {
        let partial = r#"{"access_token":"a","refresh_token":"","subject":"u"}"#;
        assert!(serde_json::from_str::<CredentialEnvelope>(partial).is_err());

        let full = r#"{"access_token":"a","refresh_token":"r","subject":"u","issued_fields":{"role":"admin"}}"#;
        let envelope: CredentialEnvelope = serde_json::from_str(full).unwrap();
        assert_eq!(envelope.issued_fields["role"], "admin");
    }

    #[test]
    fn test_refresh_wire_format() {
        let body = serde_json::to_value(RefreshRequest {
            refresh_token: "R1".to_string(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "refreshToken": "R1" }));

        let response: RefreshResponse =
            serde_json::from_str(r#"{"token":"T2","refreshToken":"R2"}"#).unwrap();
        assert_eq!(response.token, "T2");
        assert_eq!(response.refresh_token, "R2");
    }
}
