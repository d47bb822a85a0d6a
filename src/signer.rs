//! Bearer credential attachment

use crate::transport::ApiRequest;
use crate::types::CredentialEnvelope;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use tracing::warn;

/// Attach the envelope's access token to `request`
///
/// Without an envelope (signed out) the request goes out unchanged.
pub fn sign(request: ApiRequest, envelope: Option<&CredentialEnvelope>) -> ApiRequest {
    match envelope {
        Some(envelope) => sign_with_token(request, &envelope.access_token),
        None => request,
    }
}

/// Attach `token` as `Authorization: Bearer <token>`, replacing any previous one
pub fn sign_with_token(mut request: ApiRequest, token: &str) -> ApiRequest {
    if token.is_empty() {
        return request;
    }

    match HeaderValue::from_str(&format!("Bearer {token}")) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers.insert(AUTHORIZATION, value);
        }
        Err(_) => {
            // Tokens are opaque; one that isn't header-safe is sent unsigned
            // and the backend answers 401 like for any bad credential.
            warn!(path = %request.path, "Access token is not a valid header value, sending unsigned");
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_attaches_bearer() {
        let envelope = CredentialEnvelope::new("T1", "R1", "user-1").unwrap();
        let signed = sign(ApiRequest::get("/orders"), Some(&envelope));
        assert_eq!(signed.bearer_token(), Some("T1"));
        assert!(signed.headers[AUTHORIZATION].is_sensitive());
    }

    #[test]
    fn test_sign_without_envelope_is_identity() {
        let signed = sign(ApiRequest::get("/orders"), None);
        assert!(signed.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_resign_replaces_previous_token() {
        let signed = sign_with_token(ApiRequest::get("/orders"), "T1");
        let resigned = sign_with_token(signed, "T2");
        assert_eq!(resigned.bearer_token(), Some("T2"));
        assert_eq!(resigned.headers.get_all(AUTHORIZATION).iter().count(), 1);
    }

    #[test]
    fn test_unusable_token_leaves_request_unsigned() {
        let signed = sign_with_token(ApiRequest::get("/orders"), "bad\ntoken");
        assert!(signed.bearer_token().is_none());

        let signed = sign_with_token(ApiRequest::get("/orders"), "");
        assert!(signed.bearer_token().is_none());
    }
}
