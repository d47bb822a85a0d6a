//! Request/response contract and the reqwest-backed transport

use crate::error::{ClientError, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use tracing::debug;

/// An outgoing API call, relative to the configured base URL
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    /// Set once the request has been re-sent after a session refresh
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(mut self) -> Self {
        self.retried = true;
        self
    }

    /// The bearer token attached to this request, if any
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
    }
}

/// A fully buffered API response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The backend's "your access token is no longer valid" answer
    pub fn is_credential_expired(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a non-success response into [`ClientError::Status`]
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(ClientError::Status {
            status: self.status,
            body: self.text(),
        })
    }
}

/// Minimal HTTP capability the session client needs
pub trait Transport: Send + Sync + 'static {
    /// Execute one request; a non-2xx status is a response, not an error
    fn execute(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send;
}

/// Transport backed by a shared reqwest client
pub struct HttpTransport {
    base_url: Url,
    default_headers: HeaderMap,
    http_client: Client,
}

impl HttpTransport {
    /// Fixes the base URL and default headers for the lifetime of the transport
    pub fn new(base_url: &str, default_headers: &[(String, String)]) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::Configuration(format!("Invalid base URL {base_url:?}: {e}")))?;

        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ClientError::Configuration(format!(
                "Unsupported base URL scheme: {}",
                base_url.scheme()
            )));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::Configuration(format!("Invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::Configuration(format!("Invalid value for header {name}: {e}")))?;
            headers.insert(name, value);
        }

        Ok(Self {
            base_url,
            default_headers: headers,
            http_client: Client::new(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Transport for HttpTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request.path);
        debug!(method = %request.method, url = %url, retried = request.retried, "Sending request");

        let mut headers = self.default_headers.clone();
        headers.extend(request.headers);

        let mut builder = self.http_client.request(request.method, &url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let transport = HttpTransport::new("https://api.example.com/v1/", &[]).unwrap();
        assert_eq!(
            transport.url_for("/auth/refresh-token"),
            "https://api.example.com/v1/auth/refresh-token"
        );
        assert_eq!(
            transport.url_for("orders"),
            "https://api.example.com/v1/orders"
        );
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            HttpTransport::new("not a url", &[]),
            Err(ClientError::Configuration(_))
        ));
        assert!(matches!(
            HttpTransport::new("ftp://example.com", &[]),
            Err(ClientError::Configuration(_))
        ));

        let bad_header = vec![("X-Client".to_string(), "line\nbreak".to_string())];
        assert!(matches!(
            HttpTransport::new("https://example.com", &bad_header),
            Err(ClientError::Configuration(_))
        ));
    }

    #[test]
    fn test_error_for_status() {
        let ok = ApiResponse::new(StatusCode::OK, "{}");
        assert!(ok.error_for_status().is_ok());

        let conflict = ApiResponse::new(StatusCode::CONFLICT, "order already paid");
        match conflict.error_for_status() {
            Err(ClientError::Status { status, body }) => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(body, "order already paid");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_request_builders() {
        let request = ApiRequest::post("/payments/create-order")
            .json(&serde_json::json!({ "amount": 4200 }))
            .unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body.as_ref().unwrap()["amount"], 4200);
        assert!(!request.is_retried());
        assert!(request.bearer_token().is_none());
        assert!(request.mark_retried().is_retried());
    }
}
