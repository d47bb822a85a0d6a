//! In-process transport double for unit tests

use crate::auth_client::DEFAULT_REFRESH_PATH;
use crate::error::Result;
use crate::transport::{ApiRequest, ApiResponse, Transport};
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Canned answer for one request
pub struct Reply {
    status: StatusCode,
    body: String,
    delay: Duration,
}

impl Reply {
    pub fn status(status: StatusCode) -> Self {
        Self::json(status, "")
    }

    pub fn json(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// Answer only after `delay` (on tokio's clock)
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = dyn Fn(&ApiRequest) -> Reply + Send + Sync;

/// Transport that answers from a handler and records every request it sees
#[derive(Clone)]
pub struct ScriptedTransport {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<ApiRequest>>>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&ApiRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }

    pub fn refresh_calls(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == DEFAULT_REFRESH_PATH)
            .count()
    }
}

impl Transport for ScriptedTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let reply = (self.handler)(&request);
        self.requests.lock().push(request);

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        Ok(ApiResponse::new(reply.status, reply.body))
    }
}
