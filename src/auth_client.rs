//! Session-aware API client with single-flight credential refresh

use crate::error::{ClientError, Result};
use crate::refresh::{RefreshCoordinator, RefreshLeader, RefreshRole};
use crate::signer;
use crate::token_store::CredentialStore;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
use crate::types::*;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default path of the refresh endpoint
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh-token";

/// Default ceiling on a single refresh call
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

const SESSION_EVENT_CAPACITY: usize = 16;

/// Why a refresh cycle produced no token
enum RefreshFailure {
    /// The session is unusable; clear it and tell the host
    Rejected(String),
    /// The host ended the session itself while the refresh was running
    SignedOut,
}

/// Macro to check HTTP response status and return error if not successful
macro_rules! check_response {
    ($response:expr, $error_msg:expr) => {
        if !$response.is_success() {
            return Err(ClientError::Status {
                status: $response.status,
                body: format!("{}: {}", $error_msg, $response.text()),
            });
        }
    };
}

/// Configuration for the session client
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend base URL, e.g. `https://api.example.com/v1`
    pub base_url: String,

    /// Headers sent with every request
    pub default_headers: Vec<(String, String)>,

    /// Path of the refresh endpoint, relative to `base_url`
    /// Default: `/auth/refresh-token`
    pub refresh_path: String,

    /// How long a refresh call may take before the session is given up
    /// Default: 30 seconds
    pub refresh_timeout: Duration,
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: Vec::new(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Read `STOREFRONT_API_URL` (required), `STOREFRONT_REFRESH_PATH` and
    /// `STOREFRONT_REFRESH_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("STOREFRONT_API_URL")
            .map_err(|_| ClientError::Configuration("STOREFRONT_API_URL is not set".to_string()))?;

        let mut config = Self::new(base_url);

        if let Ok(path) = std::env::var("STOREFRONT_REFRESH_PATH") {
            config = config.with_refresh_path(path);
        }

        if let Ok(secs) = std::env::var("STOREFRONT_REFRESH_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|e| {
                ClientError::Configuration(format!("Invalid STOREFRONT_REFRESH_TIMEOUT_SECS: {e}"))
            })?;
            config = config.with_refresh_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// Build the reqwest transport for this configuration
    pub fn build_transport(&self) -> Result<HttpTransport> {
        HttpTransport::new(&self.base_url, &self.default_headers)
    }
}

/// Entry point every backend call goes through
pub trait ApiClient: Send + Sync + 'static {
    /// Send a request, transparently recovering from an expired access token
    ///
    /// Non-success responses other than an unrecoverable 401 are returned
    /// as responses. An unrecoverable session is [`ClientError::SessionExpired`].
    fn send(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send;
}

impl<C: ApiClient> ApiClient for Arc<C> {
    fn send(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send {
        C::send(self, request)
    }
}

/// API client that signs requests with the stored session and refreshes it
/// on demand
///
/// Shares one [`CredentialStore`] with the rest of the application.
pub struct SessionClient<T> {
    handle: Weak<Self>,
    config: SessionConfig,
    transport: T,
    store: CredentialStore,
    coordinator: RefreshCoordinator,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionClient<HttpTransport> {
    /// Create a client talking HTTP to `config.base_url`
    pub fn connect(config: SessionConfig, store: CredentialStore) -> Result<Arc<Self>> {
        let transport = config.build_transport()?;
        Ok(Self::new(config, transport, store))
    }
}

impl<T: Transport> SessionClient<T> {
    pub fn new(config: SessionConfig, transport: T, store: CredentialStore) -> Arc<Self> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        Arc::new_cyclic(|handle| Self {
            handle: handle.clone(),
            config,
            transport,
            store,
            coordinator: RefreshCoordinator::new(),
            events,
        })
    }

    /// Get the credential store (shared with the rest of the application)
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Subscribe to session notifications
    ///
    /// [`SessionEvent::Expired`] is the cue to send the user back to sign-in.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a session from a freshly issued envelope
    pub fn sign_in(&self, envelope: CredentialEnvelope) -> Result<()> {
        self.store.save(&envelope)?;
        info!(subject = %envelope.subject, "Session established");
        self.notify(SessionEvent::SignedIn {
            subject: envelope.subject,
        });
        Ok(())
    }

    /// End the session
    pub fn logout(&self) -> Result<()> {
        self.store.clear()?;
        info!("Logged out");
        self.notify(SessionEvent::LoggedOut);
        Ok(())
    }

    fn notify(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Obtain an access token that postdates the one a failed request used
    ///
    /// Leads a refresh cycle or waits on the one in flight. The refresh runs
    /// on its own task, so a caller dropped mid-refresh (for example by a
    /// wrapper's timeout) only abandons its own wait. An abandoned cycle is
    /// joined again.
    async fn fresh_access_token(&self, signed_with: &str) -> Result<String> {
        loop {
            let waiter = match self.coordinator.join() {
                RefreshRole::Leader(leader) => {
                    let Some(this) = self.handle.upgrade() else {
                        // Only while the last handle is being torn down
                        leader.resolve(Err("session client is shutting down".to_string()));
                        return Err(ClientError::SessionExpired(
                            "session client is shutting down".to_string(),
                        ));
                    };
                    let waiter = leader.follow();
                    let signed_with = signed_with.to_string();
                    tokio::spawn(async move { this.run_refresh(leader, signed_with).await });
                    waiter
                }
                RefreshRole::Follower(waiter) => waiter,
            };

            match waiter.wait().await {
                Some(outcome) => return outcome.map_err(ClientError::SessionExpired),
                None => {
                    debug!("Refresh leader went away, rejoining");
                    continue;
                }
            }
        }
    }

    /// One refresh cycle, start to finish, owned by the refresh task
    async fn run_refresh(self: Arc<Self>, leader: RefreshLeader, signed_with: String) {
        let outcome = match self.lead_refresh(&signed_with).await {
            Ok(token) => Ok(token),
            Err(RefreshFailure::Rejected(reason)) => {
                self.expire_session(&reason);
                Err(reason)
            }
            Err(RefreshFailure::SignedOut) => {
                debug!("Session ended while refreshing, discarding refreshed tokens");
                Err("session was signed out while refreshing".to_string())
            }
        };
        leader.resolve(outcome);
    }

    async fn lead_refresh(&self, signed_with: &str) -> std::result::Result<String, RefreshFailure> {
        let Some(envelope) = self.store.load() else {
            return Err(RefreshFailure::Rejected("no stored session to refresh".to_string()));
        };

        // A previous cycle already rotated the token this request was signed with
        if signed_with != envelope.access_token {
            debug!("Access token changed since the request was signed, reusing it");
            return Ok(envelope.access_token);
        }

        let refreshed = match self.call_refresh_endpoint(&envelope.refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(error = %e, "Session refresh failed");
                return Err(RefreshFailure::Rejected(e.to_string()));
            }
        };

        match self
            .store
            .replace_tokens(&refreshed.token, &refreshed.refresh_token)
        {
            Ok(true) => {
                info!(subject = %envelope.subject, "Session refreshed");
                self.notify(SessionEvent::Refreshed);
                Ok(refreshed.token)
            }
            // Logged out while the call was in flight
            Ok(false) => Err(RefreshFailure::SignedOut),
            Err(e) => Err(RefreshFailure::Rejected(format!(
                "failed to persist refreshed session: {e}"
            ))),
        }
    }

    /// `POST {refresh_path}` with the current refresh token
    ///
    /// Never retried: the refresh token is single-use on the backend.
    async fn call_refresh_endpoint(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let request = ApiRequest::post(&self.config.refresh_path).json(&RefreshRequest {
            refresh_token: refresh_token.to_string(),
        })?;

        let response = tokio::time::timeout(self.config.refresh_timeout, self.transport.execute(request))
            .await
            .map_err(|_| ClientError::Timeout {
                operation: "session refresh",
                after: self.config.refresh_timeout,
            })??;

        check_response!(response, "Session refresh rejected");

        let refreshed: RefreshResponse = response
            .json()
            .map_err(|e| ClientError::InvalidResponse(format!("Malformed refresh response: {e}")))?;

        if refreshed.token.is_empty() || refreshed.refresh_token.is_empty() {
            return Err(ClientError::InvalidResponse(
                "Refresh response is missing a token".to_string(),
            ));
        }

        Ok(refreshed)
    }

    fn expire_session(&self, reason: &str) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear expired session");
        }
        warn!(reason = %reason, "Session expired");
        self.notify(SessionEvent::Expired {
            reason: reason.to_string(),
        });
    }
}

impl<T: Transport> ApiClient for SessionClient<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let envelope = self.store.load();
        let signed_with = envelope.as_ref().map(|e| e.access_token.clone());

        let response = self
            .transport
            .execute(signer::sign(request.clone(), envelope.as_ref()))
            .await?;

        // Common case: nothing to do with the session
        if !response.is_credential_expired() {
            return Ok(response);
        }

        // Nothing to refresh: the 401 belongs to the caller, not the session
        let Some(signed_with) = signed_with else {
            return Ok(response);
        };

        // Never refresh twice for the same logical call
        if request.is_retried() {
            debug!(path = %request.path, "Retried request still unauthorized");
            return Ok(response);
        }

        debug!(path = %request.path, "Access token rejected, refreshing session");
        let token = self.fresh_access_token(&signed_with).await?;

        let retry = signer::sign_with_token(request.mark_retried(), &token);
        self.transport.execute(retry).await
    }
}
