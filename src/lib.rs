//! Storefront Rust Client
//!
//! An authenticated client for the storefront API: requests are signed with
//! the stored session, an expired access token triggers one shared refresh
//! for every caller that hit it, and payment operations run under bounded
//! timeout/retry budgets.

pub mod auth_client;
pub mod error;
pub mod payments;
pub mod refresh;
pub mod resilience;
pub mod signer;
pub mod token_store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use auth_client::{ApiClient, SessionClient, SessionConfig};
pub use error::{ClientError, Result};
pub use payments::{PaymentRoutes, PaymentsApi};
pub use refresh::RefreshCoordinator;
pub use resilience::{OperationClass, Reported, RetryBudget};
pub use token_store::{CredentialStore, FileStorage, MemoryStorage, StorageBackend, StoreConfig};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
pub use types::{CredentialEnvelope, SessionEvent};
