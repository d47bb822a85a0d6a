//! Critical payment calls, each under its own timeout/retry budget

use crate::auth_client::ApiClient;
use crate::error::Result;
use crate::resilience::{self, OperationClass, Reported};
use crate::transport::ApiRequest;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Backend paths of the payment operations
#[derive(Debug, Clone)]
pub struct PaymentRoutes {
    pub create_order: String,
    pub verify: String,
    pub report_failure: String,
    pub refund: String,
}

impl Default for PaymentRoutes {
    fn default() -> Self {
        Self {
            create_order: "/payments/create-order".to_string(),
            verify: "/payments/verify".to_string(),
            report_failure: "/payments/failure".to_string(),
            refund: "/payments/refund".to_string(),
        }
    }
}

/// Payment operations routed through an [`ApiClient`]
pub struct PaymentsApi<C> {
    client: C,
    routes: PaymentRoutes,
}

impl<C: ApiClient> PaymentsApi<C> {
    pub fn new(client: C) -> Self {
        Self::with_routes(client, PaymentRoutes::default())
    }

    pub fn with_routes(client: C, routes: PaymentRoutes) -> Self {
        Self { client, routes }
    }

    /// Create a payment order; safe to retry with backoff
    pub async fn create_order<B, R>(&self, order: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(order)?;
        resilience::run(OperationClass::CreatePaymentOrder, || {
            self.post(&self.routes.create_order, &body)
        })
        .await
    }

    /// Verify a completed payment; a single attempt only
    pub async fn verify_payment<B, R>(&self, verification: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(verification)?;
        resilience::run(OperationClass::VerifyPayment, || {
            self.post(&self.routes.verify, &body)
        })
        .await
    }

    /// Record a failed payment for later inspection
    ///
    /// Never fails: an undeliverable report comes back as [`Reported::Skipped`].
    pub async fn record_failure<B>(&self, report: &B) -> Reported<()>
    where
        B: Serialize + ?Sized,
    {
        let body = match serde_json::to_value(report) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Payment failure report is not serializable");
                return Reported::Skipped;
            }
        };

        resilience::best_effort(OperationClass::ReportPaymentFailure, || async {
            self.post::<Value>(&self.routes.report_failure, &body)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Refund a payment; a single attempt only
    pub async fn process_refund<B, R>(&self, refund: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(refund)?;
        resilience::run(OperationClass::ProcessRefund, || {
            self.post(&self.routes.refund, &body)
        })
        .await
    }

    async fn post<R: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<R> {
        let request = ApiRequest::post(path).json(body)?;
        let response = self.client.send(request).await?.error_for_status()?;

        if response.body.is_empty() {
            // Some endpoints acknowledge with an empty 2xx
            return Ok(serde_json::from_value(Value::Null)?);
        }
        response.json()
    }
}
