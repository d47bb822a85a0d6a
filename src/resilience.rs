//! Timeout and retry policies for critical operations

use crate::error::{ClientError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout and retry settings for one class of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Ceiling on each attempt
    pub timeout: Duration,
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt
    pub base_delay: Duration,
}

impl RetryBudget {
    pub fn new(timeout: Duration, max_attempts: u32, base_delay: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(ClientError::Configuration(
                "a retry budget needs at least one attempt".to_string(),
            ));
        }
        Ok(Self {
            timeout,
            max_attempts,
            base_delay,
        })
    }

    /// One attempt, no retry
    pub const fn single_attempt(timeout: Duration) -> Self {
        Self {
            timeout,
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Sleep before attempt `attempt` (1-based): `base_delay * 2^(attempt - 2)`
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// The critical operations that get their own budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    CreatePaymentOrder,
    /// Replaying a verification with its one-time signature is unsafe
    VerifyPayment,
    /// Telemetry only, must never break the caller
    ReportPaymentFailure,
    ProcessRefund,
}

impl OperationClass {
    pub fn name(self) -> &'static str {
        match self {
            OperationClass::CreatePaymentOrder => "create payment order",
            OperationClass::VerifyPayment => "verify payment",
            OperationClass::ReportPaymentFailure => "report payment failure",
            OperationClass::ProcessRefund => "process refund",
        }
    }

    pub fn budget(self) -> RetryBudget {
        match self {
            OperationClass::CreatePaymentOrder => RetryBudget {
                timeout: Duration::from_secs(30),
                max_attempts: 3,
                base_delay: Duration::from_millis(2000),
            },
            OperationClass::VerifyPayment => RetryBudget::single_attempt(Duration::from_secs(45)),
            OperationClass::ReportPaymentFailure => {
                RetryBudget::single_attempt(Duration::from_secs(15))
            }
            OperationClass::ProcessRefund => RetryBudget::single_attempt(Duration::from_secs(30)),
        }
    }

    pub fn is_best_effort(self) -> bool {
        matches!(self, OperationClass::ReportPaymentFailure)
    }
}

/// Outcome of a best-effort operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reported<T> {
    Delivered(T),
    /// The operation failed and the failure was swallowed
    Skipped,
}

impl<T> Reported<T> {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Reported::Delivered(_))
    }
}

/// Race `operation` against `limit`
///
/// On timeout the operation future is dropped, which cancels it at its next
/// suspension point; a request already on the wire may still reach the server.
pub async fn with_timeout<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "Operation timed out");
            Err(ClientError::Timeout {
                operation,
                after: limit,
            })
        }
    }
}

/// Run `op` up to `budget.max_attempts` times with exponential backoff
///
/// Each attempt is bounded by `budget.timeout`. Errors that are not
/// [retriable](ClientError::is_retriable) end the loop at once; otherwise the
/// last attempt's error is returned.
pub async fn with_retry<T, F, Fut>(operation: &'static str, budget: RetryBudget, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let err = match with_timeout(operation, budget.timeout, op()).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if attempt >= budget.max_attempts || !err.is_retriable() {
            return Err(err);
        }

        attempt += 1;
        let delay = budget.delay_before(attempt);
        warn!(
            operation,
            attempt,
            max_attempts = budget.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Run `op` under the budget of `class`
pub async fn run<T, F, Fut>(class: OperationClass, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry(class.name(), class.budget(), op).await
}

/// Run a non-critical `op`, turning any failure into [`Reported::Skipped`]
pub async fn best_effort<T, F, Fut>(class: OperationClass, op: F) -> Reported<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match run(class, op).await {
        Ok(value) => Reported::Delivered(value),
        Err(e) => {
            warn!(operation = class.name(), error = %e, "Best-effort operation failed, continuing");
            Reported::Skipped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn unavailable(attempt: u32) -> ClientError {
        ClientError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: format!("attempt {attempt}"),
        }
    }

    #[test]
    fn test_budget_requires_an_attempt() {
        assert!(RetryBudget::new(Duration::from_secs(1), 0, Duration::ZERO).is_err());
        assert!(RetryBudget::new(Duration::from_secs(1), 1, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_delay_schedule() {
        let budget = RetryBudget::new(Duration::from_secs(30), 5, Duration::from_millis(2000)).unwrap();
        assert_eq!(budget.delay_before(1), Duration::ZERO);
        assert_eq!(budget.delay_before(2), Duration::from_millis(2000));
        assert_eq!(budget.delay_before(3), Duration::from_millis(4000));
        assert_eq!(budget.delay_before(4), Duration::from_millis(8000));
        // Saturates instead of overflowing
        assert_eq!(budget.delay_before(200), Duration::from_millis(2000).saturating_mul(u32::MAX));
    }

    #[test]
    fn test_operation_budgets() {
        assert_eq!(OperationClass::CreatePaymentOrder.budget().max_attempts, 3);
        assert_eq!(OperationClass::VerifyPayment.budget().max_attempts, 1);
        assert_eq!(OperationClass::ProcessRefund.budget().max_attempts, 1);
        assert_eq!(
            OperationClass::VerifyPayment.budget().timeout,
            Duration::from_secs(45)
        );
        assert!(OperationClass::ReportPaymentFailure.is_best_effort());
        assert!(!OperationClass::ProcessRefund.is_best_effort());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_wait_for_slow_operation() {
        let started = Instant::now();
        let result: Result<()> = with_timeout("slow", Duration::from_millis(500), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ClientError::Timeout { operation: "slow", .. })));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(510));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_last_error() {
        let budget = RetryBudget::new(Duration::from_secs(30), 3, Duration::from_millis(2000)).unwrap();
        let started = Instant::now();
        let attempts_at = Mutex::new(Vec::new());
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retry("create payment order", budget, || {
            attempts_at.lock().unwrap().push(started.elapsed());
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(unavailable(attempt)) }
        })
        .await;

        match result {
            Err(ClientError::Status { body, .. }) => assert_eq!(body, "attempt 3"),
            other => panic!("unexpected result: {other:?}"),
        }

        let attempts_at = attempts_at.into_inner().unwrap();
        assert_eq!(attempts_at.len(), 3);
        let near = |actual: Duration, expected_ms: u64| {
            let expected = Duration::from_millis(expected_ms);
            actual >= expected && actual < expected + Duration::from_millis(10)
        };
        // ~2000ms before the second attempt, ~4000ms before the third
        assert!(near(attempts_at[0], 0));
        assert!(near(attempts_at[1], 2000), "{:?}", attempts_at[1]);
        assert!(near(attempts_at[2], 6000), "{:?}", attempts_at[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_first_success() {
        let budget = RetryBudget::new(Duration::from_secs(30), 3, Duration::from_millis(100)).unwrap();
        let attempts = AtomicU32::new(0);

        let result = with_retry("create payment order", budget, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 2 {
                    Err(unavailable(attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempts_are_retried() {
        let budget = RetryBudget::new(Duration::from_secs(1), 2, Duration::from_millis(100)).unwrap();
        let attempts = AtomicU32::new(0);

        let result = with_retry("create payment order", budget, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_non_retriable_error_stops_immediately() {
        let budget = RetryBudget::new(Duration::from_secs(30), 3, Duration::from_millis(100)).unwrap();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = with_retry("create payment order", budget, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::SessionExpired("refresh token revoked".to_string())) }
        })
        .await;

        assert!(result.unwrap_err().is_session_expired());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_class_is_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = run(OperationClass::VerifyPayment, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(unavailable(attempt)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_swallows_failure() {
        let started = Instant::now();
        let reported: Reported<()> = best_effort(OperationClass::ReportPaymentFailure, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(reported, Reported::Skipped);
        assert!(started.elapsed() < Duration::from_secs(16));

        let delivered = best_effort(OperationClass::ReportPaymentFailure, || async { Ok(7) }).await;
        assert_eq!(delivered, Reported::Delivered(7));
        assert!(delivered.is_delivered());
    }
}
