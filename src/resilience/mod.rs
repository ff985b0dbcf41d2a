//! Resilience primitives used by every outbound RPC/HTTP call.

pub mod circuit;
pub mod retry;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::errors::WatchtowerError;
use self::circuit::CircuitBreaker;
use self::retry::{with_retry, RetryOutcome, RetryPolicy};

/// Compose retry and breaker: the breaker gates each retry attempt; the
/// final exhausted retry records one failure against the breaker.
pub async fn resilient<F, Fut, T>(
    policy: &RetryPolicy,
    breaker: &Arc<Mutex<CircuitBreaker>>,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let gated = || {
        let breaker = Arc::clone(breaker);
        let fut = operation();
        async move {
            {
                let mut cb = breaker.lock().await;
                if !cb.is_allowed() {
                    let (remaining_ms, failures) = cb.open_status();
                    return Err(WatchtowerError::CircuitOpen { remaining_ms, failures }.into());
                }
            }
            let result = fut.await;
            let mut cb = breaker.lock().await;
            match &result {
                Ok(_) => cb.record_success(),
                Err(err) => cb.record_failure(&err.to_string()),
            }
            result
        }
    };

    let outcome: RetryOutcome<T> = with_retry(policy, operation_name, gated).await;
    match outcome.value {
        Some(value) => Ok(value),
        None => Err(outcome
            .error
            .unwrap_or_else(|| anyhow::anyhow!("{} exhausted retries", operation_name))),
    }
}
