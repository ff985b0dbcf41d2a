//! Retry with exponential backoff and jitter.
//!
//! Attempt counting starts at 1 (the initial call). The delay between
//! attempt k and k+1 is
//! `min(base * 2^(k-1) + U(0, base * 2^(k-1) * jitter), max_delay_ms)`.

use std::future::Future;

use anyhow::Result;
use rand::Rng;
use tokio::time::{sleep, Duration};

pub type RetryablePredicate = fn(&str) -> bool;

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub is_retryable: RetryablePredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_factor: 0.3,
            is_retryable: default_is_retryable,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("jitter_factor", &self.jitter_factor)
            .finish()
    }
}

/// Transient failure classes worth retrying: connection errors, timeouts,
/// throttling and server-side 5xx responses.
pub fn default_is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    const PATTERNS: [&str; 10] = [
        "network",
        "econnrefused",
        "econnreset",
        "etimedout",
        "timeout",
        "socket hang up",
        "rate limit",
        "429",
        "5xx",
        "internal server error",
    ];
    if PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    // Bare HTTP 5xx status codes embedded in the message
    ["500", "502", "503", "504"].iter().any(|code| lower.contains(code))
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<anyhow::Error>,
    pub attempts: u32,
    pub total_delay_ms: u64,
}

impl RetryPolicy {
    /// Backoff for the delay after attempt `attempt` (1-based).
    fn delay_after_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        let base = (self.base_delay_ms as f64) * 2.0_f64.powi(exp as i32);
        let jitter_cap = base * self.jitter_factor;
        let jitter: f64 = if jitter_cap > 0.0 {
            rand::thread_rng().gen_range(0.0..jitter_cap)
        } else {
            0.0
        };
        ((base + jitter).min(self.max_delay_ms as f64)).max(0.0) as u64
    }
}

/// Run `operation` under `policy`. Never panics; the outcome carries the
/// final value or the last error plus attempt accounting.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut total_delay_ms: u64 = 0;
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 1..=policy.max_retries + 1 {
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    success: true,
                    value: Some(value),
                    error: None,
                    attempts: attempt,
                    total_delay_ms,
                };
            }
            Err(err) => {
                let message = err.to_string();
                let retryable = (policy.is_retryable)(&message);
                if attempt <= policy.max_retries && retryable {
                    let delay = policy.delay_after_attempt(attempt);
                    crate::logging::log(
                        crate::logging::Level::Warn,
                        crate::logging::Domain::System,
                        "retry",
                        crate::logging::obj(&[
                            ("operation", crate::logging::v_str(operation_name)),
                            ("attempt", serde_json::json!(attempt)),
                            ("delay_ms", serde_json::json!(delay)),
                            ("error", crate::logging::v_str(&message)),
                        ]),
                    );
                    total_delay_ms += delay;
                    sleep(Duration::from_millis(delay)).await;
                    last_error = Some(err);
                } else {
                    return RetryOutcome {
                        success: false,
                        value: None,
                        error: Some(err),
                        attempts: attempt,
                        total_delay_ms,
                    };
                }
            }
        }
    }

    RetryOutcome {
        success: false,
        value: None,
        error: last_error,
        attempts: policy.max_retries + 1,
        total_delay_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn default_predicate_matches_transients() {
        assert!(default_is_retryable("connect ECONNREFUSED 127.0.0.1"));
        assert!(default_is_retryable("request timeout"));
        assert!(default_is_retryable("HTTP 429 Too Many Requests"));
        assert!(default_is_retryable("502 Bad Gateway"));
        assert!(default_is_retryable("Internal Server Error"));
        assert!(!default_is_retryable("invalid params"));
        assert!(!default_is_retryable("execution reverted"));
    }

    #[test]
    fn delay_doubles_then_clamps() {
        let p = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.delay_after_attempt(1), 100);
        assert_eq!(p.delay_after_attempt(2), 200);
        assert_eq!(p.delay_after_attempt(3), 400);
        assert_eq!(p.delay_after_attempt(4), 500); // clamped
    }

    #[tokio::test]
    async fn first_try_success() {
        let outcome: RetryOutcome<u32> = with_retry(&fast(3), "op", || async { Ok(1) }).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.total_delay_ms, 0);
    }

    #[tokio::test]
    async fn eventual_success_counts_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let outcome: RetryOutcome<u32> = with_retry(&fast(3), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::anyhow!("timeout"))
                } else {
                    Ok(9)
                }
            }
        })
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.value, Some(9));
    }

    #[tokio::test]
    async fn total_attempts_bounded() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let outcome: RetryOutcome<u32> = with_retry(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("timeout"))
            }
        })
        .await;
        assert!(!outcome.success);
        assert_eq!(counter.load(Ordering::SeqCst), 4); // max_retries + 1
        assert_eq!(outcome.attempts, 4);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let outcome: RetryOutcome<u32> = with_retry(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("execution reverted"))
            }
        })
        .await;
        assert!(!outcome.success);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
    }
}
