// =============================================================================
// Retry wrapper & adapter health tracking
// =============================================================================
//
// Contract: every outbound adapter operation runs through `with_retry`, which
// makes `max_retries` attempts with exponential backoff (base 1 s, cap 30 s).
// Only transient errors are retried. A success resets the consecutive-error
// count; five consecutive errors flip the adapter unhealthy. Recovery performs
// close -> sleep(backoff) -> initialize, bounded at three attempts.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::errors::ExchangeError;

/// Consecutive errors before an adapter is marked unhealthy.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Bounded recovery attempts while unhealthy.
const MAX_RECOVERY_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY_SECS: f64 = 1.0;
const MAX_RETRY_DELAY_SECS: f64 = 30.0;

/// Serialisable snapshot of one adapter's health.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterHealth {
    pub venue: String,
    pub is_healthy: bool,
    pub health_reason: Option<String>,
    pub reliability_score: f64,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub recovery_attempts: u32,
}

struct Inner {
    is_healthy: bool,
    health_reason: Option<String>,
    total_requests: u64,
    success_count: u64,
    error_count: u64,
    consecutive_errors: u32,
    last_update: Option<DateTime<Utc>>,
    last_error: Option<String>,
    recovery_attempts: u32,
}

/// Thread-safe health tracker shared by an adapter and its observers.
pub struct HealthTracker {
    venue: String,
    max_retries: u32,
    state: RwLock<Inner>,
}

impl HealthTracker {
    pub fn new(venue: impl Into<String>, max_retries: u32) -> Self {
        Self {
            venue: venue.into(),
            max_retries: max_retries.max(1),
            state: RwLock::new(Inner {
                is_healthy: true,
                health_reason: None,
                total_requests: 0,
                success_count: 0,
                error_count: 0,
                consecutive_errors: 0,
                last_update: None,
                last_error: None,
                recovery_attempts: 0,
            }),
        }
    }

    pub fn record_success(&self) {
        let mut s = self.state.write();
        s.total_requests += 1;
        s.success_count += 1;
        s.consecutive_errors = 0;
        s.last_update = Some(Utc::now());
        if !s.is_healthy {
            s.is_healthy = true;
            s.health_reason = None;
            info!(venue = %self.venue, "adapter recovered");
        }
    }

    pub fn record_error(&self, message: &str) {
        let mut s = self.state.write();
        s.total_requests += 1;
        s.error_count += 1;
        s.consecutive_errors += 1;
        s.last_error = Some(message.to_string());

        if s.consecutive_errors >= MAX_CONSECUTIVE_ERRORS && s.is_healthy {
            s.is_healthy = false;
            s.health_reason = Some(format!("too many consecutive errors: {message}"));
            warn!(
                venue = %self.venue,
                consecutive = s.consecutive_errors,
                "adapter marked unhealthy"
            );
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.read().is_healthy
    }

    /// Success rate over total requests; 1.0 before any traffic.
    pub fn reliability_score(&self) -> f64 {
        let s = self.state.read();
        if s.total_requests == 0 {
            1.0
        } else {
            s.success_count as f64 / s.total_requests as f64
        }
    }

    pub fn snapshot(&self) -> AdapterHealth {
        let s = self.state.read();
        AdapterHealth {
            venue: self.venue.clone(),
            is_healthy: s.is_healthy,
            health_reason: s.health_reason.clone(),
            reliability_score: if s.total_requests == 0 {
                1.0
            } else {
                s.success_count as f64 / s.total_requests as f64
            },
            total_requests: s.total_requests,
            success_count: s.success_count,
            error_count: s.error_count,
            consecutive_errors: s.consecutive_errors,
            last_update: s.last_update,
            last_error: s.last_error.clone(),
            recovery_attempts: s.recovery_attempts,
        }
    }

    fn begin_recovery(&self) -> Option<u32> {
        let mut s = self.state.write();
        if s.is_healthy {
            return None;
        }
        if s.recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
            return None;
        }
        s.recovery_attempts += 1;
        Some(s.recovery_attempts)
    }

    fn finish_recovery(&self, success: bool) {
        let mut s = self.state.write();
        if success {
            s.is_healthy = true;
            s.health_reason = None;
            s.consecutive_errors = 0;
            s.recovery_attempts = 0;
        }
    }

    pub fn backoff_delay(attempt: u32) -> Duration {
        let secs = (BASE_RETRY_DELAY_SECS * 2f64.powi(attempt.min(6) as i32))
            .min(MAX_RETRY_DELAY_SECS);
        Duration::from_secs_f64(secs)
    }
}

/// Run `op` up to `max_retries` times with exponential backoff.
///
/// Terminal (non-transient) errors are surfaced immediately without burning
/// the remaining attempts. One success records one success; an exhausted
/// budget records exactly one error.
pub async fn with_retry<T, F, Fut>(
    tracker: &HealthTracker,
    operation_name: &str,
    op: F,
) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let attempts = tracker.max_retries;
    let mut last_err: Option<ExchangeError> = None;

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => {
                tracker.record_success();
                return Ok(value);
            }
            Err(e) => {
                if !e.is_transient() {
                    tracker.record_error(&e.message);
                    error!(
                        venue = %tracker.venue,
                        operation = operation_name,
                        kind = %e.kind,
                        error = %e.message,
                        "terminal error, not retrying"
                    );
                    return Err(e);
                }

                let delay = HealthTracker::backoff_delay(attempt);
                if attempt + 1 < attempts {
                    warn!(
                        venue = %tracker.venue,
                        operation = operation_name,
                        attempt = attempt + 1,
                        max = attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %e.message,
                        "transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| {
        ExchangeError::transient(tracker.venue.clone(), "retry budget exhausted")
    });
    tracker.record_error(&err.message);
    error!(
        venue = %tracker.venue,
        operation = operation_name,
        attempts,
        error = %err.message,
        "operation failed after all retries"
    );
    Err(err)
}

/// Attempt to recover an unhealthy adapter: close, wait, re-initialize.
///
/// `close` and `init` are passed as closures so the tracker does not need a
/// handle to the adapter itself. Returns true when recovery succeeded.
pub async fn attempt_recovery<C, CF, I, IF>(tracker: &HealthTracker, close: C, init: I) -> bool
where
    C: FnOnce() -> CF,
    CF: Future<Output = Result<(), ExchangeError>>,
    I: FnOnce() -> IF,
    IF: Future<Output = Result<(), ExchangeError>>,
{
    let attempt = match tracker.begin_recovery() {
        Some(a) => a,
        None => return tracker.is_healthy(),
    };

    let delay = HealthTracker::backoff_delay(attempt);
    info!(
        venue = %tracker.venue,
        attempt,
        delay_secs = delay.as_secs_f64(),
        "attempting adapter recovery"
    );

    if let Err(e) = close().await {
        debug!(venue = %tracker.venue, error = %e.message, "error during close");
    }

    tokio::time::sleep(delay).await;

    match init().await {
        Ok(()) => {
            tracker.finish_recovery(true);
            info!(venue = %tracker.venue, "adapter recovery successful");
            true
        }
        Err(e) => {
            tracker.finish_recovery(false);
            error!(venue = %tracker.venue, attempt, error = %e.message, "adapter recovery failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::errors::ExchangeErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tracker() -> HealthTracker {
        HealthTracker::new("binance_futures", 3)
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_op_that_recovers_records_one_success_no_errors() {
        let t = tracker();
        let calls = AtomicU32::new(0);

        let result = with_retry(&t, "get_funding_rates", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::transient("binance_futures", "connection reset"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        let snap = t.snapshot();
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.error_count, 0);
        assert!(snap.is_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_records_one_error_no_success() {
        let t = tracker();

        let result: Result<u32, _> = with_retry(&t, "get_funding_rates", || async {
            Err(ExchangeError::transient("binance_futures", "connection reset"))
        })
        .await;

        assert!(result.is_err());
        let snap = t.snapshot();
        assert_eq!(snap.success_count, 0);
        assert_eq!(snap.error_count, 1);
    }

    #[tokio::test]
    async fn terminal_error_surfaces_without_retry() {
        let t = tracker();
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = with_retry(&t, "place_order", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ExchangeError::new(
                    ExchangeErrorKind::InsufficientBalance,
                    "binance_futures",
                    "margin is insufficient",
                ))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ExchangeErrorKind::InsufficientBalance);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn five_consecutive_errors_flip_unhealthy() {
        let t = tracker();
        for _ in 0..4 {
            t.record_error("boom");
            assert!(t.is_healthy());
        }
        t.record_error("boom");
        assert!(!t.is_healthy());

        t.record_success();
        assert!(t.is_healthy());
        assert_eq!(t.snapshot().consecutive_errors, 0);
    }

    #[test]
    fn reliability_score_tracks_success_ratio() {
        let t = tracker();
        assert!((t.reliability_score() - 1.0).abs() < f64::EPSILON);
        t.record_success();
        t.record_success();
        t.record_error("x");
        let expected = 2.0 / 3.0;
        assert!((t.reliability_score() - expected).abs() < 1e-9);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(HealthTracker::backoff_delay(0), Duration::from_secs(1));
        assert_eq!(HealthTracker::backoff_delay(1), Duration::from_secs(2));
        assert_eq!(HealthTracker::backoff_delay(10), Duration::from_secs(30));
    }
}
