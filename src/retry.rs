//! Retry and backoff engine.
//!
//! Every API call runs through [`RetryPolicy::run`], which drives a small
//! state machine:
//!
//! ```text
//! Idle -> Sending -> Success
//!                 -> RetryableError -> Backoff -> Sending
//!                 -> TerminalError
//! ```
//!
//! The decision to retry is a pure function ([`RetryPolicy::decide`]) of
//! the error, the attempt number, the time already spent, and the
//! operation's idempotency, so it can be tested without any I/O.
//!
//! Idempotency follows three strategies.  Reads and deletes addressed by
//! generation are always safe to repeat.  Mutations are *conditional*:
//! they are only safe when they carry a precondition such as
//! `ifGenerationMatch`, because a retried write without one could apply
//! twice.  Non-idempotent calls (creating an HMAC key, a notification) are
//! never retried.

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::{Result, StorageError};
use crate::metrics;

/// HTTP statuses that indicate a transient failure.
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Error reasons that indicate a transient failure regardless of status.
const RETRYABLE_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "backendError",
    "internalError",
];

/// Upper bound on the random jitter added to each backoff delay.
const MAX_JITTER: Duration = Duration::from_millis(1000);

/// Which operations the client may retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStrategy {
    /// Retry idempotent and conditional operations even without a
    /// precondition.
    RetryAlways,
    /// Retry conditional operations only when a precondition is present.
    #[default]
    RetryConditional,
    /// Never retry.
    RetryNever,
}

/// Retry safety of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Repeating the request cannot change the outcome.
    Idempotent,
    /// Safe to repeat only when a precondition pins the target state.
    Conditional { precondition_set: bool },
    /// Repeating the request could create duplicate resources.
    NonIdempotent,
}

impl Idempotency {
    /// Conditional idempotency keyed on whether a precondition is present.
    pub fn conditional(precondition_set: bool) -> Self {
        Idempotency::Conditional { precondition_set }
    }
}

/// States of the per-operation retry machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Sending { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

/// Why the engine stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The error is not transient.
    NotRetryable,
    /// The operation's idempotency forbids a retry under the strategy.
    UnsafeToRetry,
    /// `max_retries` retries have already been made.
    MaxRetries,
    /// The next delay would overrun the total timeout.
    BudgetExhausted,
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Stop(StopReason),
}

/// Whether an error is transient.
pub fn is_retryable(err: &StorageError) -> bool {
    match err {
        StorageError::Http(e) => {
            if let Some(status) = e.status() {
                return RETRYABLE_STATUSES.contains(&status.as_u16());
            }
            e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
        }
        StorageError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::UnexpectedEof
        ),
        StorageError::UploadStalled { .. } => true,
        _ => {
            if let Some(status) = err.status_code() {
                if RETRYABLE_STATUSES.contains(&status.as_u16()) {
                    return true;
                }
            }
            err.reasons()
                .iter()
                .any(|r| RETRYABLE_REASONS.contains(&r.as_str()))
        }
    }
}

/// Whether an operation with the given idempotency may be retried.
pub fn should_retry_operation(idempotency: Idempotency, strategy: IdempotencyStrategy) -> bool {
    match (strategy, idempotency) {
        (IdempotencyStrategy::RetryNever, _) => false,
        (_, Idempotency::NonIdempotent) => false,
        (_, Idempotency::Idempotent) => true,
        (IdempotencyStrategy::RetryAlways, Idempotency::Conditional { .. }) => true,
        (IdempotencyStrategy::RetryConditional, Idempotency::Conditional { precondition_set }) => {
            precondition_set
        }
    }
}

/// Capped exponential backoff bound to a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::new(RetryConfig {
            auto_retry: false,
            ..RetryConfig::default()
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry_index` (0-based), before capping
    /// and including `jitter`.
    pub fn delay_for(&self, retry_index: u32, jitter: Duration) -> Duration {
        let base = self.config.initial_delay().as_secs_f64()
            * self
                .config
                .retry_delay_multiplier
                .powi(retry_index.min(i32::MAX as u32) as i32);
        let max = self.config.max_retry_delay();
        if !base.is_finite() || base >= max.as_secs_f64() {
            return max;
        }
        (Duration::from_secs_f64(base) + jitter).min(max)
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed.
    pub fn decide(
        &self,
        err: &StorageError,
        attempt: u32,
        elapsed: Duration,
        idempotency: Idempotency,
        jitter: Duration,
    ) -> RetryDecision {
        if !is_retryable(err) {
            return RetryDecision::Stop(StopReason::NotRetryable);
        }
        if !self.config.auto_retry
            || !should_retry_operation(idempotency, self.config.idempotency_strategy)
        {
            return RetryDecision::Stop(StopReason::UnsafeToRetry);
        }
        if attempt > self.config.max_retries {
            return RetryDecision::Stop(StopReason::MaxRetries);
        }

        let delay = match err.retry_after() {
            Some(server_delay) => server_delay.min(self.config.max_retry_delay()),
            None => self.delay_for(attempt - 1, jitter),
        };

        let remaining = self.config.total_timeout().saturating_sub(elapsed);
        if delay >= remaining {
            return RetryDecision::Stop(StopReason::BudgetExhausted);
        }
        RetryDecision::Retry(delay)
    }

    /// Run `op` until it succeeds, fails terminally, or the retry budget
    /// is spent.
    ///
    /// `op` receives the 1-based attempt number.  Each attempt is bounded
    /// by the remaining total timeout; `cancel` aborts both in-flight
    /// attempts and backoff sleeps.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        idempotency: Idempotency,
        cancel: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let deadline = started + self.config.total_timeout();
        let mut state = RetryState::Idle;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            state = transition(state, RetryState::Sending { attempt });

            let outcome = tokio::select! {
                biased;
                _ = cancelled(cancel) => Err(StorageError::Cancelled),
                res = tokio::time::timeout_at(deadline, op(attempt)) => {
                    res.unwrap_or(Err(StorageError::Timeout))
                }
            };

            let err = match outcome {
                Ok(value) => {
                    transition(state, RetryState::Succeeded { attempts: attempt });
                    return Ok(value);
                }
                Err(e @ (StorageError::Cancelled | StorageError::Timeout)) => {
                    transition(state, RetryState::Failed { attempts: attempt });
                    return Err(e);
                }
                Err(e) => e,
            };

            let jitter = random_jitter();
            match self.decide(&err, attempt, started.elapsed(), idempotency, jitter) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        "{} attempt {} failed: {}; retrying in {:?}",
                        operation, attempt, err, delay
                    );
                    metrics::record_retry(operation);
                    state = transition(state, RetryState::Backoff { attempt, delay });
                    tokio::select! {
                        biased;
                        _ = cancelled(cancel) => {
                            transition(state, RetryState::Failed { attempts: attempt });
                            return Err(StorageError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Stop(reason) => {
                    transition(state, RetryState::Failed { attempts: attempt });
                    return Err(match reason {
                        StopReason::MaxRetries | StopReason::BudgetExhausted if attempt > 1 => {
                            StorageError::RetriesExhausted {
                                attempts: attempt,
                                last: Box::new(err),
                            }
                        }
                        _ => err,
                    });
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn transition(from: RetryState, to: RetryState) -> RetryState {
    debug!("retry state {:?} -> {:?}", from, to);
    to
}

pub(crate) fn random_jitter() -> Duration {
    let millis = rand::thread_rng().gen_range(0..MAX_JITTER.as_millis() as u64);
    Duration::from_millis(millis)
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(status: u16, reason: Option<&str>) -> StorageError {
        StorageError::Api {
            status: StatusCode::from_u16(status).unwrap(),
            message: "boom".to_string(),
            reasons: reason.map(|r| vec![r.to_string()]).unwrap_or_default(),
            retry_after: None,
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable(&api_error(status, None)), "{status}");
        }
        for status in [400, 401, 403, 409, 501] {
            assert!(!is_retryable(&api_error(status, None)), "{status}");
        }
        assert!(!is_retryable(&StorageError::PreconditionFailed));
        assert!(!is_retryable(&StorageError::NotFound {
            resource: "b".to_string()
        }));
    }

    #[test]
    fn test_retryable_reasons() {
        assert!(is_retryable(&api_error(403, Some("rateLimitExceeded"))));
        assert!(is_retryable(&api_error(403, Some("userRateLimitExceeded"))));
        assert!(!is_retryable(&api_error(403, Some("forbidden"))));
    }

    #[test]
    fn test_retryable_io_errors() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(is_retryable(&StorageError::Io(reset)));
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(!is_retryable(&StorageError::Io(missing)));
    }

    #[test]
    fn test_stalled_upload_is_retryable() {
        assert!(is_retryable(&StorageError::UploadStalled { offset: 262144 }));
        assert!(!is_retryable(&StorageError::UploadSessionExpired));
    }

    #[test]
    fn test_idempotency_strategies() {
        use IdempotencyStrategy::*;
        let cond_unset = Idempotency::conditional(false);
        let cond_set = Idempotency::conditional(true);

        assert!(should_retry_operation(Idempotency::Idempotent, RetryConditional));
        assert!(should_retry_operation(cond_set, RetryConditional));
        assert!(!should_retry_operation(cond_unset, RetryConditional));
        assert!(should_retry_operation(cond_unset, RetryAlways));
        assert!(!should_retry_operation(Idempotency::NonIdempotent, RetryAlways));
        assert!(!should_retry_operation(Idempotency::Idempotent, RetryNever));
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0, Duration::ZERO), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5, Duration::ZERO), Duration::from_secs(32));
        assert_eq!(policy.delay_for(6, Duration::ZERO), Duration::from_secs(64));
        assert_eq!(policy.delay_for(7, Duration::ZERO), Duration::from_secs(64));
        assert_eq!(policy.delay_for(500, Duration::ZERO), Duration::from_secs(64));
        assert_eq!(
            policy.delay_for(0, Duration::from_millis(250)),
            Duration::from_millis(1250)
        );
    }

    #[test]
    fn test_decide_stops_on_terminal_error() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(
            &api_error(400, None),
            1,
            Duration::ZERO,
            Idempotency::Idempotent,
            Duration::ZERO,
        );
        assert_eq!(decision, RetryDecision::Stop(StopReason::NotRetryable));
    }

    #[test]
    fn test_decide_conditional_without_precondition() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(
            &api_error(503, None),
            1,
            Duration::ZERO,
            Idempotency::conditional(false),
            Duration::ZERO,
        );
        assert_eq!(decision, RetryDecision::Stop(StopReason::UnsafeToRetry));
    }

    #[test]
    fn test_decide_max_retries() {
        let policy = RetryPolicy::default();
        let err = api_error(503, None);
        let idem = Idempotency::Idempotent;
        assert_eq!(
            policy.decide(&err, 3, Duration::ZERO, idem, Duration::ZERO),
            RetryDecision::Retry(Duration::from_secs(4))
        );
        assert_eq!(
            policy.decide(&err, 4, Duration::ZERO, idem, Duration::ZERO),
            RetryDecision::Stop(StopReason::MaxRetries)
        );
    }

    #[test]
    fn test_decide_budget_exhausted() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(
            &api_error(500, None),
            2,
            Duration::from_millis(599_000),
            Idempotency::Idempotent,
            Duration::ZERO,
        );
        assert_eq!(decision, RetryDecision::Stop(StopReason::BudgetExhausted));
    }

    #[test]
    fn test_decide_honors_retry_after() {
        let policy = RetryPolicy::default();
        let err = api_error(429, None).with_retry_after(Some(Duration::from_secs(7)));
        assert_eq!(
            policy.decide(&err, 1, Duration::ZERO, Idempotency::Idempotent, Duration::ZERO),
            RetryDecision::Retry(Duration::from_secs(7))
        );
        let err = api_error(429, None).with_retry_after(Some(Duration::from_secs(3600)));
        assert_eq!(
            policy.decide(&err, 1, Duration::ZERO, Idempotency::Idempotent, Duration::ZERO),
            RetryDecision::Retry(Duration::from_secs(64))
        );
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);
        let result = policy
            .run("get_object", Idempotency::Idempotent, None, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(api_error(503, None))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_exhausts_retries() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);
        let err = policy
            .run("get_object", Idempotency::Idempotent, None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(api_error(500, None)) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            StorageError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert_eq!(last.status_code(), Some(StatusCode::INTERNAL_SERVER_ERROR));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_does_not_retry_unconditional_write() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);
        let err = policy
            .run("upload", Idempotency::conditional(false), None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(api_error(503, None)) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.status_code(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_run_terminal_error_passes_through() {
        let policy = RetryPolicy::new(fast_config());
        let err = policy
            .run("get_object", Idempotency::Idempotent, None, |_| async {
                Err::<(), _>(StorageError::PreconditionFailed)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed));
    }

    #[tokio::test]
    async fn test_run_total_timeout() {
        let policy = RetryPolicy::new(RetryConfig {
            total_timeout_ms: 20,
            ..fast_config()
        });
        let err = policy
            .run("slow", Idempotency::Idempotent, None, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), StorageError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout));
    }

    #[tokio::test]
    async fn test_run_cancellation() {
        let policy = RetryPolicy::new(fast_config());
        let token = CancellationToken::new();
        token.cancel();
        let err = policy
            .run("get_object", Idempotency::Idempotent, Some(&token), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), StorageError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
    }

    #[tokio::test]
    async fn test_never_policy() {
        let policy = RetryPolicy::never();
        let calls = AtomicU32::new(0);
        let _ = policy
            .run("get_object", Idempotency::Idempotent, None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(api_error(503, None)) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
