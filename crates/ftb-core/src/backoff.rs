//! Retry-with-backoff executor for unreliable outbound calls.
//!
//! Failures are classified by `Error::failure_kind()`; only kinds in the
//! policy's retryable set are retried. Delays grow as
//! `base_delay * 2^(attempt-1)`, capped at `max_delay`, and the executor gives
//! up when either `max_attempts` invocations were made or the next wait would
//! exceed `max_elapsed`.
//!
//! A failure that carries a callee-mandated wait (`Error::retry_after()`) is
//! honoured once per call: the executor sleeps exactly that long and makes one
//! extra attempt that does not count against `max_attempts`.

use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::{
    config::RetryConfig,
    errors::{Error, FailureKind},
    Result,
};

/// One invocation of the wrapped operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Time since the first attempt started.
    pub elapsed: Duration,
    pub failure: Option<FailureKind>,
}

/// Emitted before every retry wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryEvent {
    pub attempt: RetryAttempt,
    pub delay: Duration,
    /// The wait was mandated by the callee rather than the exponential schedule.
    pub mandated: bool,
}

pub type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable: HashSet<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            max_elapsed: cfg.max_elapsed,
            base_delay: cfg.base_delay,
            max_delay: cfg.max_delay,
            retryable: default_retryable(),
        }
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Exponential delay after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Transient transport failures: timeouts, resets, explicit backoff signals.
pub fn default_retryable() -> HashSet<FailureKind> {
    [
        FailureKind::Timeout,
        FailureKind::Connection,
        FailureKind::RateLimited,
        FailureKind::ServerError,
    ]
    .into_iter()
    .collect()
}

#[derive(Clone)]
pub struct BackoffExecutor {
    policy: RetryPolicy,
    on_retry: Option<RetryHook>,
}

impl std::fmt::Debug for BackoffExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffExecutor")
            .field("policy", &self.policy)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl BackoffExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            on_retry: None,
        }
    }

    pub fn with_hook(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut invocations: u32 = 0;
        let mut mandated_used = false;

        loop {
            attempt += 1;
            invocations += 1;
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            let kind = err.failure_kind();
            if !self.policy.is_retryable(kind) {
                return Err(err);
            }

            let elapsed = started.elapsed();
            let record = RetryAttempt {
                attempt: invocations,
                elapsed,
                failure: Some(kind),
            };

            let (delay, mandated) = match err.retry_after() {
                Some(wait) if !mandated_used => (wait, true),
                _ => {
                    if attempt >= self.policy.max_attempts {
                        return Err(exhausted(invocations, elapsed, err));
                    }
                    (self.policy.delay_for(attempt), false)
                }
            };

            if elapsed.saturating_add(delay) > self.policy.max_elapsed {
                return Err(exhausted(invocations, elapsed, err));
            }

            if mandated {
                // The extra attempt after a mandated wait is not counted.
                mandated_used = true;
                attempt -= 1;
            }

            let event = RetryEvent {
                attempt: record,
                delay,
                mandated,
            };
            warn!(
                attempt = event.attempt.attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %kind,
                mandated,
                "retrying after failure: {err}"
            );
            if let Some(hook) = &self.on_retry {
                hook(&event);
            }

            sleep(delay).await;
        }
    }
}

fn exhausted(attempts: u32, elapsed: Duration, last: Error) -> Error {
    Error::RetryExhausted {
        attempts,
        elapsed,
        last: Box::new(last),
    }
}
