//! Retry/backoff state machine around the extraction backend.
//!
//! ```text
//! PENDING ──▶ ATTEMPTING ──▶ SUCCESS
//!                 │  ▲
//!        retryable│  │after delay
//!                 ▼  │
//!             RETRY_WAIT
//!                 │
//!   budget spent / not retryable ──▶ FAILED
//! ```
//!
//! Only quota-style failures are retried. Everything else (bad request,
//! malformed reply, auth) fails on the first attempt, because trying again
//! would produce the same answer.
//!
//! ## Backoff
//!
//! `delay(a) = min(max_delay, base × multiplier^(a−1) + jitter)` with jitter
//! uniform in `[0, 0.3 × base)`. With the defaults (1 s, ×2, cap 30 s) the
//! waits are roughly 1 s → 2 s → 4 s before the fourth and final attempt.

use crate::error::{BackendError, PipelineError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Fraction of the base delay used as the jitter ceiling.
const JITTER_FRACTION: f64 = 0.3;

static RE_RETRYABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)resource[ _]exhausted|rate limit|429|quota").expect("static regex")
});

/// Retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one. Default: 4.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds. Default: 1000.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds. Default: 30 000.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays. Default: 2.0.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "Retry policy needs at least one attempt".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "Backoff multiplier must be ≥ 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(PipelineError::InvalidConfig(format!(
                "Max delay ({} ms) is below base delay ({} ms)",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (1-based).
    ///
    /// `jitter` is a sample from `[0, 1)`; it is scaled to
    /// `[0, 0.3 × base)` before the cap is applied.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.base_delay_ms as f64;
        let exp = attempt.saturating_sub(1) as i32;
        let raw = base * self.backoff_multiplier.powi(exp)
            + jitter.clamp(0.0, 1.0) * JITTER_FRACTION * base;
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// `true` when a backend failure is worth another attempt.
///
/// A structured 429 wins; otherwise the error text decides.
pub fn is_retryable(err: &BackendError) -> bool {
    err.status == Some(429) || RE_RETRYABLE.is_match(&err.message)
}

/// Where one call currently sits in the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Attempting { attempt: u32 },
    RetryWait { attempt: u32, delay: Duration },
    Success { attempts: u32 },
    Failed { attempts: u32 },
}

/// Result of driving one call to a terminal state.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, BackendError>,
    /// Attempts actually made.
    pub attempts: u32,
    /// Every backoff delay slept, in order.
    pub delays: Vec<Duration>,
}

/// Drive `op` through the state machine until it succeeds or fails for good.
///
/// `op` receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut state = AttemptState::Pending;
    let mut delays = Vec::new();
    let mut last_err: Option<BackendError> = None;
    let mut value: Option<T> = None;

    loop {
        state = match state {
            AttemptState::Pending => AttemptState::Attempting { attempt: 1 },

            AttemptState::Attempting { attempt } => match op(attempt).await {
                Ok(v) => {
                    debug!("{}: succeeded on attempt {}", label, attempt);
                    value = Some(v);
                    AttemptState::Success { attempts: attempt }
                }
                Err(e) if attempt < policy.max_attempts && is_retryable(&e) => {
                    let delay = policy.delay_for(attempt, rand::random::<f64>());
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        label, attempt, policy.max_attempts, e, delay
                    );
                    last_err = Some(e);
                    AttemptState::RetryWait { attempt, delay }
                }
                Err(e) => {
                    warn!("{}: attempt {} failed, giving up: {}", label, attempt, e);
                    last_err = Some(e);
                    AttemptState::Failed { attempts: attempt }
                }
            },

            AttemptState::RetryWait { attempt, delay } => {
                tokio::time::sleep(delay).await;
                delays.push(delay);
                AttemptState::Attempting {
                    attempt: attempt + 1,
                }
            }

            AttemptState::Success { attempts } | AttemptState::Failed { attempts } => {
                let result = match value.take() {
                    Some(v) => Ok(v),
                    None => Err(last_err
                        .take()
                        .unwrap_or_else(|| BackendError::new("retry loop ended without a result"))),
                };
                return RetryOutcome {
                    result,
                    attempts,
                    delays,
                };
            }
        };
    }
}
