use crate::aggregator::JobResult;
use remote::{AttemptOutcome, Credentials, Executor, ExitReason, Target, TransferSpec};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("max attempts must be at least 1")]
    ZeroAttempts,
    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
}

/// How many times to try one target and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: std::time::Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: std::time::Duration) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        Ok(Self {
            max_attempts,
            delay,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> std::time::Duration {
        self.delay
    }
}

/// Runs attempts against `target` until one succeeds, one is cancelled or the policy is exhausted.
///
/// The returned result always carries the most recent attempt's outcome. When cancellation
/// arrives before the first attempt or during a delay, the outcome is a synthesized `Cancelled`
/// and `attempts_made` counts only the attempts that actually ran.
#[tracing::instrument(skip(executor, spec, credentials, policy, cancel), fields(target = %target))]
pub async fn run_with_retry(
    executor: &dyn Executor,
    target: &Target,
    spec: &TransferSpec,
    credentials: &Credentials,
    policy: &RetryPolicy,
    timeout: std::time::Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> JobResult {
    let progress = common::get_progress();
    let mut attempts_made = 0;
    let mut last: Option<AttemptOutcome> = None;
    let mut interrupted = false;
    for attempt in 1..=policy.max_attempts {
        if let Some(previous) = &last {
            tracing::info!(
                "{}: attempt {}/{} failed ({}: {}), retrying in {}",
                target,
                previous.attempt_number,
                policy.max_attempts,
                previous.exit_reason,
                previous.message,
                humantime::format_duration(policy.delay)
            );
            tokio::select! {
                _ = tokio::time::sleep(policy.delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
        if cancel.is_cancelled() {
            interrupted = true;
            break;
        }
        if attempt > 1 {
            progress.retries.inc();
        }
        attempts_made = attempt;
        progress.attempts.inc();
        let outcome = executor
            .execute(target, spec, credentials, timeout, cancel, attempt)
            .await;
        let done = outcome.succeeded || outcome.exit_reason == ExitReason::Cancelled;
        last = Some(outcome);
        if done {
            break;
        }
    }
    let final_outcome = match last {
        Some(outcome) if !interrupted => outcome,
        _ => AttemptOutcome::cancelled(target, attempts_made),
    };
    if !final_outcome.succeeded {
        tracing::warn!(
            "{}: giving up after {} attempt(s): {} ({})",
            target,
            attempts_made,
            final_outcome.exit_reason,
            final_outcome.message
        );
    }
    JobResult {
        target: target.clone(),
        final_outcome,
        attempts_made,
    }
}
