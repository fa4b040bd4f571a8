use crate::aggregator::{Aggregator, BatchReport, JobResult};
use crate::cancel::CancellationManager;
use crate::retry::{PolicyError, RetryPolicy, run_with_retry};
use remote::{AttemptOutcome, Credentials, Executor, ExitReason, Target, TransferSpec};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Extra time past the grace period before stuck units are aborted
const ABORT_MARGIN: std::time::Duration = std::time::Duration::from_secs(2);

/// Everything a unit of work needs; shared read-only by all units of every pass.
#[derive(Clone)]
pub struct BatchPlan {
    executor: Arc<dyn Executor>,
    spec: Arc<TransferSpec>,
    credentials: Arc<Credentials>,
    policy: RetryPolicy,
    concurrency_limit: usize,
    transfer_timeout: std::time::Duration,
}

impl std::fmt::Debug for BatchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPlan")
            .field("spec", &self.spec)
            .field("credentials", &self.credentials)
            .field("policy", &self.policy)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("transfer_timeout", &self.transfer_timeout)
            .finish_non_exhaustive()
    }
}

impl BatchPlan {
    pub fn new(
        executor: Arc<dyn Executor>,
        spec: Arc<TransferSpec>,
        credentials: Arc<Credentials>,
        policy: RetryPolicy,
        concurrency_limit: usize,
        transfer_timeout: std::time::Duration,
    ) -> Result<Self, PolicyError> {
        if concurrency_limit == 0 {
            return Err(PolicyError::ZeroConcurrency);
        }
        Ok(Self {
            executor,
            spec,
            credentials,
            policy,
            concurrency_limit,
            transfer_timeout,
        })
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }
}

/// Records the highest attempt number a unit has started, so an aborted unit still reports the
/// attempts it made
struct CountedAttempts<'a> {
    executor: &'a dyn Executor,
    started: &'a AtomicU32,
}

#[async_trait::async_trait]
impl Executor for CountedAttempts<'_> {
    async fn execute(
        &self,
        target: &Target,
        spec: &TransferSpec,
        credentials: &Credentials,
        timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
        attempt_number: u32,
    ) -> AttemptOutcome {
        self.started.fetch_max(attempt_number, Ordering::AcqRel);
        self.executor
            .execute(target, spec, credentials, timeout, cancel, attempt_number)
            .await
    }
}

fn unit_failed(target: &Target, attempts_made: u32, error: &tokio::task::JoinError) -> JobResult {
    JobResult {
        target: target.clone(),
        final_outcome: AttemptOutcome::new(
            target,
            attempts_made,
            ExitReason::TransportError,
            format!("transfer task failed: {error}"),
            std::time::Duration::ZERO,
        ),
        attempts_made,
    }
}

fn unit_aborted(target: &Target, attempts_made: u32) -> JobResult {
    JobResult {
        target: target.clone(),
        final_outcome: AttemptOutcome::cancelled(target, attempts_made),
        attempts_made,
    }
}

/// Pushes `plan`'s transfer to every target with at most the plan's concurrency limit in flight.
///
/// Targets are admitted in list order. Returns only after every admitted unit finished or was
/// aborted; targets that never reported (queued when cancellation hit, or aborted) are recorded
/// as `Cancelled`.
#[tracing::instrument(skip_all, fields(targets = targets.len()))]
pub async fn run_batch(
    targets: &[Target],
    plan: &BatchPlan,
    cancel: &CancellationManager,
) -> BatchReport {
    let progress = common::get_progress();
    let aggregator = Arc::new(Aggregator::new());
    let limit = throttle::InFlightLimit::new(plan.concurrency_limit);
    let token = cancel.token();
    let total = targets.len();
    progress.submitted.add(total as u64);
    let mut join_set = tokio::task::JoinSet::new();
    let mut running = std::collections::HashMap::new();
    let mut attempts: std::collections::HashMap<Target, Arc<AtomicU32>> =
        std::collections::HashMap::new();
    for (index, target) in targets.iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = limit.acquire() => permit,
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = throttle::get_launch_token() => {}
        }
        tracing::info!("[{}/{}] {}: starting", index + 1, total, target);
        let unit = {
            let target = target.clone();
            let plan = plan.clone();
            let aggregator = aggregator.clone();
            let token = token.clone();
            let started = Arc::new(AtomicU32::new(0));
            attempts.insert(target.clone(), started.clone());
            async move {
                let _permit = permit;
                let _guard = common::get_progress().units.guard();
                let executor = CountedAttempts {
                    executor: plan.executor.as_ref(),
                    started: &started,
                };
                let result = run_with_retry(
                    &executor,
                    &target,
                    &plan.spec,
                    &plan.credentials,
                    &plan.policy,
                    plan.transfer_timeout,
                    &token,
                )
                .await;
                tracing::info!(
                    "[{}/{}] {}: {} after {} attempt(s)",
                    index + 1,
                    total,
                    target,
                    result.final_outcome.exit_reason,
                    result.attempts_made
                );
                if let Err(error) = aggregator.record(result) {
                    tracing::error!("{}", error);
                }
            }
        };
        let handle = join_set.spawn(unit);
        running.insert(handle.id(), target.clone());
    }
    if running.len() < total {
        tracing::warn!(
            "Cancelled with {} target(s) still queued",
            total - running.len()
        );
    }
    // join barrier
    let mut abort_at: Option<tokio::time::Instant> = None;
    let mut aborted = false;
    loop {
        if abort_at.is_none() && token.is_cancelled() {
            abort_at = Some(tokio::time::Instant::now() + cancel.grace_period() + ABORT_MARGIN);
        }
        let joined = match abort_at {
            None => tokio::select! {
                joined = join_set.join_next_with_id() => joined,
                _ = token.cancelled() => continue,
            },
            Some(deadline) if !aborted => tokio::select! {
                biased;
                joined = join_set.join_next_with_id() => joined,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        "{} unit(s) did not stop within the grace period, aborting them",
                        join_set.len()
                    );
                    join_set.abort_all();
                    aborted = true;
                    continue;
                }
            },
            Some(_) => join_set.join_next_with_id().await,
        };
        let Some(joined) = joined else {
            break;
        };
        match joined {
            Ok((id, ())) => {
                running.remove(&id);
            }
            Err(error) => {
                let Some(target) = running.remove(&error.id()) else {
                    continue;
                };
                if error.is_panic() && !aggregator.contains(&target) {
                    tracing::error!("{}: transfer task panicked", target);
                    let attempts_made = attempts_started(&attempts, &target);
                    let failed = unit_failed(&target, attempts_made, &error);
                    if let Err(error) = aggregator.record(failed) {
                        tracing::error!("{}", error);
                    }
                }
            }
        }
    }
    // queued or aborted targets
    for target in targets {
        if aggregator.contains(target) {
            continue;
        }
        let result = if attempts.contains_key(target) {
            unit_aborted(target, attempts_started(&attempts, target))
        } else {
            JobResult::never_started(target)
        };
        if let Err(error) = aggregator.record(result) {
            tracing::error!("{}", error);
        }
    }
    aggregator.snapshot()
}

fn attempts_started(
    attempts: &std::collections::HashMap<Target, Arc<AtomicU32>>,
    target: &Target,
) -> u32 {
    attempts
        .get(target)
        .map_or(0, |started| started.load(Ordering::Acquire))
}
