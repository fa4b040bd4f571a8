//! Collects one [`JobResult`] per target from concurrently running units

use remote::{AttemptOutcome, ExitReason, Target};
use serde::Serialize;

/// Final outcome for one target within a batch
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub target: Target,
    pub final_outcome: AttemptOutcome,
    pub attempts_made: u32,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.final_outcome.succeeded
    }

    /// Result for a target that was never admitted
    pub fn never_started(target: &Target) -> Self {
        Self {
            target: target.clone(),
            final_outcome: AttemptOutcome::cancelled(target, 0),
            attempts_made: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: Vec<Target>,
    /// Failed targets with their last outcome, in the order they were recorded
    pub failed: Vec<JobResult>,
    pub elapsed_ms: u64,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_targets(&self) -> Vec<Target> {
        self.failed.iter().map(|result| result.target.clone()).collect()
    }

    fn count_failed(&self, reason: ExitReason) -> usize {
        self.failed
            .iter()
            .filter(|result| result.final_outcome.exit_reason == reason)
            .count()
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "targets: {}\n\
            succeeded: {}\n\
            failed: {}\n\
            cancelled: {}\n\
            elapsed: {}",
            self.total,
            self.succeeded.len(),
            self.failed.len() - self.count_failed(ExitReason::Cancelled),
            self.count_failed(ExitReason::Cancelled),
            humantime::format_duration(std::time::Duration::from_millis(self.elapsed_ms)),
        )?;
        if !self.failed.is_empty() {
            write!(f, "\nfailed targets:")?;
            for result in &self.failed {
                write!(
                    f,
                    "\n  {}: {} after {} attempt(s): {}",
                    result.target,
                    result.final_outcome.exit_reason,
                    result.attempts_made,
                    result.final_outcome.message
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregatorError {
    #[error("a result for {0} was already recorded")]
    Duplicate(String),
}

#[derive(Debug, Default)]
struct Inner {
    results: std::collections::HashMap<Target, JobResult>,
    order: Vec<Target>,
}

/// The single synchronization point between units of a batch
#[derive(Debug)]
pub struct Aggregator {
    inner: std::sync::Mutex<Inner>,
    started: std::time::Instant,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(Inner::default()),
            started: std::time::Instant::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a panic while holding the lock can't leave a half-written entry, the insert is last
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stores `result`; a second result for the same target is rejected, never merged.
    pub fn record(&self, result: JobResult) -> Result<(), AggregatorError> {
        let progress = common::get_progress();
        let mut inner = self.lock();
        if inner.results.contains_key(&result.target) {
            tracing::error!("Dropping duplicate result for {}", result.target);
            return Err(AggregatorError::Duplicate(result.target.to_string()));
        }
        match result.final_outcome.exit_reason {
            ExitReason::Success => progress.succeeded.inc(),
            ExitReason::Cancelled => progress.cancelled.inc(),
            _ => progress.failed.inc(),
        }
        inner.order.push(result.target.clone());
        inner.results.insert(result.target.clone(), result);
        Ok(())
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.lock().results.contains_key(target)
    }

    /// Consistent point-in-time view of everything recorded so far
    pub fn snapshot(&self) -> BatchReport {
        let inner = self.lock();
        let mut report = BatchReport {
            total: inner.order.len(),
            elapsed_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            ..Default::default()
        };
        for target in &inner.order {
            let Some(result) = inner.results.get(target) else {
                continue;
            };
            if result.succeeded() {
                report.succeeded.push(result.target.clone());
            } else {
                report.failed.push(result.clone());
            }
        }
        report
    }
}
