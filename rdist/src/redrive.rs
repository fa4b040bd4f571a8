//! Re-running failed targets after a pass
//!
//! [`run`] keeps re-submitting the failed subset while the operator agrees and every pass
//! strictly lowers the number of failures. A pass that doesn't improve ends the loop, as does
//! cancellation or reaching `max_passes`.

use crate::aggregator::BatchReport;
use remote::Target;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

/// Asks whether the failed targets of `report` should be retried. Cancellation while waiting for
/// an answer declines.
#[async_trait::async_trait]
pub trait Prompt: Send + Sync {
    async fn confirm(&self, report: &BatchReport, cancel: &CancellationToken) -> bool;
}

/// Fixed answer (`--redrive` / `--no-redrive`, non-interactive runs)
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt(pub bool);

#[async_trait::async_trait]
impl Prompt for FixedPrompt {
    async fn confirm(&self, _report: &BatchReport, _cancel: &CancellationToken) -> bool {
        self.0
    }
}

/// Asks on stderr and reads one line of answer from `reader`.
///
/// No answer within `timeout`, EOF, a read error, cancellation or anything but `y`/`yes` declines.
pub struct LinePrompt<R> {
    reader: tokio::sync::Mutex<R>,
    timeout: std::time::Duration,
}

pub type StdinPrompt = LinePrompt<tokio::io::BufReader<tokio::io::Stdin>>;

impl<R> LinePrompt<R> {
    pub fn new(reader: R, timeout: std::time::Duration) -> Self {
        Self {
            reader: tokio::sync::Mutex::new(reader),
            timeout,
        }
    }
}

impl StdinPrompt {
    /// The blocking stdin read behind it may outlive a timed out question; the runtime is shut
    /// down without waiting for it.
    pub fn stdin(timeout: std::time::Duration) -> Self {
        Self::new(tokio::io::BufReader::new(tokio::io::stdin()), timeout)
    }
}

pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[async_trait::async_trait]
impl<R> Prompt for LinePrompt<R>
where
    R: tokio::io::AsyncBufRead + Unpin + Send,
{
    async fn confirm(&self, report: &BatchReport, cancel: &CancellationToken) -> bool {
        eprintln!("{} target(s) failed:", report.failed.len());
        for result in &report.failed {
            eprintln!(
                "  {}: {} ({})",
                result.target, result.final_outcome.exit_reason, result.final_outcome.message
            );
        }
        eprint!(
            "Redrive failed targets? [y/N] (no answer in {} means no): ",
            humantime::format_duration(self.timeout)
        );
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                eprintln!();
                tracing::info!("Cancelled while waiting for an answer, not redriving");
                return false;
            }
            answer = tokio::time::timeout(self.timeout, reader.read_line(&mut line)) => answer,
        };
        match answer {
            Ok(Ok(0)) => {
                eprintln!();
                tracing::info!("Input closed, not redriving");
                false
            }
            Ok(Ok(_)) => is_affirmative(&line),
            Ok(Err(error)) => {
                tracing::warn!("Failed to read answer: {}", error);
                false
            }
            Err(_) => {
                eprintln!();
                tracing::warn!("No answer, not redriving");
                false
            }
        }
    }
}

/// Every pass run by [`run`], first one included
#[derive(Debug, Clone)]
pub struct RedriveHistory {
    pub reports: Vec<BatchReport>,
}

impl RedriveHistory {
    pub fn passes(&self) -> usize {
        self.reports.len()
    }

    /// The last pass' report
    pub fn last(&self) -> &BatchReport {
        // `run` always records the first pass
        &self.reports[self.reports.len() - 1]
    }

    /// All passes folded into one report: the first pass' total, every success, the last failures
    pub fn merged(&self) -> BatchReport {
        let mut merged = BatchReport {
            total: self.reports[0].total,
            ..Default::default()
        };
        for report in &self.reports {
            merged.succeeded.extend(report.succeeded.iter().cloned());
            merged.elapsed_ms += report.elapsed_ms;
        }
        merged.failed = self.last().failed.clone();
        merged
    }
}

/// Redrives `first`'s failures through `pass` while each pass strictly reduces them.
///
/// `max_passes` bounds the number of redrive passes (not counting `first`).
pub async fn run<F, Fut>(
    first: BatchReport,
    prompt: &dyn Prompt,
    max_passes: u32,
    cancel: &CancellationToken,
    mut pass: F,
) -> RedriveHistory
where
    F: FnMut(Vec<Target>) -> Fut,
    Fut: std::future::Future<Output = BatchReport>,
{
    let mut history = RedriveHistory {
        reports: vec![first],
    };
    for pass_number in 1..=max_passes {
        let previous = history.last();
        if previous.failed.is_empty() || cancel.is_cancelled() {
            break;
        }
        if !prompt.confirm(previous, cancel).await {
            tracing::info!("Redrive declined");
            break;
        }
        if cancel.is_cancelled() {
            break;
        }
        let failed_before = previous.failed.len();
        let targets = previous.failed_targets();
        tracing::info!(
            "Redrive pass {}: resubmitting {} failed target(s)",
            pass_number,
            targets.len()
        );
        let report = pass(targets).await;
        let failed_after = report.failed.len();
        history.reports.push(report);
        if failed_after >= failed_before {
            tracing::warn!(
                "Redrive pass {} did not reduce failures ({} -> {}), stopping",
                pass_number,
                failed_before,
                failed_after
            );
            break;
        }
    }
    history
}
