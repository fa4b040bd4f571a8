use crate::aggregator::BatchReport;
use crate::cancel::CancellationManager;
use crate::redrive::{self, Prompt};
use crate::scheduler::{BatchPlan, run_batch};
use remote::Target;
use serde::Serialize;

/// Outcome of a whole run, redrive passes included
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    /// Number of batches run, the first pass included
    pub passes: usize,
    /// First pass total, every success and the failures of the last pass
    pub report: BatchReport,
}

impl DispatchSummary {
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

impl std::fmt::Display for DispatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}\npasses: {}", self.report, self.passes)
    }
}

/// Drives the first batch and any redrive passes, then releases the run's resources.
#[derive(Debug)]
pub struct Dispatcher {
    plan: BatchPlan,
    cancel: CancellationManager,
}

impl Dispatcher {
    pub fn new(plan: BatchPlan, cancel: CancellationManager) -> Self {
        Self { plan, cancel }
    }

    /// Consumes the dispatcher; when this returns the credential handle has been dropped.
    pub async fn run(
        self,
        targets: &[Target],
        prompt: &dyn Prompt,
        max_redrive_passes: u32,
    ) -> DispatchSummary {
        let Dispatcher { plan, cancel } = self;
        let first = run_batch(targets, &plan, &cancel).await;
        tracing::info!(
            "Pass 1: {} succeeded, {} failed",
            first.succeeded.len(),
            first.failed.len()
        );
        let token = cancel.token();
        let history = redrive::run(first, prompt, max_redrive_passes, &token, |failed| {
            let plan = &plan;
            let cancel = &cancel;
            async move { run_batch(&failed, plan, cancel).await }
        })
        .await;
        let summary = DispatchSummary {
            passes: history.passes(),
            report: history.merged(),
        };
        cancel.register("credentials", plan.credentials().clone());
        drop(plan);
        cancel.shutdown();
        summary
    }
}
