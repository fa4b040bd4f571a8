//! Push one file or directory tree to many hosts at once
//!
//! A run parses its targets, resolves credentials once and hands both to a [`Dispatcher`]:
//!
//! 1. [`scheduler::run_batch`] admits targets in order, keeping at most the configured number of
//!    transfers in flight.
//! 2. Each unit of work runs [`retry::run_with_retry`] around a [`remote::Executor`] and reports
//!    its [`JobResult`] to the batch's [`Aggregator`].
//! 3. [`redrive::run`] offers to re-submit the failed targets while each pass reduces them.
//!
//! [`CancellationManager`] turns SIGINT/SIGTERM into cancellation of all of the above.
//!
//! [`JobResult`]: aggregator::JobResult
//! [`Aggregator`]: aggregator::Aggregator

pub mod aggregator;
pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod redrive;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
mod testutils;

pub use aggregator::{Aggregator, AggregatorError, BatchReport, JobResult};
pub use cancel::CancellationManager;
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use retry::{PolicyError, RetryPolicy};
pub use scheduler::BatchPlan;
