//! The scheduling contract shared by the test and suite schedulers.

use async_trait::async_trait;
use sutrun_common::SchedulerError;

/// Runs a batch of jobs and collects their outputs.
///
/// `results` only covers the most recent `schedule` call. A scheduler stopped
/// through [`Scheduler::stop`] returns `Ok` from `schedule` and reports
/// `stopped() == true`; stopping is never an error.
#[async_trait]
pub trait Scheduler: Send + Sync {
    type Job: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Outputs recorded so far by the current or last `schedule` call.
    fn results(&self) -> Vec<Self::Output>;

    /// Whether the last run was interrupted by `stop`.
    fn stopped(&self) -> bool;

    /// Interrupt a running `schedule` and wait until it returns. No-op when idle.
    async fn stop(&self);

    /// Run `jobs` to completion. Rejects an empty batch.
    async fn schedule(&self, jobs: Vec<Self::Job>) -> Result<(), SchedulerError>;
}
