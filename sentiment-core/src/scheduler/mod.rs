//! Scheduling for the lifecycle service.
//!
//! Provides the cron trigger behind scheduled retraining and the job ledger
//! that records retraining runs and enforces single flight.

pub mod cron;
pub mod jobs;

pub use cron::{CronTrigger, parse_cron_expression};
pub use jobs::{BackgroundJob, JobManager, JobStatus};
