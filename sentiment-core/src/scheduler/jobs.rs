//! Background job ledger: tracks retraining runs and caps how many may be in
//! flight at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::SchedulerError;

/// Status of a background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackgroundJob {
    fn started(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != JobStatus::Running
    }
}

/// Tracks jobs and refuses to start more than `max_active` concurrently.
///
/// Callers share it behind a mutex, so `begin` is the check-and-insert that
/// makes a single-flight guard when `max_active` is 1.
#[derive(Debug)]
pub struct JobManager {
    jobs: HashMap<Uuid, BackgroundJob>,
    max_active: usize,
    /// Finished jobs kept for status queries.
    history_limit: usize,
}

impl JobManager {
    pub fn new(max_active: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_active,
            history_limit: 50,
        }
    }

    /// Register a running job, or fail if the cap is reached.
    pub fn begin(&mut self, name: impl Into<String>) -> Result<Uuid, SchedulerError> {
        if self.active_count() >= self.max_active {
            return Err(SchedulerError::MaxJobsExceeded {
                max: self.max_active,
            });
        }
        self.prune();
        let job = BackgroundJob::started(name);
        let id = job.id;
        self.jobs.insert(id, job);
        Ok(id)
    }

    pub fn complete(&mut self, id: &Uuid, result: impl Into<String>) -> Result<(), SchedulerError> {
        let job = self.job_mut(id)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result = Some(result.into());
        Ok(())
    }

    pub fn fail(&mut self, id: &Uuid, error: impl Into<String>) -> Result<(), SchedulerError> {
        let job = self.job_mut(id)?;
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error = Some(error.into());
        Ok(())
    }

    fn job_mut(&mut self, id: &Uuid) -> Result<&mut BackgroundJob, SchedulerError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: id.to_string(),
            })
    }

    pub fn get(&self, id: &Uuid) -> Option<&BackgroundJob> {
        self.jobs.get(id)
    }

    /// Jobs newest first.
    pub fn recent(&self, limit: usize) -> Vec<BackgroundJob> {
        let mut jobs: Vec<BackgroundJob> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.jobs.values().filter(|j| !j.is_finished()).count()
    }

    fn prune(&mut self) {
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = self
            .jobs
            .values()
            .filter(|j| j.is_finished())
            .map(|j| (j.started_at, j.id))
            .collect();
        if finished.len() < self.history_limit {
            return;
        }
        finished.sort();
        let excess = finished.len() + 1 - self.history_limit;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight_cap() {
        let mut mgr = JobManager::new(1);
        let id = mgr.begin("retrain:manual").unwrap();
        let err = mgr.begin("retrain:drift").unwrap_err();
        assert!(matches!(err, SchedulerError::MaxJobsExceeded { max: 1 }));

        mgr.complete(&id, "promoted").unwrap();
        assert_eq!(mgr.active_count(), 0);
        assert!(mgr.begin("retrain:drift").is_ok());
    }

    #[test]
    fn test_fail_records_error() {
        let mut mgr = JobManager::new(2);
        let id = mgr.begin("retrain:scheduled").unwrap();
        mgr.fail(&id, "no data available").unwrap();
        let job = mgr.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("no data available"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_unknown_job() {
        let mut mgr = JobManager::new(1);
        assert!(mgr.complete(&Uuid::new_v4(), "x").is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut mgr = JobManager::new(1);
        for _ in 0..80 {
            let id = mgr.begin("retrain").unwrap();
            mgr.complete(&id, "ok").unwrap();
        }
        assert!(mgr.recent(usize::MAX).len() <= 50);
        assert_eq!(JobStatus::Completed.to_string(), "completed");
    }
}
