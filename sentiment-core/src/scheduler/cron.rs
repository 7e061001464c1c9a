//! Cron-driven retraining schedule.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::SchedulerError;

/// Parse a cron expression (seconds field first) into a Schedule.
pub fn parse_cron_expression(expr: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidCronExpression {
        expression: expr.to_string(),
        message: e.to_string(),
    })
}

/// A parsed schedule plus bookkeeping of when it last fired.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    name: String,
    expression: String,
    schedule: Schedule,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: usize,
}

impl CronTrigger {
    pub fn new(name: impl Into<String>, expression: &str) -> Result<Self, SchedulerError> {
        Ok(Self {
            name: name.into(),
            expression: expression.to_string(),
            schedule: parse_cron_expression(expression)?,
            last_run: None,
            run_count: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// How long to wait from `now` until the next fire.
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Mark the trigger as having just fired.
    pub fn mark_executed(&mut self) {
        self.last_run = Some(Utc::now());
        self.run_count += 1;
    }

    /// Sleep until each fire time and invoke `on_fire`. Returns only when the
    /// schedule has no further fire times.
    pub async fn run<F, Fut>(mut self, mut on_fire: F)
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        info!(trigger = %self.name, schedule = %self.expression, "Cron trigger started");
        while let Some(wait) = self.until_next(Utc::now()) {
            debug!(trigger = %self.name, wait_secs = wait.as_secs(), "Sleeping until next fire");
            tokio::time::sleep(wait).await;
            self.mark_executed();
            on_fire().await;
        }
        info!(trigger = %self.name, "Cron trigger exhausted");
    }
}
