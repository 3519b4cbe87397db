//! Job Runner contract and outcome classification.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Append,
    Truncate,
}

/// One copy job: move at most `row_limit` rows for `account_id` from the
/// sample source table into the task's target table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyJob {
    pub query: String,
    pub source_table: String,
    pub destination_table: String,
    pub write_mode: WriteMode,
    pub account_id: String,
    pub row_limit: i64,
}

/// Handle to a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    /// Rows the job will add once it succeeds.
    pub rows: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    /// The job ran but failed.
    ExecutionFailure,
    /// The job did not finish before its timeout plus grace.
    Stuck,
    Canceled,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ExecutionFailure => "execution_failure",
            Self::Stuck => "stuck",
            Self::Canceled => "canceled",
        }
    }

    /// Rows that may be added to `expected` for a job of `rows` rows.
    pub fn rows_accepted(&self, rows: i64) -> i64 {
        match self {
            Self::Success => rows.max(0),
            _ => 0,
        }
    }

    /// A stuck task stops being dispatched.
    pub fn retires_task(&self) -> bool {
        matches!(self, Self::Stuck)
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a caller may still wait for a job due at `job_timeout`.
///
/// Returns `None` once `job_timeout + grace` has passed; a job still running
/// at that point is stuck.
pub fn remaining_wait(
    now: DateTime<Utc>,
    job_timeout: DateTime<Utc>,
    grace: chrono::Duration,
) -> Option<std::time::Duration> {
    let deadline = job_timeout + grace;
    if deadline <= now {
        return None;
    }
    (deadline - now).to_std().ok()
}

pub fn is_stuck(now: DateTime<Utc>, job_timeout: DateTime<Utc>, grace: chrono::Duration) -> bool {
    remaining_wait(now, job_timeout, grace).is_none()
}

/// Executes copy jobs on the warehouse.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn submit(&self, job: &CopyJob) -> Result<JobHandle>;

    /// Block until the job finishes and classify it. Implementations return
    /// `Stuck` instead of waiting past `deadline + grace`.
    async fn await_outcome(
        &self,
        handle: &JobHandle,
        deadline: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<JobOutcome>;
}

pub fn copy_job_for(
    account_id: &str,
    source_table: &str,
    destination_table: &str,
    row_limit: i64,
) -> CopyJob {
    CopyJob {
        query: format!(
            "SELECT * FROM `{}` WHERE billing_account_id = @account LIMIT {}",
            source_table, row_limit
        ),
        source_table: source_table.to_string(),
        destination_table: destination_table.to_string(),
        write_mode: WriteMode::Append,
        account_id: account_id.to_string(),
        row_limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn only_success_accepts_rows() {
        assert_eq!(JobOutcome::Success.rows_accepted(500), 500);
        assert_eq!(JobOutcome::ExecutionFailure.rows_accepted(500), 0);
        assert_eq!(JobOutcome::Stuck.rows_accepted(500), 0);
        assert_eq!(JobOutcome::Canceled.rows_accepted(500), 0);
    }

    #[test]
    fn only_stuck_retires() {
        assert!(JobOutcome::Stuck.retires_task());
        assert!(!JobOutcome::ExecutionFailure.retires_task());
        assert!(!JobOutcome::Canceled.retires_task());
    }

    #[test]
    fn stuck_after_timeout_plus_grace() {
        let timeout = Utc::now();
        let grace = Duration::minutes(5);
        assert!(!is_stuck(timeout, timeout, grace));
        assert!(!is_stuck(timeout + Duration::minutes(4), timeout, grace));
        assert!(is_stuck(timeout + Duration::minutes(5), timeout, grace));
        assert!(is_stuck(timeout + Duration::hours(1), timeout, grace));
    }

    #[test]
    fn remaining_wait_counts_down_to_deadline() {
        let now = Utc::now();
        let wait = remaining_wait(now, now + Duration::seconds(30), Duration::seconds(10)).unwrap();
        assert_eq!(wait.as_secs(), 40);
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&JobOutcome::ExecutionFailure).unwrap();
        assert_eq!(json, "\"execution_failure\"");
    }

    #[test]
    fn copy_job_targets_account() {
        let job = copy_job_for("AUTO00-000001-000000", "src", "dst", 42);
        assert_eq!(job.row_limit, 42);
        assert_eq!(job.write_mode, WriteMode::Append);
        assert!(job.query.contains("LIMIT 42"));
    }
}
