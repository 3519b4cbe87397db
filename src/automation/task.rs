//! Task executor: one iteration of work for one synthetic account.
//!
//! `run_task` is a four-step protocol:
//! 1. guard: in one transaction, refuse inactive, stale or already-running
//!    tasks, otherwise mark the task running
//! 2. execute: submit the copy job and persist its id
//! 3. await: wait for the job, bounded by `job_timeout + grace`
//! 4. commit: in one transaction, clear `running` and add accepted rows
//!
//! Duplicate or stale deliveries end at step 1 as [`TaskRunReport::Skipped`].

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use super::jobs::{JobOutcome, JobRunner, copy_job_for, remaining_wait};
use super::models::{TaskRequest, TaskState};
use super::store::Metadata;
use crate::errors::{AutomationError, Result};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub job_timeout: chrono::Duration,
    pub job_grace: chrono::Duration,
    pub source_table: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            job_timeout: chrono::Duration::minutes(30),
            job_grace: chrono::Duration::minutes(5),
            source_table: "billing_export_sample".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    Inactive,
    VersionMismatch,
    IterationMismatch,
    AlreadyRunning,
}

impl SkipReason {
    fn check(task: &TaskState, request: &TaskRequest) -> Option<Self> {
        if !task.active {
            Some(Self::Inactive)
        } else if task.version != request.version {
            Some(Self::VersionMismatch)
        } else if task.iteration != request.iteration {
            Some(Self::IterationMismatch)
        } else if task.running {
            Some(Self::AlreadyRunning)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskRunReport {
    Skipped {
        reason: SkipReason,
    },
    SubmitFailed {
        error: String,
    },
    Completed {
        job_id: String,
        outcome: JobOutcome,
        rows_added: i64,
        active: bool,
    },
}

pub struct TaskExecutor {
    metadata: Metadata,
    runner: Arc<dyn JobRunner>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(metadata: Metadata, runner: Arc<dyn JobRunner>, settings: ExecutorSettings) -> Self {
        Self {
            metadata,
            runner,
            settings,
        }
    }

    pub async fn run_task(&self, request: &TaskRequest) -> Result<TaskRunReport> {
        let account = request.billing_account_id.as_str();

        let task = match self.claim(request).await? {
            Ok(task) => task,
            Err(reason) => {
                info!(account, version = request.version, iteration = request.iteration, ?reason, "task request skipped");
                return Ok(TaskRunReport::Skipped { reason });
            }
        };

        let job = copy_job_for(
            account,
            &self.settings.source_table,
            &task.target_table,
            task.rows_per_iteration,
        );
        let handle = match self.runner.submit(&job).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(account, version = request.version, iteration = request.iteration, error = %e, "job submission failed");
                self.metadata
                    .update_task(account, |task| {
                        task.running = false;
                        Ok(())
                    })
                    .await?;
                return Ok(TaskRunReport::SubmitFailed {
                    error: e.to_string(),
                });
            }
        };
        self.metadata
            .update_task(account, |task| {
                task.job_id = Some(handle.id.clone());
                Ok(())
            })
            .await?;

        let deadline = task
            .job_timeout
            .unwrap_or_else(|| Utc::now() + self.settings.job_timeout);
        let outcome = match remaining_wait(Utc::now(), deadline, self.settings.job_grace) {
            None => JobOutcome::Stuck,
            Some(wait) => {
                match tokio::time::timeout(
                    wait,
                    self.runner
                        .await_outcome(&handle, deadline, self.settings.job_grace),
                )
                .await
                {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => {
                        warn!(account, job_id = %handle.id, error = %e, "waiting for job failed");
                        JobOutcome::ExecutionFailure
                    }
                    Err(_) => JobOutcome::Stuck,
                }
            }
        };

        let rows_added = outcome.rows_accepted(handle.rows);
        let committed = self
            .metadata
            .update_task(account, |task| {
                task.running = false;
                task.written_rows.expected += rows_added;
                task.job_id = Some(handle.id.clone());
                task.last_outcome = Some(outcome);
                if outcome.retires_task() {
                    task.active = false;
                }
                Ok(())
            })
            .await?;

        match outcome {
            JobOutcome::Success => info!(
                account,
                version = request.version,
                iteration = request.iteration,
                job_id = %handle.id,
                rows_added,
                expected = committed.written_rows.expected,
                "task iteration committed"
            ),
            _ => warn!(
                account,
                version = request.version,
                iteration = request.iteration,
                job_id = %handle.id,
                %outcome,
                active = committed.active,
                "task iteration did not write rows"
            ),
        }

        Ok(TaskRunReport::Completed {
            job_id: handle.id,
            outcome,
            rows_added,
            active: committed.active,
        })
    }

    /// Step 1. The outer `Result` carries store failures, the inner one the
    /// guard decision.
    async fn claim(&self, request: &TaskRequest) -> Result<std::result::Result<TaskState, SkipReason>> {
        let mut rejected = None;
        let now = Utc::now();
        let job_timeout = self.settings.job_timeout;
        let claimed = self
            .metadata
            .update_task(&request.billing_account_id, |task| {
                rejected = SkipReason::check(task, request);
                if let Some(reason) = rejected {
                    return Err(AutomationError::InvalidRequest(format!("{:?}", reason)));
                }
                task.running = true;
                task.start_time = Some(now);
                task.job_id = None;
                if task.job_timeout.is_none_or(|timeout| timeout <= now) {
                    task.job_timeout = Some(now + job_timeout);
                }
                Ok(())
            })
            .await;

        match (claimed, rejected) {
            (Ok(task), _) => Ok(Ok(task)),
            (Err(_), Some(reason)) => Ok(Err(reason)),
            (Err(AutomationError::NotFound { .. }), None) => Ok(Err(SkipReason::NotFound)),
            (Err(e), None) => Err(e),
        }
    }
}
