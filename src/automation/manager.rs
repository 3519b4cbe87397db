//! Manager state machine.
//!
//! ```text
//! Pending → Writing ⟲ → WaitToVerifyRowCount → VerifyingRowCount ⟲ → Notifying ─┬→ Cleanup → Done
//!                                                                                 └→ Failed
//! ```
//!
//! Each call to [`Manager::run_automation`] performs exactly one stage. The
//! step is bracketed by a preamble (version and environment checks, then
//! `running = true`, `iteration += 1`, a fresh ttl) and a teardown that always
//! clears `running`, so a failed step never blocks the next invocation.
//! Stage transitions are persisted by the teardown, after every per-task
//! future of the stage has completed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::dispatch::TaskDispatcher;
use super::identity::WorkerIdentityPool;
use super::models::{
    ManagerStage, ManagerState, OrchestrationRun, TaskRequest, TaskState, target_table_name,
};
use super::notify::{Notification, NotificationSink, Severity};
use super::orchestrator::Orchestrator;
use super::services::{Backend, IngestionPipeline, RowCountService};
use super::store::{DocKey, Metadata};
use crate::errors::{AutomationError, Result};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub environment: String,
    pub production_environment: String,
    pub task_ttl: chrono::Duration,
    pub job_timeout: chrono::Duration,
    pub iteration_interval: chrono::Duration,
    pub table_prefix: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            production_environment: "prod".to_string(),
            task_ttl: chrono::Duration::minutes(55),
            job_timeout: chrono::Duration::minutes(30),
            iteration_interval: chrono::Duration::minutes(60),
            table_prefix: "automation_dummy".to_string(),
        }
    }
}

/// What one `run_automation` call did.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepReport {
    /// Another invocation holds the step.
    Busy { version: i64 },
    /// Terminal stage; nothing to do until a new orchestration.
    Idle { version: i64, stage: ManagerStage },
    Ran {
        version: i64,
        iteration: i64,
        stage: ManagerStage,
        next: ManagerStage,
    },
}

pub struct Manager {
    metadata: Metadata,
    pool: WorkerIdentityPool,
    dispatcher: Arc<dyn TaskDispatcher>,
    row_counts: RowCountService,
    pipeline: Arc<dyn IngestionPipeline>,
    notifier: Arc<dyn NotificationSink>,
    orchestrator: Arc<Orchestrator>,
    settings: ManagerSettings,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Metadata,
        pool: WorkerIdentityPool,
        dispatcher: Arc<dyn TaskDispatcher>,
        row_counts: RowCountService,
        pipeline: Arc<dyn IngestionPipeline>,
        notifier: Arc<dyn NotificationSink>,
        orchestrator: Arc<Orchestrator>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            metadata,
            pool,
            dispatcher,
            row_counts,
            pipeline,
            notifier,
            orchestrator,
            settings,
        }
    }

    pub async fn run_automation(&self) -> Result<StepReport> {
        self.run_automation_at(Utc::now()).await
    }

    pub async fn run_automation_at(&self, now: DateTime<Utc>) -> Result<StepReport> {
        let run = self
            .metadata
            .orchestration()
            .await?
            .ok_or(AutomationError::MissingOrchestration)?;
        let current = self
            .metadata
            .manager()
            .await?
            .ok_or_else(|| AutomationError::NotFound {
                key: DocKey::Manager.to_string(),
            })?;

        if current.stage.is_terminal() {
            info!(version = current.version, stage = %current.stage, "automation idle until next orchestration");
            return Ok(StepReport::Idle {
                version: current.version,
                stage: current.stage,
            });
        }

        let state = match self.init(&run, now).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!(version = current.version, "automation step already in flight, skipping");
                return Ok(StepReport::Busy {
                    version: current.version,
                });
            }
            Err(e) => {
                error!(version = run.version, error = %e, "automation step aborted");
                return Err(e);
            }
        };

        let stage = state.stage;
        info!(version = state.version, iteration = state.iteration, %stage, "automation step started");
        let outcome = self.run_stage(&state, &run, now).await;

        let next = outcome.as_ref().ok().copied();
        if let Err(e) = self.tear_down(state.version, next).await {
            error!(version = state.version, error = %e, "failed to tear down automation step");
            if outcome.is_ok() {
                return Err(e);
            }
        }

        match outcome {
            Ok(next) => {
                if next != stage {
                    info!(version = state.version, iteration = state.iteration, from = %stage, to = %next, "stage advanced");
                }
                Ok(StepReport::Ran {
                    version: state.version,
                    iteration: state.iteration,
                    stage,
                    next,
                })
            }
            Err(e) => {
                error!(version = state.version, iteration = state.iteration, %stage, error = %e, "automation stage failed");
                Err(e)
            }
        }
    }

    /// Step preamble. `Ok(None)` means another invocation holds the step.
    async fn init(&self, run: &OrchestrationRun, now: DateTime<Utc>) -> Result<Option<ManagerState>> {
        if self.settings.environment == self.settings.production_environment {
            return Err(AutomationError::ProductionEnvironment {
                environment: self.settings.environment.clone(),
            });
        }

        let mut busy = false;
        let ttl = now + self.settings.task_ttl;
        let claimed = self
            .metadata
            .update_manager(|state| {
                busy = false;
                if state.version != run.version {
                    return Err(AutomationError::VersionMismatch {
                        orchestration: run.version,
                        manager: state.version,
                    });
                }
                if state.is_busy(now) {
                    busy = true;
                    return Err(AutomationError::InvalidRequest("step in flight".into()));
                }
                state.running = true;
                state.iteration += 1;
                state.ttl = Some(ttl);
                Ok(())
            })
            .await;

        match claimed {
            Ok(state) => Ok(Some(state)),
            Err(_) if busy => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Clear `running` and persist the transition, unless a newer
    /// orchestration replaced the manager in the meantime.
    async fn tear_down(&self, version: i64, next: Option<ManagerStage>) -> Result<()> {
        self.metadata
            .update_manager(|state| {
                if state.version == version {
                    state.running = false;
                    if let Some(next) = next {
                        state.stage = next;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn run_stage(
        &self,
        state: &ManagerState,
        run: &OrchestrationRun,
        now: DateTime<Utc>,
    ) -> Result<ManagerStage> {
        match state.stage {
            ManagerStage::Pending => self.pending(run).await,
            ManagerStage::Writing => self.writing(state, run, now).await,
            ManagerStage::WaitToVerifyRowCount => {
                if !run.verification_due(now) {
                    info!(version = run.version, verify_after = ?run.verify_after, "waiting to start verification");
                    return Ok(ManagerStage::WaitToVerifyRowCount);
                }
                self.verify_row_counts(run, now).await?;
                Ok(ManagerStage::VerifyingRowCount)
            }
            ManagerStage::VerifyingRowCount => self.verifying(run, now).await,
            ManagerStage::Notifying => {
                if self.notify(run.version).await? {
                    Ok(ManagerStage::Cleanup)
                } else {
                    Ok(ManagerStage::Failed)
                }
            }
            ManagerStage::Cleanup => {
                self.orchestrator.delete_automation().await?;
                Ok(ManagerStage::Done)
            }
            ManagerStage::Done | ManagerStage::Failed => Ok(state.stage),
        }
    }

    // ── Pending ───────────────────────────────────────────────────────

    async fn pending(&self, run: &OrchestrationRun) -> Result<ManagerStage> {
        self.pipeline.purge_write_progress().await?;
        let stale = self.metadata.delete_tasks_before(run.version).await?;
        if stale > 0 {
            info!(version = run.version, deleted = stale, "deleted deprecated tasks");
        }

        let mut existing: HashMap<String, TaskState> = self
            .metadata
            .tasks_for_version(run.version)
            .await?
            .into_iter()
            .map(|task| (task.account_id.clone(), task))
            .collect();

        let interval_minutes = self.settings.iteration_interval.num_minutes().max(1);
        let mut tasks = Vec::new();
        for account in run.synthetic_accounts() {
            if let Some(task) = existing.remove(&account) {
                tasks.push(task);
                continue;
            }
            let rows_per_hour = {
                let mut rng = rand::thread_rng();
                rng.gen_range(run.min_throughput..=run.max_throughput.max(run.min_throughput))
            };
            let rows_per_iteration = rows_per_hour
                .checked_mul(interval_minutes)
                .map(|rows| rows / 60)
                .ok_or_else(|| {
                    AutomationError::InvalidRequest(format!(
                        "{} rows per hour over {} minutes is out of range",
                        rows_per_hour, interval_minutes
                    ))
                })?;
            let identity = self.pool.allocate_with_retry(&account).await?;
            let task = TaskState::new(
                &account,
                run.version,
                &identity.id,
                &target_table_name(&self.settings.table_prefix, &account),
                rows_per_hour,
                rows_per_iteration,
            );
            self.metadata
                .create(&DocKey::Task(account.clone()), &task)
                .await?;
            debug!(account = %account, identity = %identity.id, rows_per_hour, "task created");
            tasks.push(task);
        }

        let onboarded = join_all(
            tasks
                .iter()
                .map(|task| self.pipeline.onboard(&task.account_id, &task.target_table)),
        )
        .await;
        onboarded.into_iter().collect::<Result<Vec<()>>>()?;

        info!(version = run.version, tasks = tasks.len(), "tasks created and onboarded");
        Ok(ManagerStage::Writing)
    }

    // ── Writing ───────────────────────────────────────────────────────

    async fn writing(
        &self,
        state: &ManagerState,
        run: &OrchestrationRun,
        now: DateTime<Utc>,
    ) -> Result<ManagerStage> {
        let tasks = self.metadata.tasks_for_version(run.version).await?;
        let ttl = now + self.settings.task_ttl;
        let job_timeout = now + self.settings.job_timeout;
        let iteration = state.iteration;

        let refreshed = join_all(tasks.iter().filter(|task| task.active).map(|task| {
            self.metadata.update_task(&task.account_id, move |task| {
                if task.is_hung(now) {
                    warn!(account = %task.account_id, version = task.version, "clearing hung running flag");
                    task.running = false;
                }
                task.iteration = iteration;
                task.ttl = Some(ttl);
                task.job_timeout = Some(job_timeout);
                Ok(())
            })
        }))
        .await;

        let mut active = Vec::new();
        for result in refreshed {
            match result {
                Ok(task) if task.active => active.push(task),
                Ok(_) => {}
                Err(e) => warn!(version = run.version, iteration, error = %e, "failed to refresh task"),
            }
        }

        let requests: Vec<TaskRequest> = active
            .iter()
            .map(|task| TaskRequest {
                billing_account_id: task.account_id.clone(),
                iteration,
                version: run.version,
            })
            .collect();
        let dispatched = join_all(requests.iter().map(|request| self.dispatcher.enqueue(request))).await;
        for (request, result) in requests.iter().zip(dispatched) {
            if let Err(e) = result {
                warn!(account = %request.billing_account_id, version = request.version, iteration, error = %e, "task dispatch failed");
            }
        }
        info!(version = run.version, iteration, dispatched = requests.len(), "writing iteration dispatched");

        if run.write_phase_over(now) {
            Ok(ManagerStage::WaitToVerifyRowCount)
        } else {
            Ok(ManagerStage::Writing)
        }
    }

    // ── Verification ──────────────────────────────────────────────────

    async fn verifying(&self, run: &OrchestrationRun, now: DateTime<Utc>) -> Result<ManagerStage> {
        let tasks = self.metadata.tasks_for_version(run.version).await?;
        if tasks.iter().any(|task| !task.verified) {
            self.verify_row_counts(run, now).await?;
        }
        let pending: Vec<String> = self
            .metadata
            .tasks_for_version(run.version)
            .await?
            .into_iter()
            .filter(|task| !task.verified)
            .map(|task| task.account_id)
            .collect();
        if pending.is_empty() {
            Ok(ManagerStage::Notifying)
        } else {
            warn!(version = run.version, unverified = ?pending, "verification incomplete, retrying next step");
            Ok(ManagerStage::VerifyingRowCount)
        }
    }

    /// Query the three backends for every unverified task. A failed query
    /// leaves only that task unverified.
    async fn verify_row_counts(&self, run: &OrchestrationRun, now: DateTime<Utc>) -> Result<()> {
        let tasks = self.metadata.tasks_for_version(run.version).await?;
        let from = run.created_at;
        join_all(
            tasks
                .iter()
                .filter(|task| !task.verified)
                .map(|task| self.verify_task(&task.account_id, from, now)),
        )
        .await;
        Ok(())
    }

    async fn verify_task(&self, account: &str, from: DateTime<Utc>, to: DateTime<Utc>) {
        let counts = join_all(
            Backend::ALL
                .iter()
                .map(|backend| self.row_counts.count_rows(*backend, account, from, to)),
        )
        .await;
        let counts = match counts.into_iter().collect::<Result<Vec<i64>>>() {
            Ok(counts) => counts,
            Err(e) => {
                warn!(account, error = %e, "row count query failed, task stays unverified");
                return;
            }
        };
        let (customer, local, unified) = (counts[0], counts[1], counts[2]);
        let updated = self
            .metadata
            .update_task(account, |task| {
                task.written_rows.from_customer_copy = customer;
                task.written_rows.from_local_copy = local;
                task.written_rows.from_unified_copy = unified;
                task.verified = true;
                Ok(())
            })
            .await;
        match updated {
            Ok(task) => debug!(account, expected = task.written_rows.expected, customer, local, unified, "task verified"),
            Err(e) => warn!(account, error = %e, "failed to record row counts"),
        }
    }

    // ── Notifying ─────────────────────────────────────────────────────

    /// Send the run summary; returns whether every task passed.
    async fn notify(&self, version: i64) -> Result<bool> {
        let tasks = self.metadata.tasks_for_version(version).await?;
        let notification = summarize(&self.settings.environment, &tasks);
        let passed = notification.severity == Severity::Info;
        self.notifier.send(&notification).await?;
        info!(version, passed, tasks = tasks.len(), "run summary sent");
        Ok(passed)
    }
}

/// Build the run summary: one PASSED/FAILED line per account.
pub fn summarize(environment: &str, tasks: &[TaskState]) -> Notification {
    let mut lines = vec!["automation results:".to_string()];
    let mut passed = true;
    for task in tasks {
        let rows = &task.written_rows;
        lines.push(format!(
            "BA {}:{} Expected: {} Customer: {} Local: {} Unified: {}",
            task.account_id,
            rows.verdict(),
            rows.expected,
            rows.from_customer_copy,
            rows.from_local_copy,
            rows.from_unified_copy
        ));
        passed &= rows.converged();
    }
    Notification {
        subject: format!("Automation Suite Result for env {}", environment),
        severity: if passed { Severity::Info } else { Severity::Urgent },
        lines,
    }
}
