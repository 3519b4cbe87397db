//! Orchestration lifecycle: create, stop and tear down runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use super::identity::WorkerIdentityPool;
use super::models::{ManagerState, OrchestrationParams, OrchestrationRun, target_table_name};
use super::services::{IngestionPipeline, TableProvisioner};
use super::store::{DocKey, Metadata};
use crate::errors::{AutomationError, Result, human_duration};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub verify_delay: chrono::Duration,
    pub table_prefix: String,
    pub schema_template: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            verify_delay: chrono::Duration::minutes(120),
            table_prefix: "automation_dummy".to_string(),
            schema_template: "billing_export_v1".to_string(),
        }
    }
}

/// What a teardown removed.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TeardownReport {
    pub version: i64,
    pub tasks: usize,
    pub tables: usize,
    pub identities: usize,
}

pub struct Orchestrator {
    metadata: Metadata,
    pool: WorkerIdentityPool,
    tables: Arc<dyn TableProvisioner>,
    pipeline: Arc<dyn IngestionPipeline>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        metadata: Metadata,
        pool: WorkerIdentityPool,
        tables: Arc<dyn TableProvisioner>,
        pipeline: Arc<dyn IngestionPipeline>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            metadata,
            pool,
            tables,
            pipeline,
            settings,
        }
    }

    /// Create the default manager and orchestration documents if missing.
    pub async fn ensure_defaults(&self) -> Result<()> {
        let now = Utc::now();
        self.metadata
            .create(&DocKey::Manager, &ManagerState::idle(0))
            .await?;
        self.metadata
            .create(&DocKey::Orchestration, &OrchestrationRun::placeholder(0, now))
            .await?;
        Ok(())
    }

    /// Highest version recorded in either singleton document.
    async fn last_version(&self) -> Result<i64> {
        let run = self.metadata.orchestration().await?.map_or(0, |r| r.version);
        let manager = self.metadata.manager().await?.map_or(0, |m| m.version);
        Ok(run.max(manager))
    }

    pub async fn create_orchestration(&self, params: OrchestrationParams) -> Result<OrchestrationRun> {
        self.create_orchestration_at(params, Utc::now()).await
    }

    pub async fn create_orchestration_at(
        &self,
        params: OrchestrationParams,
        now: DateTime<Utc>,
    ) -> Result<OrchestrationRun> {
        let capacity = self.pool.total_capacity();
        if params.num_synthetic_accounts as usize > capacity {
            return Err(AutomationError::InvalidRequest(format!(
                "numOfDummyUsers {} exceeds identity pool capacity {}",
                params.num_synthetic_accounts, capacity
            )));
        }

        let floor = self.last_version().await?;
        let (write_deadline, verify_after) = chrono::Duration::try_minutes(params.duration_minutes)
            .and_then(|duration| now.checked_add_signed(duration))
            .and_then(|deadline| {
                deadline
                    .checked_add_signed(self.settings.verify_delay)
                    .map(|after| (deadline, after))
            })
            .ok_or_else(|| {
                AutomationError::InvalidRequest(format!(
                    "durationInMinutes {} is out of range",
                    params.duration_minutes
                ))
            })?;

        let run = self
            .metadata
            .transact(&DocKey::Orchestration, |current: Option<OrchestrationRun>| {
                let previous = match current {
                    Some(prev) => {
                        if let Some(deadline) = prev.write_deadline
                            && deadline > now
                        {
                            return Err(AutomationError::OrchestrationStillRunning {
                                remaining: human_duration(deadline - now),
                            });
                        }
                        prev.version
                    }
                    None => 0,
                };
                Ok(OrchestrationRun {
                    version: previous.max(floor) + 1,
                    num_synthetic_accounts: params.num_synthetic_accounts,
                    min_throughput: params.min_rows_per_hour,
                    max_throughput: params.max_rows_per_hour,
                    write_deadline: Some(write_deadline),
                    verify_after: Some(verify_after),
                    created_at: now,
                })
            })
            .await?;

        self.metadata
            .put(&DocKey::Manager, &ManagerState::pending(run.version))
            .await?;
        self.pool.ensure_capacity().await?;

        let schema = self.settings.schema_template.as_str();
        let names: Vec<String> = run
            .synthetic_accounts()
            .iter()
            .map(|account| target_table_name(&self.settings.table_prefix, account))
            .collect();
        let results = join_all(names.iter().map(|name| self.tables.create_table(name, schema))).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;

        info!(
            version = run.version,
            accounts = run.num_synthetic_accounts,
            write_deadline = %write_deadline,
            verify_after = %verify_after,
            "orchestration created"
        );
        Ok(run)
    }

    /// End the write phase now; the manager leaves `Writing` on its next step.
    pub async fn stop_orchestration(&self) -> Result<OrchestrationRun> {
        let now = Utc::now();
        let run = self
            .metadata
            .update_orchestration(|run| {
                run.write_deadline = Some(now);
                Ok(())
            })
            .await
            .map_err(|e| match e {
                AutomationError::NotFound { .. } => AutomationError::MissingOrchestration,
                other => other,
            })?;
        info!(version = run.version, "orchestration stopped");
        Ok(run)
    }

    /// Full teardown back to the default state. Every step tolerates what a
    /// previous, partial teardown left behind.
    pub async fn delete_automation(&self) -> Result<TeardownReport> {
        let version = self.last_version().await?;
        let tasks = self.metadata.tasks().await?;

        let offboarded = join_all(tasks.iter().map(|task| self.pipeline.offboard(&task.account_id))).await;
        offboarded.into_iter().collect::<Result<Vec<()>>>()?;

        let deleted_tasks = self.metadata.delete_all_tasks().await?;

        let tables = self.tables.list_tables(&self.settings.table_prefix).await?;
        let dropped = join_all(tables.iter().map(|name| self.tables.delete_table(name))).await;
        dropped.into_iter().collect::<Result<Vec<()>>>()?;

        let identities = self.pool.release_all().await?;

        // Manager and orchestration are replaced only after every
        // collaborator call above succeeded.
        let now = Utc::now();
        self.metadata
            .put(&DocKey::Manager, &ManagerState::idle(version))
            .await?;
        self.metadata
            .put(&DocKey::Orchestration, &OrchestrationRun::placeholder(version, now))
            .await?;
        if let Err(e) = self.pool.ensure_capacity().await {
            warn!(error = %e, "failed to rebuild worker identity pool");
            return Err(e);
        }

        let report = TeardownReport {
            version,
            tasks: deleted_tasks,
            tables: tables.len(),
            identities,
        };
        info!(?report, "automation torn down");
        Ok(report)
    }
}
