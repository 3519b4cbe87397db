//! Wiring: builds the store, collaborators and components once and hands
//! them out explicitly.

use std::sync::Arc;

use serde::Serialize;

use super::dispatch::{HttpDispatcher, InlineDispatcher, TaskDispatcher};
use super::identity::WorkerIdentityPool;
use super::jobs::JobRunner;
use super::manager::Manager;
use super::models::{ManagerState, OrchestrationRun};
use super::notify::{FanoutSink, LogSink, NotificationSink, WebhookSink};
use super::orchestrator::Orchestrator;
use super::services::{IdentityProvisioner, IngestionPipeline, RowCountService, TableProvisioner};
use super::simulated::{SimulatedIdentityProvider, SimulatedWarehouse};
use super::store::{DocumentStore, InMemoryStore, Metadata, SqliteStore};
use super::task::TaskExecutor;
use crate::config::{AutomationToml, DispatchMode, StoreBackend};
use crate::errors::Result;

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobRunner>,
    pub row_counts: RowCountService,
    pub tables: Arc<dyn TableProvisioner>,
    pub pipeline: Arc<dyn IngestionPipeline>,
    pub identities: Arc<dyn IdentityProvisioner>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Collaborators {
    pub fn simulated(
        warehouse: &Arc<SimulatedWarehouse>,
        identities: Arc<SimulatedIdentityProvider>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            jobs: warehouse.clone(),
            row_counts: warehouse.row_counts(),
            tables: warehouse.clone(),
            pipeline: warehouse.clone(),
            identities,
            notifier,
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    pub metadata: Metadata,
    pub pool: WorkerIdentityPool,
    pub executor: Arc<TaskExecutor>,
    pub orchestrator: Arc<Orchestrator>,
    pub manager: Arc<Manager>,
}

impl Engine {
    pub fn new(store: Arc<dyn DocumentStore>, collaborators: Collaborators, config: &AutomationToml) -> Self {
        let metadata = Metadata::new(store).with_max_attempts(config.store.max_attempts);
        let pool = WorkerIdentityPool::new(
            metadata.clone(),
            collaborators.identities.clone(),
            config.pool_settings(),
        );
        let executor = Arc::new(TaskExecutor::new(
            metadata.clone(),
            collaborators.jobs.clone(),
            config.executor_settings(),
        ));
        let dispatcher: Arc<dyn TaskDispatcher> = match config.dispatch.mode {
            DispatchMode::Inline => Arc::new(InlineDispatcher::new(executor.clone())),
            DispatchMode::Http => Arc::new(HttpDispatcher::new(&config.dispatch.base_url)),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            metadata.clone(),
            pool.clone(),
            collaborators.tables.clone(),
            collaborators.pipeline.clone(),
            config.orchestrator_settings(),
        ));
        let manager = Arc::new(Manager::new(
            metadata.clone(),
            pool.clone(),
            dispatcher,
            collaborators.row_counts.clone(),
            collaborators.pipeline.clone(),
            collaborators.notifier.clone(),
            orchestrator.clone(),
            config.manager_settings(),
        ));
        Self {
            metadata,
            pool,
            executor,
            orchestrator,
            manager,
        }
    }

    /// Engine on the configured store with in-process warehouse and identity
    /// provider.
    pub async fn from_config(config: &AutomationToml) -> Result<Self> {
        let store = open_store(config)?;
        // Identities recorded by an earlier process still exist at the provider.
        let known = Metadata::new(store.clone())
            .identities()
            .await?
            .into_iter()
            .map(|identity| identity.id);
        let warehouse = SimulatedWarehouse::new();
        let collaborators = Collaborators::simulated(
            &warehouse,
            SimulatedIdentityProvider::with_identities(known),
            notifier_for(config),
        );
        Ok(Self::new(store, collaborators, config))
    }

    pub async fn ensure_defaults(&self) -> Result<()> {
        self.orchestrator.ensure_defaults().await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let tasks = self.metadata.tasks().await?;
        let identities = self.metadata.identities().await?;
        Ok(EngineStatus {
            manager: self.metadata.manager().await?,
            orchestration: self.metadata.orchestration().await?,
            tasks: TaskSummary {
                total: tasks.len(),
                active: tasks.iter().filter(|t| t.active).count(),
                running: tasks.iter().filter(|t| t.running).count(),
                verified: tasks.iter().filter(|t| t.verified).count(),
                expected_rows: tasks.iter().map(|t| t.written_rows.expected).sum(),
            },
            identities: IdentitySummary {
                total: identities.len(),
                full: identities.iter().filter(|i| i.is_full).count(),
                bound_accounts: identities.iter().map(|i| i.bound_accounts.len()).sum(),
            },
        })
    }
}

pub fn open_store(config: &AutomationToml) -> Result<Arc<dyn DocumentStore>> {
    Ok(match config.store.backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::new(&config.store.path)?),
        StoreBackend::Memory => Arc::new(InMemoryStore::new()),
    })
}

/// Log sink, plus the webhook sink when a URL is configured.
pub fn notifier_for(config: &AutomationToml) -> Arc<dyn NotificationSink> {
    let url = config.notifications.webhook_url.trim();
    if url.is_empty() {
        return Arc::new(LogSink);
    }
    Arc::new(FanoutSink::new(vec![
        Arc::new(LogSink),
        Arc::new(WebhookSink::new(url, &config.notifications.channel)),
    ]))
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub manager: Option<ManagerState>,
    pub orchestration: Option<OrchestrationRun>,
    pub tasks: TaskSummary,
    pub identities: IdentitySummary,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskSummary {
    pub total: usize,
    pub active: usize,
    pub running: usize,
    pub verified: usize,
    pub expected_rows: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IdentitySummary {
    pub total: usize,
    pub full: usize,
    pub bound_accounts: usize,
}
