use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{CasResult, DocKey, DocumentStore, IDENTITIES_COLLECTION, TASKS_COLLECTION};
use crate::automation::models::{ManagerState, OrchestrationRun, TaskState, WorkerIdentity};
use crate::errors::{AutomationError, Result};

/// Retry bound for optimistic transactions.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Typed, transactional access to automation metadata.
///
/// All shared mutation in the engine funnels through [`Metadata::transact`]:
/// read the document with its version, apply a closure, and write back only
/// if nobody else wrote in between. A lost race re-reads and re-applies the
/// closure, up to `max_attempts` times. An error returned by the closure is a
/// business-rule rejection and aborts immediately without a write.
#[derive(Clone)]
pub struct Metadata {
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
}

impl Metadata {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &DocKey) -> Result<Option<T>> {
        match self.store.get(key.collection(), key.id()).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.body)?)),
            None => Ok(None),
        }
    }

    /// Create `key` with `value`. An existing document is left untouched and
    /// reported as `false`.
    pub async fn create<T: Serialize>(&self, key: &DocKey, value: &T) -> Result<bool> {
        let body = serde_json::to_value(value)?;
        self.store.create(key.collection(), key.id(), body).await
    }

    pub async fn delete(&self, key: &DocKey) -> Result<()> {
        self.store.delete(key.collection(), key.id()).await
    }

    /// Unconditionally replace `key` with `value`, creating it if needed.
    pub async fn put<T>(&self, key: &DocKey, value: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
    {
        self.transact(key, |_: Option<T>| Ok(value.clone())).await
    }

    /// Optimistic read-modify-write of one document.
    ///
    /// The closure sees `None` when the document does not exist; returning a
    /// value creates it.
    pub async fn transact<T, F>(&self, key: &DocKey, mut apply: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut(Option<T>) -> Result<T> + Send,
    {
        for attempt in 1..=self.max_attempts {
            let (expected, current) = match self.store.get(key.collection(), key.id()).await? {
                Some(doc) => (Some(doc.version), Some(serde_json::from_value(doc.body)?)),
                None => (None, None),
            };
            let next = apply(current)?;
            let body = serde_json::to_value(&next)?;
            match self
                .store
                .compare_and_put(key.collection(), key.id(), expected, body)
                .await?
            {
                CasResult::Success { .. } => return Ok(next),
                CasResult::Conflict => {
                    debug!(key = %key, attempt, "write conflict, retrying transaction");
                    tokio::task::yield_now().await;
                }
            }
        }
        Err(AutomationError::TransactionConflict {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Like [`transact`](Self::transact) but the document must already exist.
    pub async fn update<T, F>(&self, key: &DocKey, mut apply: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut(&mut T) -> Result<()> + Send,
    {
        let missing = key.to_string();
        self.transact(key, |current: Option<T>| {
            let mut value = current.ok_or_else(|| AutomationError::NotFound {
                key: missing.clone(),
            })?;
            apply(&mut value)?;
            Ok(value)
        })
        .await
    }

    async fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        self.store
            .list(collection)
            .await?
            .into_iter()
            .map(|(_, doc)| serde_json::from_value(doc.body).map_err(AutomationError::from))
            .collect()
    }

    // ── Manager / orchestration ───────────────────────────────────────

    pub async fn manager(&self) -> Result<Option<ManagerState>> {
        self.get(&DocKey::Manager).await
    }

    pub async fn orchestration(&self) -> Result<Option<OrchestrationRun>> {
        self.get(&DocKey::Orchestration).await
    }

    pub async fn update_manager<F>(&self, apply: F) -> Result<ManagerState>
    where
        F: FnMut(&mut ManagerState) -> Result<()> + Send,
    {
        self.update(&DocKey::Manager, apply).await
    }

    pub async fn update_orchestration<F>(&self, apply: F) -> Result<OrchestrationRun>
    where
        F: FnMut(&mut OrchestrationRun) -> Result<()> + Send,
    {
        self.update(&DocKey::Orchestration, apply).await
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub async fn task(&self, account_id: &str) -> Result<Option<TaskState>> {
        self.get(&DocKey::Task(account_id.to_string())).await
    }

    pub async fn tasks(&self) -> Result<Vec<TaskState>> {
        self.list(TASKS_COLLECTION).await
    }

    pub async fn tasks_for_version(&self, version: i64) -> Result<Vec<TaskState>> {
        let mut tasks = self.tasks().await?;
        tasks.retain(|task| task.version == version);
        Ok(tasks)
    }

    pub async fn update_task<F>(&self, account_id: &str, apply: F) -> Result<TaskState>
    where
        F: FnMut(&mut TaskState) -> Result<()> + Send,
    {
        self.update(&DocKey::Task(account_id.to_string()), apply).await
    }

    /// Delete tasks left behind by versions older than `version`.
    pub async fn delete_tasks_before(&self, version: i64) -> Result<usize> {
        let stale: Vec<String> = self
            .tasks()
            .await?
            .into_iter()
            .filter(|task| task.version < version)
            .map(|task| task.account_id)
            .collect();
        for account_id in &stale {
            self.delete(&DocKey::Task(account_id.clone())).await?;
        }
        Ok(stale.len())
    }

    pub async fn delete_all_tasks(&self) -> Result<usize> {
        let ids = self.store.list(TASKS_COLLECTION).await?;
        for (id, _) in &ids {
            self.store.delete(TASKS_COLLECTION, id).await?;
        }
        Ok(ids.len())
    }

    // ── Worker identities ─────────────────────────────────────────────

    pub async fn identities(&self) -> Result<Vec<WorkerIdentity>> {
        self.list(IDENTITIES_COLLECTION).await
    }

    pub async fn update_identity<F>(&self, identity_id: &str, apply: F) -> Result<WorkerIdentity>
    where
        F: FnMut(&mut WorkerIdentity) -> Result<()> + Send,
    {
        self.update(&DocKey::Identity(identity_id.to_string()), apply)
            .await
    }
}
