//! In-process stand-ins for the warehouse and the identity provider.
//!
//! `SimulatedWarehouse` behaves like the real pipeline closely enough for the
//! engine to run end to end: a successful copy job lands rows in the customer
//! copy, and onboarded accounts are mirrored into the local and unified
//! copies. Faults are injected per account or backend.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::jobs::{CopyJob, JobHandle, JobOutcome, JobRunner, remaining_wait};
use super::services::{
    Backend, IdentityProvisioner, IngestionPipeline, RowCountService, RowCounter, TableProvisioner,
};
use crate::errors::{AutomationError, Result};

type RowLog = HashMap<String, Vec<(DateTime<Utc>, i64)>>;

#[derive(Default)]
struct WarehouseState {
    tables: BTreeMap<String, String>,
    onboarded: BTreeMap<String, String>,
    rows: HashMap<Backend, RowLog>,
    dropped: HashMap<(Backend, String), i64>,
    failing_backends: HashSet<Backend>,
    failing_submissions: HashSet<String>,
    failing_table_drops: bool,
    scripted: HashMap<String, VecDeque<JobOutcome>>,
    jobs: HashMap<String, CopyJob>,
    submitted: Vec<CopyJob>,
    progress_purges: usize,
    job_delay: Option<Duration>,
}

#[derive(Default)]
pub struct SimulatedWarehouse {
    state: Mutex<WarehouseState>,
}

impl SimulatedWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> Result<MutexGuard<'_, WarehouseState>> {
        self.state.lock().map_err(|_| {
            AutomationError::collaborator("simulated warehouse", anyhow::anyhow!("state lock poisoned"))
        })
    }

    /// Queue outcomes for the next jobs of `account_id`; unscripted jobs succeed.
    pub fn script_outcomes(&self, account_id: &str, outcomes: &[JobOutcome]) -> Result<()> {
        self.state()?
            .scripted
            .entry(account_id.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
        Ok(())
    }

    /// Hide `rows` rows of `account_id` from `backend`'s count.
    pub fn drop_rows(&self, backend: Backend, account_id: &str, rows: i64) -> Result<()> {
        *self
            .state()?
            .dropped
            .entry((backend, account_id.to_string()))
            .or_default() += rows;
        Ok(())
    }

    pub fn fail_counts(&self, backend: Backend, failing: bool) -> Result<()> {
        let mut state = self.state()?;
        if failing {
            state.failing_backends.insert(backend);
        } else {
            state.failing_backends.remove(&backend);
        }
        Ok(())
    }

    pub fn fail_submissions(&self, account_id: &str) -> Result<()> {
        self.state()?
            .failing_submissions
            .insert(account_id.to_string());
        Ok(())
    }

    pub fn fail_table_drops(&self, failing: bool) -> Result<()> {
        self.state()?.failing_table_drops = failing;
        Ok(())
    }

    /// Make every job take `delay` to finish.
    pub fn set_job_delay(&self, delay: Option<Duration>) -> Result<()> {
        self.state()?.job_delay = delay;
        Ok(())
    }

    pub fn submitted_jobs(&self) -> Result<Vec<CopyJob>> {
        Ok(self.state()?.submitted.clone())
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.state()?.tables.keys().cloned().collect())
    }

    pub fn onboarded_accounts(&self) -> Result<Vec<String>> {
        Ok(self.state()?.onboarded.keys().cloned().collect())
    }

    pub fn progress_purges(&self) -> Result<usize> {
        Ok(self.state()?.progress_purges)
    }

    /// Row-count service reading this warehouse's three backends.
    pub fn row_counts(self: &Arc<Self>) -> RowCountService {
        let view = |backend| -> Arc<dyn RowCounter> {
            Arc::new(BackendView {
                warehouse: self.clone(),
                backend,
            })
        };
        RowCountService::new(
            view(Backend::CustomerCopy),
            view(Backend::LocalCopy),
            view(Backend::UnifiedCopy),
        )
    }

    fn land_rows(&self, account_id: &str, rows: i64) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state()?;
        let mirrored = state.onboarded.contains_key(account_id);
        for backend in Backend::ALL {
            if backend != Backend::CustomerCopy && !mirrored {
                continue;
            }
            state
                .rows
                .entry(backend)
                .or_default()
                .entry(account_id.to_string())
                .or_default()
                .push((now, rows));
        }
        Ok(())
    }

    fn count(&self, backend: Backend, account_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<i64> {
        let state = self.state()?;
        if state.failing_backends.contains(&backend) {
            return Err(AutomationError::collaborator(
                "row count",
                anyhow::anyhow!("{} query failed", backend),
            ));
        }
        let written: i64 = state
            .rows
            .get(&backend)
            .and_then(|log| log.get(account_id))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(at, _)| *at >= from && *at <= to)
                    .map(|(_, rows)| rows)
                    .sum()
            })
            .unwrap_or(0);
        let dropped = state
            .dropped
            .get(&(backend, account_id.to_string()))
            .copied()
            .unwrap_or(0);
        Ok((written - dropped).max(0))
    }
}

struct BackendView {
    warehouse: Arc<SimulatedWarehouse>,
    backend: Backend,
}

#[async_trait]
impl RowCounter for BackendView {
    async fn count_rows(&self, account_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<i64> {
        self.warehouse.count(self.backend, account_id, from, to)
    }
}

#[async_trait]
impl JobRunner for SimulatedWarehouse {
    async fn submit(&self, job: &CopyJob) -> Result<JobHandle> {
        let mut state = self.state()?;
        if state.failing_submissions.contains(&job.account_id) {
            return Err(AutomationError::collaborator(
                "job runner",
                anyhow::anyhow!("quota exceeded for {}", job.account_id),
            ));
        }
        let handle = JobHandle {
            id: format!("job_{}", Uuid::new_v4().simple()),
            rows: job.row_limit,
        };
        state.jobs.insert(handle.id.clone(), job.clone());
        state.submitted.push(job.clone());
        debug!(job_id = %handle.id, account = %job.account_id, rows = job.row_limit, "simulated job submitted");
        Ok(handle)
    }

    async fn await_outcome(
        &self,
        handle: &JobHandle,
        deadline: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<JobOutcome> {
        let (job, scripted, delay) = {
            let mut state = self.state()?;
            let job = state.jobs.get(&handle.id).cloned().ok_or_else(|| {
                AutomationError::collaborator("job runner", anyhow::anyhow!("unknown job {}", handle.id))
            })?;
            let scripted = state
                .scripted
                .get_mut(&job.account_id)
                .and_then(VecDeque::pop_front);
            (job, scripted, state.job_delay)
        };

        if let Some(delay) = delay {
            match remaining_wait(Utc::now(), deadline, grace) {
                Some(remaining) if delay <= remaining => tokio::time::sleep(delay).await,
                Some(remaining) => {
                    tokio::time::sleep(remaining).await;
                    return Ok(JobOutcome::Stuck);
                }
                None => return Ok(JobOutcome::Stuck),
            }
        }

        let outcome = scripted.unwrap_or(JobOutcome::Success);
        if outcome == JobOutcome::Success {
            self.land_rows(&job.account_id, handle.rows)?;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl TableProvisioner for SimulatedWarehouse {
    async fn create_table(&self, name: &str, schema_template: &str) -> Result<()> {
        self.state()?
            .tables
            .entry(name.to_string())
            .or_insert_with(|| schema_template.to_string());
        Ok(())
    }

    async fn delete_table(&self, name: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.failing_table_drops {
            return Err(AutomationError::collaborator(
                "table provisioning",
                anyhow::anyhow!("failed to drop {}", name),
            ));
        }
        state.tables.remove(name);
        Ok(())
    }

    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .tables
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IngestionPipeline for SimulatedWarehouse {
    async fn purge_write_progress(&self) -> Result<()> {
        self.state()?.progress_purges += 1;
        Ok(())
    }

    async fn onboard(&self, account_id: &str, table: &str) -> Result<()> {
        self.state()?
            .onboarded
            .insert(account_id.to_string(), table.to_string());
        Ok(())
    }

    async fn offboard(&self, account_id: &str) -> Result<()> {
        self.state()?.onboarded.remove(account_id);
        Ok(())
    }
}

/// Identity provider that keeps identities in memory.
#[derive(Default)]
pub struct SimulatedIdentityProvider {
    identities: Mutex<BTreeSet<String>>,
    granted: Mutex<BTreeSet<String>>,
}

impl SimulatedIdentityProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Provider that already knows `ids`.
    pub fn with_identities(ids: impl IntoIterator<Item = String>) -> Arc<Self> {
        Arc::new(Self {
            identities: Mutex::new(ids.into_iter().collect()),
            granted: Mutex::default(),
        })
    }

    pub fn granted(&self) -> Vec<String> {
        self.granted
            .lock()
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned() -> AutomationError {
    AutomationError::collaborator("identity provider", anyhow::anyhow!("state lock poisoned"))
}

#[async_trait]
impl IdentityProvisioner for SimulatedIdentityProvider {
    async fn create_identity(&self, id: &str) -> Result<()> {
        self.identities
            .lock()
            .map_err(|_| poisoned())?
            .insert(id.to_string());
        Ok(())
    }

    async fn delete_identity(&self, id: &str) -> Result<()> {
        self.identities.lock().map_err(|_| poisoned())?.remove(id);
        self.granted.lock().map_err(|_| poisoned())?.remove(id);
        Ok(())
    }

    async fn list_identities(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .identities
            .lock()
            .map_err(|_| poisoned())?
            .iter()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn grant_baseline_permissions(&self, ids: &[String]) -> Result<()> {
        self.granted
            .lock()
            .map_err(|_| poisoned())?
            .extend(ids.iter().cloned());
        Ok(())
    }
}
