//! Worker-identity pool.
//!
//! Every synthetic account runs under one worker identity, and an identity
//! serves at most `capacity` accounts. Allocation picks a random identity
//! among the least-loaded non-full ones and binds the account inside a
//! metadata transaction, so concurrent allocators never overcommit.
//! Allocations from one pool are serialized, which keeps an account bound
//! to a single identity; across processes that exclusion comes from the
//! manager's claimed step, the only place accounts are allocated.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::WorkerIdentity;
use super::services::IdentityProvisioner;
use super::store::{DocKey, Metadata};
use crate::errors::{AutomationError, Result};

const ID_SUFFIX_LEN: usize = 15;
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub capacity: usize,
    pub max_identities: usize,
    pub allocation_attempts: u32,
    pub allocation_delay: Duration,
    pub provisioning_pause: Duration,
    pub prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 9,
            max_identities: 100,
            allocation_attempts: 100,
            allocation_delay: Duration::from_millis(500),
            provisioning_pause: Duration::from_millis(1000),
            prefix: "automation-sa".to_string(),
        }
    }
}

/// `<prefix>-<15 random lowercase alphanumerics>`.
pub fn new_identity_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect();
    format!("{}-{}", prefix, suffix)
}

#[derive(Clone)]
pub struct WorkerIdentityPool {
    metadata: Metadata,
    provisioner: Arc<dyn IdentityProvisioner>,
    settings: PoolSettings,
    allocation: Arc<Mutex<()>>,
}

impl WorkerIdentityPool {
    pub fn new(metadata: Metadata, provisioner: Arc<dyn IdentityProvisioner>, settings: PoolSettings) -> Self {
        Self {
            metadata,
            provisioner,
            settings,
            allocation: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Accounts the pool can hold once it is at full size.
    pub fn total_capacity(&self) -> usize {
        self.settings.capacity * self.settings.max_identities
    }

    /// Bind `account_id` to one identity.
    ///
    /// Fails with `NoAvailableIdentity` when every identity is full, and with
    /// `IdentityFull` when the picked identity filled up before our write.
    pub async fn allocate(&self, account_id: &str) -> Result<WorkerIdentity> {
        let _allocating = self.allocation.lock().await;
        let identities = self.metadata.identities().await?;
        if let Some(bound) = identities
            .iter()
            .find(|identity| identity.bound_accounts.iter().any(|a| a == account_id))
        {
            return Ok(bound.clone());
        }

        let open: Vec<&WorkerIdentity> = identities.iter().filter(|i| !i.is_full).collect();
        let Some(min_load) = open.iter().map(|i| i.bound_accounts.len()).min() else {
            return Err(AutomationError::NoAvailableIdentity);
        };
        let least_loaded: Vec<&WorkerIdentity> = open
            .into_iter()
            .filter(|i| i.bound_accounts.len() == min_load)
            .collect();
        let picked = {
            let mut rng = rand::thread_rng();
            least_loaded[rng.gen_range(0..least_loaded.len())].id.clone()
        };

        let capacity = self.settings.capacity;
        let identity = self
            .metadata
            .update_identity(&picked, |identity| identity.bind(account_id, capacity))
            .await?;
        debug!(account = %account_id, identity = %identity.id, bound = identity.bound_accounts.len(), "identity allocated");
        Ok(identity)
    }

    /// [`allocate`](Self::allocate) with a fixed delay between attempts.
    pub async fn allocate_with_retry(&self, account_id: &str) -> Result<WorkerIdentity> {
        for attempt in 1..=self.settings.allocation_attempts {
            match self.allocate(account_id).await {
                Ok(identity) => return Ok(identity),
                Err(AutomationError::NoAvailableIdentity | AutomationError::IdentityFull { .. }) => {
                    debug!(account = %account_id, attempt, "no identity available, retrying");
                    tokio::time::sleep(self.settings.allocation_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(account = %account_id, attempts = self.settings.allocation_attempts, "identity allocation exhausted");
        Err(AutomationError::NoAvailableIdentity)
    }

    /// Grow the pool to `max_identities`, one identity at a time.
    ///
    /// Identities that exist at the provider but not in the store are
    /// recorded, and baseline permissions are granted to the whole pool.
    /// Returns how many identities were created.
    pub async fn ensure_capacity(&self) -> Result<usize> {
        let mut ids = self.provisioner.list_identities(&self.settings.prefix).await?;
        let missing = self.settings.max_identities.saturating_sub(ids.len());

        for n in 0..missing {
            if n > 0 {
                tokio::time::sleep(self.settings.provisioning_pause).await;
            }
            let id = new_identity_id(&self.settings.prefix);
            self.provisioner.create_identity(&id).await?;
            debug!(identity = %id, "worker identity created");
            ids.push(id);
        }

        for id in &ids {
            self.metadata
                .create(&DocKey::Identity(id.clone()), &WorkerIdentity::new(id))
                .await?;
        }
        self.provisioner.grant_baseline_permissions(&ids).await?;
        if missing > 0 {
            info!(created = missing, total = ids.len(), "worker identity pool provisioned");
        }
        Ok(missing)
    }

    /// Delete every identity from the provider and the store. Safe to repeat.
    pub async fn release_all(&self) -> Result<usize> {
        let mut ids: Vec<String> = self
            .metadata
            .identities()
            .await?
            .into_iter()
            .map(|identity| identity.id)
            .collect();
        for id in self.provisioner.list_identities(&self.settings.prefix).await? {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        for id in &ids {
            self.provisioner.delete_identity(id).await?;
            self.metadata.delete(&DocKey::Identity(id.clone())).await?;
        }
        Ok(ids.len())
    }
}
