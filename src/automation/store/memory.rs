//! In-memory document store.
//!
//! Thread-safe through a single `RwLock`; state is lost when the process
//! exits, so this backend is only meant for tests and local runs.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{CasResult, DocumentStore, Versioned};
use crate::errors::{AutomationError, Result};

type Collections = BTreeMap<String, BTreeMap<String, Versioned>>;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<Collections>,
}

fn poison_err<T>(_: PoisonError<T>) -> AutomationError {
    AutomationError::storage(anyhow::anyhow!("metadata lock poisoned"))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Versioned>> {
        let collections = self.collections.read().map_err(poison_err)?;
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Versioned)>> {
        let collections = self.collections.read().map_err(poison_err)?;
        Ok(collections
            .get(collection)
            .map(|c| c.iter().map(|(id, doc)| (id.clone(), doc.clone())).collect())
            .unwrap_or_default())
    }

    async fn create(&self, collection: &str, id: &str, body: Value) -> Result<bool> {
        let mut collections = self.collections.write().map_err(poison_err)?;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Ok(false);
        }
        docs.insert(id.to_string(), Versioned { version: 1, body });
        Ok(true)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(poison_err)?;
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn compare_and_put(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
        body: Value,
    ) -> Result<CasResult> {
        let mut collections = self.collections.write().map_err(poison_err)?;
        let docs = collections.entry(collection.to_string()).or_default();
        let current = docs.get(id).map(|doc| doc.version);
        if current != expected_version {
            return Ok(CasResult::Conflict);
        }
        let version = current.map_or(1, |v| v + 1);
        docs.insert(id.to_string(), Versioned { version, body });
        Ok(CasResult::Success { version })
    }
}
