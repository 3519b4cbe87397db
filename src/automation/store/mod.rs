//! Pluggable document storage for automation metadata.
//!
//! [`DocumentStore`] is the raw contract: versioned JSON documents grouped in
//! collections, with a single compare-and-put write primitive. Everything the
//! engine persists goes through [`Metadata`], which layers typed accessors
//! and the bounded-retry read-modify-write transaction on top of it.
//!
//! | Backend  | Module     | Use                                |
//! |----------|------------|------------------------------------|
//! | memory   | `memory`   | tests and single-process dev runs  |
//! | sqlite   | `sqlite`   | durable local deployments          |

pub mod memory;
pub mod metadata;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Result;

pub use memory::InMemoryStore;
pub use metadata::{DEFAULT_MAX_ATTEMPTS, Metadata};
pub use sqlite::SqliteStore;

pub const MANAGER_COLLECTION: &str = "automation_manager";
pub const TASKS_COLLECTION: &str = "automation_tasks";
pub const IDENTITIES_COLLECTION: &str = "worker_identities";

const MANAGER_DOC: &str = "manager";
const ORCHESTRATION_DOC: &str = "orchestration";

/// Address of one metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocKey {
    Manager,
    Orchestration,
    Task(String),
    Identity(String),
}

impl DocKey {
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Manager | Self::Orchestration => MANAGER_COLLECTION,
            Self::Task(_) => TASKS_COLLECTION,
            Self::Identity(_) => IDENTITIES_COLLECTION,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Manager => MANAGER_DOC,
            Self::Orchestration => ORCHESTRATION_DOC,
            Self::Task(id) | Self::Identity(id) => id,
        }
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection(), self.id())
    }
}

/// A stored document body together with its write version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub version: u64,
    pub body: Value,
}

/// Result of a compare-and-put write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    /// Written; carries the new document version.
    Success { version: u64 },
    /// The stored version no longer matches what the writer read.
    Conflict,
}

/// Storage abstraction for metadata documents.
///
/// `compare_and_put` is the only primitive that may overwrite a document and
/// is what makes optimistic transactions possible: a writer passes the version
/// it read (`None` when it saw no document) and the write is refused if
/// anybody else wrote in between.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Versioned>>;

    /// All documents of a collection, ordered by id.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Versioned)>>;

    /// Insert a document. Returns `false` when it already existed.
    async fn create(&self, collection: &str, id: &str, body: Value) -> Result<bool>;

    /// Delete a document; deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn compare_and_put(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
        body: Value,
    ) -> Result<CasResult>;
}
