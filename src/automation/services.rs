//! Contracts for the warehouse-side collaborators.
//!
//! The engine never talks to a concrete warehouse; it only sees these traits.
//! `simulated` provides an in-process implementation of all of them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// One of the three storage representations rows converge into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    CustomerCopy,
    LocalCopy,
    UnifiedCopy,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Self::CustomerCopy, Self::LocalCopy, Self::UnifiedCopy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerCopy => "customer_copy",
            Self::LocalCopy => "local_copy",
            Self::UnifiedCopy => "unified_copy",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts rows for one backend.
#[async_trait]
pub trait RowCounter: Send + Sync {
    async fn count_rows(
        &self,
        account_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64>;
}

/// Row-count query service: one counter per backend.
#[derive(Clone)]
pub struct RowCountService {
    customer: Arc<dyn RowCounter>,
    local: Arc<dyn RowCounter>,
    unified: Arc<dyn RowCounter>,
}

impl RowCountService {
    pub fn new(
        customer: Arc<dyn RowCounter>,
        local: Arc<dyn RowCounter>,
        unified: Arc<dyn RowCounter>,
    ) -> Self {
        Self {
            customer,
            local,
            unified,
        }
    }

    pub async fn count_rows(
        &self,
        backend: Backend,
        account_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let counter = match backend {
            Backend::CustomerCopy => &self.customer,
            Backend::LocalCopy => &self.local,
            Backend::UnifiedCopy => &self.unified,
        };
        counter.count_rows(account_id, from, to).await
    }
}

#[async_trait]
pub trait TableProvisioner: Send + Sync {
    /// Creating a table that already exists is not an error.
    async fn create_table(&self, name: &str, schema_template: &str) -> Result<()>;

    /// Deleting a missing table is not an error.
    async fn delete_table(&self, name: &str) -> Result<()>;

    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Side effects on the ingestion pipeline that feeds the local and unified copies.
#[async_trait]
pub trait IngestionPipeline: Send + Sync {
    /// Drop per-backend write-progress counters left by earlier runs.
    async fn purge_write_progress(&self) -> Result<()>;

    /// Start mirroring `account_id`'s table into the pipeline.
    async fn onboard(&self, account_id: &str, table: &str) -> Result<()>;

    async fn offboard(&self, account_id: &str) -> Result<()>;
}

/// External API that creates the credentials worker identities stand for.
#[async_trait]
pub trait IdentityProvisioner: Send + Sync {
    async fn create_identity(&self, id: &str) -> Result<()>;

    /// Deleting a missing identity is not an error.
    async fn delete_identity(&self, id: &str) -> Result<()>;

    async fn list_identities(&self, prefix: &str) -> Result<Vec<String>>;

    async fn grant_baseline_permissions(&self, ids: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(i64);

    #[async_trait]
    impl RowCounter for Fixed {
        async fn count_rows(&self, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<i64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn row_count_service_routes_by_backend() {
        let service = RowCountService::new(Arc::new(Fixed(1)), Arc::new(Fixed(2)), Arc::new(Fixed(3)));
        let now = Utc::now();
        let mut counts = Vec::new();
        for backend in Backend::ALL {
            counts.push(service.count_rows(backend, "A", now, now).await.unwrap());
        }
        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[test]
    fn backend_names() {
        assert_eq!(Backend::UnifiedCopy.to_string(), "unified_copy");
    }
}
