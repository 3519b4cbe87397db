//! Typed error hierarchy for the automation engine.
//!
//! One enum covers the whole subsystem so that stage handlers, the task
//! executor and the HTTP layer can match on the same variants:
//! - store failures (`NotFound`, `TransactionConflict`, `Storage`, `Serialization`)
//! - business-rule rejections raised inside transactions
//! - fatal orchestration errors (`VersionMismatch`, `ProductionEnvironment`)
//! - collaborator failures (job runner, row counts, tables, notifications)

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutomationError>;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Document {key} not found")]
    NotFound { key: String },

    #[error("Transaction on {key} aborted after {attempts} conflicting attempts")]
    TransactionConflict { key: String, attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Failed to (de)serialize document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("There are no more available worker identities")]
    NoAvailableIdentity,

    #[error("Worker identity {identity} is full")]
    IdentityFull { identity: String },

    #[error("Invalid metadata version: expected {orchestration} but found {manager}")]
    VersionMismatch { orchestration: i64, manager: i64 },

    #[error("Unable to run automation in environment {environment}")]
    ProductionEnvironment { environment: String },

    #[error("an older orchestration will run for other {remaining}")]
    OrchestrationStillRunning { remaining: String },

    #[error("No orchestration run exists")]
    MissingOrchestration,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{service} failed: {source}")]
    Collaborator {
        service: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl AutomationError {
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }

    pub fn collaborator(service: &'static str, err: impl Into<anyhow::Error>) -> Self {
        Self::Collaborator {
            service,
            source: err.into(),
        }
    }

    /// Errors that abort a whole `RunAutomation` invocation and leave the
    /// persisted state for manual investigation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch { .. } | Self::ProductionEnvironment { .. } | Self::MissingOrchestration
        )
    }
}

/// Render a `chrono::Duration` the way operators read it in logs, e.g. `1h2m3s`.
pub fn human_duration(d: chrono::Duration) -> String {
    let total = d.num_seconds().max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}
