use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::automation::jobs::JobOutcome;
use crate::errors::{AutomationError, Result};

/// Fixed first segment of every synthetic billing account id.
pub const SYNTHETIC_ACCOUNT_PREFIX: &str = "AUTO00";

// ── Manager ───────────────────────────────────────────────────────────

/// Persisted node of the manager state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManagerStage {
    Pending,
    Writing,
    WaitToVerifyRowCount,
    VerifyingRowCount,
    Notifying,
    Cleanup,
    Done,
    Failed,
}

impl ManagerStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Writing => "writing",
            Self::WaitToVerifyRowCount => "wait_to_verify_row_count",
            Self::VerifyingRowCount => "verifying_row_count",
            Self::Notifying => "notifying",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// `Done` and `Failed` only change through a new orchestration.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for ManagerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "writing" => Ok(Self::Writing),
            "wait_to_verify_row_count" => Ok(Self::WaitToVerifyRowCount),
            "verifying_row_count" => Ok(Self::VerifyingRowCount),
            "notifying" => Ok(Self::Notifying),
            "cleanup" => Ok(Self::Cleanup),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerState {
    pub running: bool,
    pub iteration: i64,
    pub version: i64,
    pub ttl: Option<DateTime<Utc>>,
    pub stage: ManagerStage,
}

impl ManagerState {
    /// Idle manager left behind after a teardown.
    pub fn idle(version: i64) -> Self {
        Self {
            running: false,
            iteration: 0,
            version,
            ttl: None,
            stage: ManagerStage::Done,
        }
    }

    /// Manager reset performed by a fresh orchestration.
    pub fn pending(version: i64) -> Self {
        Self {
            running: true,
            iteration: 0,
            version,
            ttl: None,
            stage: ManagerStage::Pending,
        }
    }

    /// True while another invocation holds the step and its ttl has not lapsed.
    pub fn is_busy(&self, now: DateTime<Utc>) -> bool {
        self.running && self.ttl.is_some_and(|ttl| ttl > now)
    }
}

// ── Orchestration run ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationRun {
    pub version: i64,
    pub num_synthetic_accounts: u32,
    /// Rows per hour.
    pub min_throughput: i64,
    /// Rows per hour.
    pub max_throughput: i64,
    pub write_deadline: Option<DateTime<Utc>>,
    pub verify_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OrchestrationRun {
    /// Placeholder document kept between runs so the version survives teardown.
    pub fn placeholder(version: i64, now: DateTime<Utc>) -> Self {
        Self {
            version,
            num_synthetic_accounts: 0,
            min_throughput: 0,
            max_throughput: 0,
            write_deadline: None,
            verify_after: None,
            created_at: now,
        }
    }

    pub fn write_phase_over(&self, now: DateTime<Utc>) -> bool {
        self.write_deadline.is_none_or(|deadline| deadline <= now)
    }

    pub fn verification_due(&self, now: DateTime<Utc>) -> bool {
        self.verify_after.is_none_or(|after| after <= now)
    }

    pub fn synthetic_accounts(&self) -> Vec<String> {
        (0..self.num_synthetic_accounts)
            .map(|index| synthetic_account_id(self.version, index))
            .collect()
    }
}

/// Deterministic synthetic billing account id, shaped like a real one.
pub fn synthetic_account_id(version: i64, index: u32) -> String {
    format!(
        "{}-{:06X}-{:06X}",
        SYNTHETIC_ACCOUNT_PREFIX,
        version & 0xFF_FFFF,
        index & 0xFF_FFFF
    )
}

/// Ephemeral target table owned by one synthetic account.
pub fn target_table_name(prefix: &str, account_id: &str) -> String {
    format!("{}_{}", prefix, account_id.replace('-', "_").to_lowercase())
}

// ── Tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrittenRows {
    pub expected: i64,
    pub from_customer_copy: i64,
    pub from_local_copy: i64,
    pub from_unified_copy: i64,
}

impl WrittenRows {
    pub fn converged(&self) -> bool {
        self.expected == self.from_customer_copy
            && self.expected == self.from_local_copy
            && self.expected == self.from_unified_copy
    }

    pub fn verdict(&self) -> &'static str {
        if self.converged() { "PASSED" } else { "FAILED" }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskState {
    pub account_id: String,
    pub active: bool,
    pub running: bool,
    pub iteration: i64,
    pub version: i64,
    pub verified: bool,
    pub worker_identity_id: String,
    pub target_table: String,
    pub rows_per_hour: i64,
    pub rows_per_iteration: i64,
    pub written_rows: WrittenRows,
    pub job_id: Option<String>,
    pub last_outcome: Option<JobOutcome>,
    pub start_time: Option<DateTime<Utc>>,
    pub job_timeout: Option<DateTime<Utc>>,
    pub ttl: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn new(
        account_id: &str,
        version: i64,
        worker_identity_id: &str,
        target_table: &str,
        rows_per_hour: i64,
        rows_per_iteration: i64,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            active: true,
            running: false,
            iteration: 0,
            version,
            verified: false,
            worker_identity_id: worker_identity_id.to_string(),
            target_table: target_table.to_string(),
            rows_per_hour,
            rows_per_iteration,
            written_rows: WrittenRows::default(),
            job_id: None,
            last_outcome: None,
            start_time: None,
            job_timeout: None,
            ttl: None,
        }
    }

    /// A `running` flag whose ttl already lapsed belongs to a hung execution.
    pub fn is_hung(&self, now: DateTime<Utc>) -> bool {
        self.running && self.ttl.is_none_or(|ttl| ttl <= now)
    }
}

// ── Worker identities ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerIdentity {
    pub id: String,
    pub bound_accounts: Vec<String>,
    pub is_full: bool,
}

impl WorkerIdentity {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            bound_accounts: Vec::new(),
            is_full: false,
        }
    }

    /// Bind `account_id`, marking the identity full exactly when `capacity` is reached.
    /// Binding an account that is already bound is a no-op.
    pub fn bind(&mut self, account_id: &str, capacity: usize) -> Result<()> {
        if self.bound_accounts.iter().any(|a| a == account_id) {
            return Ok(());
        }
        if self.is_full || self.bound_accounts.len() >= capacity {
            return Err(AutomationError::IdentityFull {
                identity: self.id.clone(),
            });
        }
        self.bound_accounts.push(account_id.to_string());
        if self.bound_accounts.len() >= capacity {
            self.is_full = true;
        }
        Ok(())
    }
}

// ── Requests ──────────────────────────────────────────────────────────

/// One task execution request, as carried by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRequest {
    #[serde(rename = "billingAccountID")]
    pub billing_account_id: String,
    pub iteration: i64,
    pub version: i64,
}

/// Wire shape of `POST /automation/task`; every field is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskRequestBody {
    #[serde(rename = "billingAccountID")]
    pub billing_account_id: Option<String>,
    pub iteration: Option<i64>,
    pub version: Option<i64>,
}

impl TaskRequestBody {
    pub fn validate(self) -> Result<TaskRequest> {
        let billing_account_id = self
            .billing_account_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| missing("billingAccountID"))?;
        let iteration = positive("iteration", self.iteration)?;
        let version = positive("version", self.version)?;
        Ok(TaskRequest {
            billing_account_id,
            iteration,
            version,
        })
    }
}

/// Wire shape of `POST /automation/orchestration`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrchestrationBody {
    pub duration_in_minutes: Option<i64>,
    pub num_of_dummy_users: Option<i64>,
    pub min_num_of_kilo_rows_per_hour: Option<i64>,
    pub max_num_of_kilo_rows_per_hour: Option<i64>,
}

/// Longest accepted write phase: one year.
pub const MAX_DURATION_MINUTES: i64 = 366 * 24 * 60;
/// Largest accepted per-account throughput, in thousands of rows per hour.
pub const MAX_KILO_ROWS_PER_HOUR: i64 = 1_000_000_000;

/// Validated orchestration parameters; throughput already in rows per hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestrationParams {
    pub duration_minutes: i64,
    pub num_synthetic_accounts: u32,
    pub min_rows_per_hour: i64,
    pub max_rows_per_hour: i64,
}

impl CreateOrchestrationBody {
    pub fn validate(self) -> Result<OrchestrationParams> {
        let duration_minutes = positive("durationInMinutes", self.duration_in_minutes)?;
        at_most("durationInMinutes", duration_minutes, MAX_DURATION_MINUTES)?;
        let users = positive("numOfDummyUsers", self.num_of_dummy_users)?;
        let min_kilo = positive("minNumOfKiloRowsPerHour", self.min_num_of_kilo_rows_per_hour)?;
        at_most("minNumOfKiloRowsPerHour", min_kilo, MAX_KILO_ROWS_PER_HOUR)?;
        let max_kilo = self.max_num_of_kilo_rows_per_hour.unwrap_or(min_kilo);
        at_most("maxNumOfKiloRowsPerHour", max_kilo, MAX_KILO_ROWS_PER_HOUR)?;
        if max_kilo < min_kilo {
            return Err(AutomationError::InvalidRequest(format!(
                "maxNumOfKiloRowsPerHour ({}) is lower than minNumOfKiloRowsPerHour ({})",
                max_kilo, min_kilo
            )));
        }
        let num_synthetic_accounts = u32::try_from(users).map_err(|_| {
            AutomationError::InvalidRequest(format!("numOfDummyUsers {} is too large", users))
        })?;
        Ok(OrchestrationParams {
            duration_minutes,
            num_synthetic_accounts,
            min_rows_per_hour: kilo_rows(min_kilo)?,
            max_rows_per_hour: kilo_rows(max_kilo)?,
        })
    }
}

fn missing(field: &str) -> AutomationError {
    AutomationError::InvalidRequest(format!("missing required field {}", field))
}

fn at_most(field: &str, value: i64, max: i64) -> Result<()> {
    if value > max {
        return Err(AutomationError::InvalidRequest(format!(
            "{} {} exceeds the maximum of {}",
            field, value, max
        )));
    }
    Ok(())
}

fn kilo_rows(kilo: i64) -> Result<i64> {
    kilo.checked_mul(1000).ok_or_else(|| {
        AutomationError::InvalidRequest(format!("{} thousand rows per hour is out of range", kilo))
    })
}

fn positive(field: &str, value: Option<i64>) -> Result<i64> {
    match value {
        None => Err(missing(field)),
        Some(v) if v <= 0 => Err(AutomationError::InvalidRequest(format!(
            "{} must be greater than 0",
            field
        ))),
        Some(v) => Ok(v),
    }
}
