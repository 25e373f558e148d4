use crate::entity::EntityKind;
use crate::models::{CompanyId, SyncStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    Scheduled,
    CompanySpecific,
    Full,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Scheduled => "scheduled",
            SyncKind::CompanySpecific => "company-specific",
            SyncKind::Full => "full",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position inside the entity loop of one company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityProgress {
    pub company_id: CompanyId,
    pub entity_name: String,
    pub entity_index: usize,
    pub entity_count: usize,
    pub percentage: u8,
}

impl EntityProgress {
    pub fn new(
        company_id: CompanyId,
        entity: EntityKind,
        entity_index: usize,
        entity_count: usize,
    ) -> Self {
        Self {
            company_id,
            entity_name: entity.as_str().to_string(),
            entity_index,
            entity_count,
            percentage: step_percentage(entity_index, entity_count),
        }
    }
}

/// Percentage reported after finishing step `index` (0-based) of `total`.
pub fn step_percentage(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = (index + 1).min(total) as f64;
    (100.0 * done / total as f64).round() as u8
}

/// The process-wide sync session. At most one is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: Uuid,
    pub kind: SyncKind,
    pub total_units: usize,
    pub current_index: usize,
    pub current_label: String,
    pub entity_progress: Option<EntityProgress>,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

impl SyncSession {
    pub fn new(kind: SyncKind, total_units: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            total_units,
            current_index: 0,
            current_label: String::new(),
            entity_progress: None,
            active: true,
            started_at: Utc::now(),
        }
    }
}

/// A start request that arrived while another session was running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub kind: SyncKind,
    pub total_units: usize,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub kind: SyncKind,
    pub success: bool,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub completed_units: usize,
    pub total_units: usize,
}

/// Events published by the sync state manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    #[serde(rename = "sync-started")]
    Started { session: SyncSession },
    #[serde(rename = "sync-progress")]
    Progress { session: SyncSession },
    #[serde(rename = "sync-ended")]
    Ended { record: SessionRecord },
    #[serde(rename = "queue-updated")]
    QueueUpdated {
        queue_size: usize,
        dequeued: Option<QueueEntry>,
    },
}

/// Connector failures that must stop the current company immediately.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalKind {
    CompanyMismatch,
    ConcurrentSync,
    IntegrityViolation,
}

impl CriticalKind {
    /// Match a failure message against the known safety-critical patterns.
    pub fn classify(message: &str) -> Option<Self> {
        let m = message.to_ascii_lowercase();
        if m.contains("company mismatch") {
            Some(CriticalKind::CompanyMismatch)
        } else if m.contains("another sync") || m.contains("sync already in progress") {
            Some(CriticalKind::ConcurrentSync)
        } else if m.contains("integrity") {
            Some(CriticalKind::IntegrityViolation)
        } else {
            None
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CriticalKind::CompanyMismatch => {
                "the company open in Tally does not match the company being synced"
            }
            CriticalKind::ConcurrentSync => "another sync is already running against Tally",
            CriticalKind::IntegrityViolation => "the source data failed an integrity check",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The connector ran and reported failure.
    Rejected,
    /// Timeouts or transport errors that outlived the retry budget.
    Transient,
    Unauthorized,
    Critical(CriticalKind),
}

/// Result of one connector call for a (company, entity kind, watermark) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub entity: EntityKind,
    pub success: bool,
    pub count: u64,
    pub message: String,
    pub failure: Option<FailureKind>,
    pub last_alter_id: Option<u64>,
}

impl SyncOutcome {
    pub fn succeeded(
        entity: EntityKind,
        count: u64,
        message: impl Into<String>,
        last_alter_id: Option<u64>,
    ) -> Self {
        Self {
            entity,
            success: true,
            count,
            message: message.into(),
            failure: None,
            last_alter_id,
        }
    }

    pub fn failed(entity: EntityKind, failure: FailureKind, message: impl Into<String>) -> Self {
        Self {
            entity,
            success: false,
            count: 0,
            message: message.into(),
            failure: Some(failure),
            last_alter_id: None,
        }
    }

    pub fn critical(&self) -> Option<CriticalKind> {
        match self.failure {
            Some(FailureKind::Critical(kind)) => Some(kind),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.failure == Some(FailureKind::Unauthorized)
    }

    /// `Ledger: <message>` form used in failure summaries.
    pub fn summary_line(&self) -> String {
        format!("{}: {}", self.entity, self.message)
    }
}

/// Per-company result of a scheduled cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanySyncResult {
    pub company_id: CompanyId,
    pub company_name: String,
    pub success: bool,
    pub status: SyncStatus,
    pub succeeded: usize,
    pub attempted: usize,
    pub records: u64,
    pub errors: Vec<String>,
    pub critical: Option<CriticalKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    LicenseRejected(String),
    CompanyListingFailed(String),
    NoCompanies,
    Unauthorized(String),
    SessionBusy,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::LicenseRejected(msg) => write!(f, "license rejected: {msg}"),
            SkipReason::CompanyListingFailed(msg) => write!(f, "company listing failed: {msg}"),
            SkipReason::NoCompanies => f.write_str("no companies to sync"),
            SkipReason::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            SkipReason::SessionBusy => f.write_str("another sync session is active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub session_id: Uuid,
    pub success: bool,
    pub message: String,
    pub companies: Vec<CompanySyncResult>,
    /// Set when a 401/403 stopped the cycle before every company was attempted.
    pub stopped_unauthorized: bool,
    /// Set when a safety-critical connector failure stopped the cycle.
    pub critical: Option<CriticalAlert>,
}

impl CycleSummary {
    /// Whether the cycle ended before every company was attempted.
    pub fn halted(&self) -> bool {
        self.stopped_unauthorized || self.critical.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Completed(CycleSummary),
}

impl CycleOutcome {
    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            CycleOutcome::Skipped(reason) => Some(reason),
            CycleOutcome::Completed(_) => None,
        }
    }

    pub fn summary(&self) -> Option<&CycleSummary> {
        match self {
            CycleOutcome::Completed(summary) => Some(summary),
            CycleOutcome::Skipped(_) => None,
        }
    }
}

/// What `run_cycle` returns: the cycle outcome plus the deferred reconciliation task.
#[derive(Debug)]
pub struct CycleRun {
    pub outcome: CycleOutcome,
    pub reconciliation: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileTarget {
    Entity(EntityKind),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReconcileReport {
    #[serde(rename_all = "camelCase")]
    Entity {
        #[serde(default)]
        matched: u64,
        missing: u64,
        #[serde(default)]
        extra: u64,
        #[serde(default)]
        missing_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Aggregate {
        total_missing: u64,
        #[serde(default)]
        total_updated: u64,
        #[serde(default)]
        total_synced: u64,
    },
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        match self {
            ReconcileReport::Entity { missing, extra, .. } => *missing == 0 && *extra == 0,
            ReconcileReport::Aggregate {
                total_missing,
                total_updated,
                ..
            } => *total_missing == 0 && *total_updated == 0,
        }
    }
}

/// A safety-critical stop that a human has to see before syncing resumes.
#[must_use = "critical alerts must be acknowledged"]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalAlert {
    pub company_id: CompanyId,
    pub company_name: String,
    pub entity: EntityKind,
    pub kind: CriticalKind,
    pub message: String,
}

impl CriticalAlert {
    pub fn headline(&self) -> String {
        format!(
            "Sync stopped for '{}' at {}: {}",
            self.company_name,
            self.entity,
            self.kind.description()
        )
    }

    /// Record that a user has seen the alert.
    pub fn acknowledge(self) {
        tracing::info!(
            company_id = %self.company_id,
            entity = %self.entity,
            kind = ?self.kind,
            "critical sync alert acknowledged"
        );
    }
}

/// Result of a manual (company-specific or full) pipeline run for one company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub session_id: Uuid,
    pub company_id: CompanyId,
    pub company_name: String,
    pub status: SyncStatus,
    pub steps: Vec<SyncOutcome>,
    pub succeeded: usize,
    pub total_steps: usize,
    pub critical: Option<CriticalAlert>,
}

impl PipelineReport {
    pub fn failures(&self) -> impl Iterator<Item = &SyncOutcome> {
        self.steps.iter().filter(|s| !s.success)
    }
}
