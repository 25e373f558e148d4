//! Talliffy core library: models, configuration and the sync orchestration engine.

pub mod config;
pub mod entity;
pub mod error;
pub mod models;
pub mod o11y;
pub mod sync;

pub use config::{FetchPolicy, SyncConfig};
pub use entity::{EntityKind, FULL_SEQUENCE, MASTER_SEQUENCE};
pub use error::{Error, Result};
pub use models::{
    Company, CompanyId, CompanyStatusUpdate, ConnectionParams, Credentials, SyncStatus,
};
pub use sync::models::{
    CriticalAlert, CriticalKind, CycleOutcome, EntityProgress, FailureKind, PipelineReport,
    ReconcileReport, ReconcileTarget, SessionRecord, SkipReason, SyncEvent, SyncKind,
    SyncOutcome, SyncSession,
};
pub use sync::state::{Subscription, SyncStateManager};
pub use sync::traits::{BackendStore, LicenseCheck, LicenseGate, ListQuery, SourceConnector};
