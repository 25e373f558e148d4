use crate::entity::EntityKind;
use crate::models::{Company, CompanyId, CompanyStatusUpdate, ConnectionParams, Credentials};
use crate::sync::models::{ReconcileReport, ReconcileTarget};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Paging for collection reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
}

/// The backend data store.
///
/// Implementations map HTTP 401/403 to `Error::Unauthorized`; every other transport or
/// server failure should surface as `Error::Backend`/`Error::BackendMessage` so callers can
/// tell transient failures apart.
#[async_trait]
pub trait BackendStore: Send + Sync {
    async fn list_companies(&self, credentials: &Credentials) -> Result<Vec<Company>>;

    /// Raw master-mapping document (`{"masters": {"ledger": 120, ...}}`). Validation of the
    /// shape belongs to the watermark resolver.
    async fn master_mapping(
        &self,
        company_id: CompanyId,
        credentials: &Credentials,
    ) -> Result<serde_json::Value>;

    /// Stored records of one entity kind, paged.
    async fn list_entity_records(
        &self,
        company_id: CompanyId,
        entity: EntityKind,
        query: ListQuery,
        credentials: &Credentials,
    ) -> Result<Vec<serde_json::Value>>;

    async fn update_company_status(
        &self,
        company_id: CompanyId,
        update: &CompanyStatusUpdate,
        credentials: &Credentials,
    ) -> Result<()>;

    /// Ask the backend to compare source and stored records and heal the difference.
    async fn reconcile(
        &self,
        company_id: CompanyId,
        target: ReconcileTarget,
        credentials: &Credentials,
    ) -> Result<ReconcileReport>;
}

/// Arguments for one incremental connector call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySyncRequest {
    pub company_id: CompanyId,
    #[serde(rename = "entityType")]
    pub entity: EntityKind,
    pub watermark: u64,
    pub connection_params: ConnectionParams,
    pub credentials: Credentials,
}

/// What the connector reports back for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorReport {
    pub success: bool,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "lastAlterID", alias = "last_alter_id")]
    pub last_alter_id: Option<u64>,
}

/// The source-system connector. Its parsing internals are opaque; it honors the delta
/// contract (only records with a change sequence above `watermark` are sent).
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn sync_entity(&self, request: &EntitySyncRequest) -> Result<ConnectorReport>;

    /// License number of the running source system, if it can tell.
    async fn fetch_license(&self, connection: &ConnectionParams) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseCheck {
    pub valid: bool,
    pub message: String,
    pub source_license: Option<String>,
}

impl LicenseCheck {
    pub fn valid(message: impl Into<String>, source_license: Option<String>) -> Self {
        Self {
            valid: true,
            message: message.into(),
            source_license,
        }
    }

    pub fn invalid(message: impl Into<String>, source_license: Option<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
            source_license,
        }
    }
}

/// Gate consulted before a scheduled cycle touches the backend or the connector.
#[async_trait]
pub trait LicenseGate: Send + Sync {
    async fn validate(&self, credentials: &Credentials) -> Result<LicenseCheck>;
}
