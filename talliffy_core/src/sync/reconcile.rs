use crate::Result;
use crate::entity::{EntityKind, MASTER_SEQUENCE};
use crate::models::{Company, CompanyId, Credentials};
use crate::sync::models::{ReconcileReport, ReconcileTarget};
use crate::sync::state::SyncStateManager;
use crate::sync::traits::BackendStore;
use crate::sync::watermark::record_alter_id;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Comparison of source-of-truth records against stored records by unique identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDiff {
    pub matched: u64,
    pub missing: u64,
    pub extra: u64,
    /// Present on both sides, but the source carries a newer change sequence.
    pub updated: u64,
    pub missing_ids: Vec<String>,
}

impl RecordDiff {
    pub fn compute(source: &[Value], stored: &[Value]) -> Self {
        let stored_by_key: HashMap<String, &Value> = stored
            .iter()
            .filter_map(|r| record_key(r).map(|k| (k, r)))
            .collect();

        let mut diff = Self::default();
        let mut seen = 0usize;
        let mut source_keys = HashSet::new();
        for record in source {
            let Some(key) = record_key(record) else {
                continue;
            };
            if !source_keys.insert(key.clone()) {
                continue;
            }
            match stored_by_key.get(&key) {
                Some(existing) => {
                    diff.matched += 1;
                    seen += 1;
                    if record_alter_id(record).unwrap_or(0) > record_alter_id(existing).unwrap_or(0)
                    {
                        diff.updated += 1;
                    }
                }
                None => {
                    diff.missing += 1;
                    diff.missing_ids.push(key);
                }
            }
        }
        diff.extra = stored_by_key.len().saturating_sub(seen) as u64;
        diff
    }

    pub fn into_report(self) -> ReconcileReport {
        ReconcileReport::Entity {
            matched: self.matched,
            missing: self.missing,
            extra: self.extra,
            missing_ids: self.missing_ids,
        }
    }
}

fn field<'a>(record: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|n| record.get(*n))
        .filter(|v| !v.is_null())
}

fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Unique identifier of a record: `{masterId}_{guid}`, else the guid, else the name.
pub fn record_key(record: &Value) -> Option<String> {
    let guid = field(record, &["guid", "GUID", "Guid"]).and_then(scalar);
    let master = field(record, &["masterId", "masterID", "master_id", "MasterID"]).and_then(scalar);
    match (master, guid) {
        (Some(m), Some(g)) => Some(format!("{m}_{g}")),
        (None, Some(g)) => Some(g),
        _ => field(record, &["name", "Name"]).and_then(scalar),
    }
}

/// Per-company reconciliation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyReconciliation {
    pub company_id: CompanyId,
    pub reports: Vec<(EntityKind, ReconcileReport)>,
    pub failures: Vec<(EntityKind, String)>,
}

/// Follow-up pass asking the backend to heal drift between source and stored records.
pub struct Reconciler {
    backend: Arc<dyn BackendStore>,
    state: Arc<SyncStateManager>,
}

impl Reconciler {
    pub fn new(backend: Arc<dyn BackendStore>, state: Arc<SyncStateManager>) -> Self {
        Self { backend, state }
    }

    #[tracing::instrument(level = "info", skip(self, credentials))]
    pub async fn reconcile(
        &self,
        company_id: CompanyId,
        target: ReconcileTarget,
        credentials: &Credentials,
    ) -> Result<ReconcileReport> {
        let report = self.backend.reconcile(company_id, target, credentials).await?;
        if report.is_clean() {
            tracing::debug!(?report, "reconciliation found no drift");
        } else {
            tracing::info!(?report, "reconciliation healed drift");
        }
        Ok(report)
    }

    /// Reconcile every master kind of one company. Failures are logged and collected.
    #[tracing::instrument(level = "info", skip(self, credentials))]
    pub async fn reconcile_company(
        &self,
        company_id: CompanyId,
        credentials: &Credentials,
    ) -> CompanyReconciliation {
        let mut out = CompanyReconciliation {
            company_id,
            reports: Vec::new(),
            failures: Vec::new(),
        };
        for kind in MASTER_SEQUENCE {
            match self
                .reconcile(company_id, ReconcileTarget::Entity(kind), credentials)
                .await
            {
                Ok(report) => out.reports.push((kind, report)),
                Err(e) => {
                    tracing::warn!(%company_id, entity = %kind, error = %e, "reconciliation failed");
                    out.failures.push((kind, e.to_string()));
                }
            }
        }
        out
    }

    /// Reconcile each company in turn. Stops early once a new sync session starts.
    #[tracing::instrument(level = "info", skip_all, fields(companies = companies.len()))]
    pub async fn reconcile_companies(
        &self,
        companies: &[Company],
        credentials: &Credentials,
    ) -> Vec<CompanyReconciliation> {
        let mut out = Vec::with_capacity(companies.len());
        for company in companies {
            if self.state.is_active() {
                tracing::info!(
                    remaining = companies.len() - out.len(),
                    "sync session started; yielding reconciliation"
                );
                break;
            }
            out.push(self.reconcile_company(company.id, credentials).await);
        }
        out
    }
}
