use crate::Result;
use crate::entity::{EntityKind, MASTER_SEQUENCE};
use crate::models::{CompanyId, Credentials};
use crate::sync::reconcile::record_key;
use crate::sync::traits::{BackendStore, ListQuery};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Field names the backend has used for the change sequence number.
const ALTER_ID_FIELDS: [&str; 6] = ["alterId", "alterID", "alter_id", "AlterID", "ALTERID", "alterid"];

/// Highest seen change sequence per entity kind for one company. Missing kinds read as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermarks(HashMap<EntityKind, u64>);

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn set(&mut self, kind: EntityKind, value: u64) {
        self.0.insert(kind, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityKind, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// Parse a master-mapping document. Accepts `{"masters": {..}}` or a bare object with at
    /// least one recognised key. Returns `None` when any recognised key carries something
    /// other than a non-negative integer.
    pub fn from_mapping(doc: &Value) -> Option<Self> {
        let obj = match doc.get("masters") {
            Some(Value::Object(m)) => m,
            Some(_) => return None,
            None => {
                let m = doc.as_object()?;
                if !m.keys().any(|k| EntityKind::from_mapping_key(k).is_some()) {
                    return None;
                }
                m
            }
        };

        let mut out = Self::new();
        for (key, value) in obj {
            let Some(kind) = EntityKind::from_mapping_key(key) else {
                continue;
            };
            out.set(kind, as_sequence(value)?);
        }
        Some(out)
    }
}

fn as_sequence(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Change sequence of one stored record, looked up across the known field spellings.
pub fn record_alter_id(record: &Value) -> Option<u64> {
    ALTER_ID_FIELDS
        .iter()
        .find_map(|field| record.get(*field).and_then(as_sequence))
}

/// Computes per-entity watermarks for a company.
///
/// One batched mapping lookup first; on failure or a malformed answer, a paged scan of every
/// master collection taking the maximum change sequence client-side.
pub struct WatermarkResolver {
    backend: Arc<dyn BackendStore>,
    page_size: usize,
    max_scan_records: usize,
}

impl WatermarkResolver {
    pub fn new(backend: Arc<dyn BackendStore>, page_size: usize, max_scan_records: usize) -> Self {
        Self {
            backend,
            page_size: page_size.max(1),
            max_scan_records,
        }
    }

    #[tracing::instrument(level = "info", skip(self, credentials))]
    pub async fn resolve(&self, company_id: CompanyId, credentials: &Credentials) -> Watermarks {
        match self.backend.master_mapping(company_id, credentials).await {
            Ok(doc) => match Watermarks::from_mapping(&doc) {
                Some(marks) => return marks,
                None => {
                    tracing::warn!(%company_id, "malformed master mapping; scanning collections")
                }
            },
            Err(e) => {
                tracing::warn!(%company_id, error = %e, "master mapping lookup failed; scanning collections")
            }
        }
        self.scan_all(company_id, credentials).await
    }

    async fn scan_all(&self, company_id: CompanyId, credentials: &Credentials) -> Watermarks {
        let mut marks = Watermarks::new();
        for kind in MASTER_SEQUENCE {
            let value = match self.scan_entity(company_id, kind, credentials).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(%company_id, entity = %kind, error = %e, "watermark scan failed; using 0");
                    0
                }
            };
            marks.set(kind, value);
        }
        marks
    }

    /// Page through one collection. Backends that ignore paging answer every request with
    /// the whole collection; an oversized page or a page that restarts at the previous
    /// page's first record ends the scan.
    #[tracing::instrument(level = "debug", skip(self, credentials))]
    async fn scan_entity(
        &self,
        company_id: CompanyId,
        kind: EntityKind,
        credentials: &Credentials,
    ) -> Result<u64> {
        let mut max_seen = 0u64;
        let mut scanned = 0usize;
        let mut offset = 0usize;
        let mut previous_first: Option<String> = None;
        loop {
            let page = self
                .backend
                .list_entity_records(
                    company_id,
                    kind,
                    ListQuery {
                        limit: self.page_size,
                        offset,
                    },
                    credentials,
                )
                .await?;
            if page.is_empty() {
                break;
            }
            let first = page.first().and_then(record_key);
            if offset > 0 && first.is_some() && first == previous_first {
                tracing::debug!(%company_id, entity = %kind, offset, "backend repeated a page; paging ignored");
                break;
            }
            max_seen = page
                .iter()
                .filter_map(record_alter_id)
                .fold(max_seen, u64::max);
            scanned += page.len();
            if page.len() > self.page_size {
                tracing::debug!(%company_id, entity = %kind, records = page.len(), "backend returned the whole collection");
                break;
            }
            if page.len() < self.page_size {
                break;
            }
            if scanned >= self.max_scan_records {
                tracing::warn!(
                    %company_id,
                    entity = %kind,
                    scanned,
                    "watermark scan hit record cap; using max seen so far"
                );
                break;
            }
            previous_first = first;
            offset += page.len();
        }
        Ok(max_seen)
    }
}
