use crate::entity::{EntityKind, MASTER_SEQUENCE};
use crate::models::{Company, CompanyId, CompanyStatusUpdate, Credentials};
use crate::sync::models::{ReconcileReport, ReconcileTarget};
use crate::sync::reconcile::{RecordDiff, record_key};
use crate::sync::traits::{BackendStore, ListQuery};
use crate::sync::watermark::record_alter_id;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Backend operations that can be made to fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    ListCompanies,
    MasterMapping,
    ListEntityRecords,
    UpdateCompanyStatus,
    Reconcile,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Injected {
    Backend,
    Unauthorized,
}

#[derive(Default)]
struct Inner {
    companies: Vec<Company>,
    mappings: HashMap<CompanyId, Value>,
    stored: HashMap<(CompanyId, EntityKind), Vec<Value>>,
    source: HashMap<(CompanyId, EntityKind), Vec<Value>>,
    failures: HashMap<Operation, Injected>,
    failing_reconcile: HashSet<EntityKind>,
    status_updates: Vec<(CompanyId, CompanyStatusUpdate)>,
    reconcile_calls: Vec<(CompanyId, ReconcileTarget)>,
    list_calls: usize,
}

/// In-memory `BackendStore` for local development and unit tests.
///
/// - `master_mapping` answers with an explicitly set document, or derives one from stored
///   records.
/// - `reconcile` diffs the configured source records against stored ones and copies missing
///   or newer source records into storage.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, op: Operation) -> Result<()> {
        match self.lock().failures.get(&op) {
            None => Ok(()),
            Some(Injected::Backend) => Err(Error::BackendMessage(format!(
                "injected failure for {op:?}"
            ))),
            Some(Injected::Unauthorized) => {
                Err(Error::Unauthorized("403 Forbidden".to_string()))
            }
        }
    }

    pub fn with_companies(self, companies: Vec<Company>) -> Self {
        self.lock().companies = companies;
        self
    }

    pub fn add_company(&self, company: Company) {
        self.lock().companies.push(company);
    }

    pub fn company(&self, id: CompanyId) -> Option<Company> {
        self.lock().companies.iter().find(|c| c.id == id).cloned()
    }

    pub fn set_master_mapping(&self, company_id: CompanyId, doc: Value) {
        self.lock().mappings.insert(company_id, doc);
    }

    pub fn insert_records(&self, company_id: CompanyId, entity: EntityKind, records: Vec<Value>) {
        self.lock()
            .stored
            .entry((company_id, entity))
            .or_default()
            .extend(records);
    }

    pub fn records(&self, company_id: CompanyId, entity: EntityKind) -> Vec<Value> {
        self.lock()
            .stored
            .get(&(company_id, entity))
            .cloned()
            .unwrap_or_default()
    }

    /// Records the source system holds; consulted by `reconcile`.
    pub fn set_source_records(&self, company_id: CompanyId, entity: EntityKind, records: Vec<Value>) {
        self.lock().source.insert((company_id, entity), records);
    }

    pub fn fail(&self, op: Operation) {
        self.lock().failures.insert(op, Injected::Backend);
    }

    pub fn fail_unauthorized(&self, op: Operation) {
        self.lock().failures.insert(op, Injected::Unauthorized);
    }

    pub fn recover(&self, op: Operation) {
        self.lock().failures.remove(&op);
    }

    pub fn fail_reconcile_for(&self, entity: EntityKind) {
        self.lock().failing_reconcile.insert(entity);
    }

    pub fn status_updates(&self) -> Vec<(CompanyId, CompanyStatusUpdate)> {
        self.lock().status_updates.clone()
    }

    pub fn reconcile_calls(&self) -> Vec<(CompanyId, ReconcileTarget)> {
        self.lock().reconcile_calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    fn reconcile_entity(&self, company_id: CompanyId, entity: EntityKind) -> Result<RecordDiff> {
        let mut inner = self.lock();
        if inner.failing_reconcile.contains(&entity) {
            return Err(Error::BackendMessage(format!(
                "reconcile failed for {entity}"
            )));
        }
        let source = inner
            .source
            .get(&(company_id, entity))
            .cloned()
            .unwrap_or_default();
        let stored = inner.stored.entry((company_id, entity)).or_default();
        let diff = RecordDiff::compute(&source, stored.as_slice());

        // Heal: insert missing records, replace ones the source has newer versions of.
        for record in source {
            let Some(key) = record_key(&record) else {
                continue;
            };
            let pos = stored
                .iter()
                .position(|r| record_key(r).as_deref() == Some(key.as_str()));
            match pos {
                Some(i) => {
                    if record_alter_id(&record).unwrap_or(0) > record_alter_id(&stored[i]).unwrap_or(0)
                    {
                        stored[i] = record;
                    }
                }
                None => stored.push(record),
            }
        }
        Ok(diff)
    }
}

#[async_trait]
impl BackendStore for MemoryBackend {
    async fn list_companies(&self, _credentials: &Credentials) -> Result<Vec<Company>> {
        self.check(Operation::ListCompanies)?;
        Ok(self.lock().companies.clone())
    }

    async fn master_mapping(
        &self,
        company_id: CompanyId,
        _credentials: &Credentials,
    ) -> Result<Value> {
        self.check(Operation::MasterMapping)?;
        let inner = self.lock();
        if let Some(doc) = inner.mappings.get(&company_id) {
            return Ok(doc.clone());
        }
        let mut masters = Map::new();
        for kind in MASTER_SEQUENCE {
            let max = inner
                .stored
                .get(&(company_id, kind))
                .map(|rs| rs.iter().filter_map(record_alter_id).max().unwrap_or(0))
                .unwrap_or(0);
            masters.insert(kind.mapping_key().to_string(), Value::from(max));
        }
        Ok(serde_json::json!({ "masters": masters }))
    }

    async fn list_entity_records(
        &self,
        company_id: CompanyId,
        entity: EntityKind,
        query: ListQuery,
        _credentials: &Credentials,
    ) -> Result<Vec<Value>> {
        self.check(Operation::ListEntityRecords)?;
        let mut inner = self.lock();
        inner.list_calls += 1;
        Ok(inner
            .stored
            .get(&(company_id, entity))
            .map(|rs| rs.iter().skip(query.offset).take(query.limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_company_status(
        &self,
        company_id: CompanyId,
        update: &CompanyStatusUpdate,
        _credentials: &Credentials,
    ) -> Result<()> {
        self.check(Operation::UpdateCompanyStatus)?;
        let mut inner = self.lock();
        let Some(company) = inner.companies.iter_mut().find(|c| c.id == company_id) else {
            return Err(Error::NotFound(format!("company {company_id}")));
        };
        company.sync_status = update.sync_status;
        if update.last_sync_date.is_some() {
            company.last_sync_date = update.last_sync_date;
        }
        inner.status_updates.push((company_id, update.clone()));
        Ok(())
    }

    async fn reconcile(
        &self,
        company_id: CompanyId,
        target: ReconcileTarget,
        _credentials: &Credentials,
    ) -> Result<ReconcileReport> {
        self.check(Operation::Reconcile)?;
        self.lock().reconcile_calls.push((company_id, target));
        match target {
            ReconcileTarget::Entity(entity) => {
                Ok(self.reconcile_entity(company_id, entity)?.into_report())
            }
            ReconcileTarget::All => {
                let (mut total_missing, mut total_updated, mut total_synced) = (0, 0, 0);
                for kind in MASTER_SEQUENCE {
                    let diff = self.reconcile_entity(company_id, kind)?;
                    total_missing += diff.missing;
                    total_updated += diff.updated;
                    total_synced += diff.missing + diff.updated;
                }
                Ok(ReconcileReport::Aggregate {
                    total_missing,
                    total_updated,
                    total_synced,
                })
            }
        }
    }
}
