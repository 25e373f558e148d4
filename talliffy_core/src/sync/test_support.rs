#![cfg(test)]

use crate::entity::EntityKind;
use crate::models::{CompanyId, ConnectionParams, Credentials};
use crate::sync::traits::{
    ConnectorReport, EntitySyncRequest, LicenseCheck, LicenseGate, SourceConnector,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One scripted connector response.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Ok(u64),
    Fail(String),
    TransportError,
    Unauthorized,
    Hang,
}

/// Connector fake: replays scripted steps per (company, entity), succeeding with one record
/// once a script is exhausted or absent.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    scripts: Mutex<HashMap<(CompanyId, EntityKind), VecDeque<Step>>>,
    calls: Mutex<Vec<EntitySyncRequest>>,
    license: Mutex<Option<String>>,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(&self, company_id: CompanyId, entity: EntityKind, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert((company_id, entity), steps.into());
    }

    pub(crate) fn set_license(&self, license: Option<&str>) {
        *self.license.lock().unwrap() = license.map(str::to_string);
    }

    pub(crate) fn calls(&self) -> Vec<EntitySyncRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn entities_for(&self, company_id: CompanyId) -> Vec<EntityKind> {
        self.calls()
            .into_iter()
            .filter(|c| c.company_id == company_id)
            .map(|c| c.entity)
            .collect()
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    async fn sync_entity(&self, request: &EntitySyncRequest) -> Result<ConnectorReport> {
        self.calls.lock().unwrap().push(request.clone());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&(request.company_id, request.entity))
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Ok(1));
        match step {
            Step::Ok(count) => Ok(ConnectorReport {
                success: true,
                count,
                message: format!("{} synced", request.entity),
                last_alter_id: Some(request.watermark + count),
            }),
            Step::Fail(message) => Ok(ConnectorReport {
                success: false,
                count: 0,
                message,
                last_alter_id: None,
            }),
            Step::TransportError => Err(Error::BackendMessage("connection reset".to_string())),
            Step::Unauthorized => Err(Error::Unauthorized("401 Unauthorized".to_string())),
            Step::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn fetch_license(&self, _connection: &ConnectionParams) -> Result<Option<String>> {
        Ok(self.license.lock().unwrap().clone())
    }
}

/// License gate with a fixed answer that counts how often it was asked.
pub(crate) struct StaticLicense {
    valid: bool,
    checks: AtomicUsize,
}

impl StaticLicense {
    pub(crate) fn allow() -> Self {
        Self {
            valid: true,
            checks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn deny() -> Self {
        Self {
            valid: false,
            checks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LicenseGate for StaticLicense {
    async fn validate(&self, _credentials: &Credentials) -> Result<LicenseCheck> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(if self.valid {
            LicenseCheck::valid("license ok", Some("7123".to_string()))
        } else {
            LicenseCheck::invalid("license mismatch", Some("9999".to_string()))
        })
    }
}

pub(crate) fn creds() -> Credentials {
    Credentials::new("token", "device", "user-1").with_license_number("7123")
}

pub(crate) fn connection() -> ConnectionParams {
    ConnectionParams {
        tally_port: 9000,
        backend_url: "http://127.0.0.1:3000".to_string(),
    }
}
