use crate::config::FetchPolicy;
use crate::entity::EntityKind;
use crate::models::{CompanyId, ConnectionParams, Credentials};
use crate::sync::models::{CriticalKind, FailureKind, SyncOutcome};
use crate::sync::traits::{ConnectorReport, EntitySyncRequest, SourceConnector};
use crate::{Error, Result};
use std::sync::Arc;

/// Calls the source connector for one (company, entity kind, watermark) triple.
///
/// Never fails: every error is folded into the returned [`SyncOutcome`].
pub struct EntitySyncInvoker {
    connector: Arc<dyn SourceConnector>,
    connection: ConnectionParams,
    policy: FetchPolicy,
}

impl EntitySyncInvoker {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        connection: ConnectionParams,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            connector,
            connection,
            policy,
        }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    #[tracing::instrument(
        level = "info",
        skip(self, credentials),
        fields(company_id = %company_id, entity = %entity)
    )]
    pub async fn sync_entity(
        &self,
        company_id: CompanyId,
        entity: EntityKind,
        watermark: u64,
        credentials: &Credentials,
    ) -> SyncOutcome {
        let request = EntitySyncRequest {
            company_id,
            entity,
            watermark,
            connection_params: self.connection.clone(),
            credentials: credentials.clone(),
        };

        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match self.call_once(&request).await {
                Ok(report) => return outcome_from_report(entity, report),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.policy.backoff(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connector call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return outcome_from_error(entity, e),
            }
        }
    }

    async fn call_once(&self, request: &EntitySyncRequest) -> Result<ConnectorReport> {
        match tokio::time::timeout(self.policy.timeout, self.connector.sync_entity(request)).await
        {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(format!(
                "{} sync did not finish within {}s",
                request.entity,
                self.policy.timeout.as_secs()
            ))),
        }
    }
}

fn outcome_from_report(entity: EntityKind, report: ConnectorReport) -> SyncOutcome {
    if report.success {
        tracing::info!(count = report.count, last_alter_id = ?report.last_alter_id, "entity synced");
        return SyncOutcome::succeeded(entity, report.count, report.message, report.last_alter_id);
    }
    let message = if report.message.trim().is_empty() {
        "connector reported failure".to_string()
    } else {
        report.message
    };
    let failure = match CriticalKind::classify(&message) {
        Some(kind) => FailureKind::Critical(kind),
        None => FailureKind::Rejected,
    };
    tracing::warn!(?failure, %message, "entity sync failed");
    SyncOutcome::failed(entity, failure, message)
}

fn outcome_from_error(entity: EntityKind, err: Error) -> SyncOutcome {
    let message = err.to_string();
    let failure = if err.is_unauthorized() {
        FailureKind::Unauthorized
    } else if let Some(kind) = CriticalKind::classify(&message) {
        FailureKind::Critical(kind)
    } else if err.is_transient() {
        FailureKind::Transient
    } else {
        FailureKind::Rejected
    };
    tracing::warn!(?failure, error = %message, "entity sync errored");
    SyncOutcome::failed(entity, failure, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_support::{ScriptedConnector, Step};
    use std::time::Duration;

    fn policy(max_attempts: u32) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(5),
            max_attempts,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
        }
    }

    fn invoker(connector: Arc<ScriptedConnector>, max_attempts: u32) -> EntitySyncInvoker {
        EntitySyncInvoker::new(
            connector,
            ConnectionParams {
                tally_port: 9000,
                backend_url: "http://localhost".to_string(),
            },
            policy(max_attempts),
        )
    }

    fn creds() -> Credentials {
        Credentials::new("t", "d", "u")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.script(
            CompanyId(1),
            EntityKind::Ledger,
            vec![Step::TransportError, Step::TransportError, Step::Ok(4)],
        );
        let outcome = invoker(connector.clone(), 3)
            .sync_entity(CompanyId(1), EntityKind::Ledger, 120, &creds())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.count, 4);
        assert_eq!(connector.calls().len(), 3);
        assert!(connector.calls().iter().all(|c| c.watermark == 120));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_transient() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.script(
            CompanyId(1),
            EntityKind::Group,
            vec![Step::TransportError, Step::TransportError],
        );
        let outcome = invoker(connector.clone(), 2)
            .sync_entity(CompanyId(1), EntityKind::Group, 0, &creds())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FailureKind::Transient));
        assert_eq!(connector.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connector_times_out() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.script(CompanyId(1), EntityKind::Godown, vec![Step::Hang]);
        let outcome = invoker(connector, 1)
            .sync_entity(CompanyId(1), EntityKind::Godown, 0, &creds())
            .await;
        assert_eq!(outcome.failure, Some(FailureKind::Transient));
        assert!(outcome.message.contains("timed out"));
    }

    #[tokio::test]
    async fn rejections_and_critical_signals_are_not_retried() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.script(
            CompanyId(1),
            EntityKind::Unit,
            vec![Step::Fail("Units not found in Tally".to_string())],
        );
        connector.script(
            CompanyId(1),
            EntityKind::Currency,
            vec![Step::Fail("Company mismatch detected".to_string())],
        );
        connector.script(CompanyId(1), EntityKind::Ledger, vec![Step::Unauthorized]);
        let inv = invoker(connector.clone(), 3);

        let unit = inv.sync_entity(CompanyId(1), EntityKind::Unit, 0, &creds()).await;
        assert_eq!(unit.failure, Some(FailureKind::Rejected));
        let currency = inv
            .sync_entity(CompanyId(1), EntityKind::Currency, 0, &creds())
            .await;
        assert_eq!(currency.critical(), Some(CriticalKind::CompanyMismatch));
        let ledger = inv.sync_entity(CompanyId(1), EntityKind::Ledger, 0, &creds()).await;
        assert!(ledger.is_unauthorized());

        assert_eq!(connector.calls().len(), 3);
    }
}
