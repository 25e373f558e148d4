use crate::config::SyncConfig;
use crate::entity::FULL_SEQUENCE;
use crate::models::{Company, CompanyStatusUpdate, Credentials, SyncStatus};
use crate::sync::invoker::EntitySyncInvoker;
use crate::sync::models::{CriticalAlert, EntityProgress, PipelineReport, SyncKind};
use crate::sync::state::SyncStateManager;
use crate::sync::traits::{BackendStore, LicenseGate, SourceConnector};
use crate::sync::watermark::WatermarkResolver;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// User-triggered sync: one company through all 14 steps, or every company in turn.
///
/// The license gate must pass before a session is claimed. A critical connector failure ends the run immediately and the report carries a
/// [`CriticalAlert`] for the caller to surface.
pub struct CompanySyncPipeline {
    state: Arc<SyncStateManager>,
    backend: Arc<dyn BackendStore>,
    license: Arc<dyn LicenseGate>,
    resolver: WatermarkResolver,
    invoker: EntitySyncInvoker,
    credentials: Credentials,
}

impl CompanySyncPipeline {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        config: &SyncConfig,
        state: Arc<SyncStateManager>,
        backend: Arc<dyn BackendStore>,
        connector: Arc<dyn SourceConnector>,
        license: Arc<dyn LicenseGate>,
        credentials: Credentials,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolver: WatermarkResolver::new(
                backend.clone(),
                config.scan_page_size,
                config.max_scan_records,
            ),
            invoker: EntitySyncInvoker::new(
                connector,
                config.connection_params(),
                config.fetch_policy(),
            ),
            state,
            backend,
            license,
            credentials,
        })
    }

    async fn check_license(&self) -> Result<()> {
        let check = self.license.validate(&self.credentials).await?;
        if check.valid {
            return Ok(());
        }
        tracing::warn!(message = %check.message, "license rejected; manual sync refused");
        Err(Error::Unauthorized(format!("license rejected: {}", check.message)))
    }

    #[tracing::instrument(level = "info", skip(self, company), fields(company_id = %company.id))]
    pub async fn run_company(&self, company: &Company) -> Result<PipelineReport> {
        self.check_license().await?;
        let session = self
            .state
            .try_start(SyncKind::CompanySpecific, FULL_SEQUENCE.len())
            .ok_or_else(|| Error::Conflict("another sync is already running".to_string()))?;

        let report = self
            .run_steps(session.id, company, 0, FULL_SEQUENCE.len())
            .await;
        self.state.end(report.status == SyncStatus::Synced, describe(&report));
        Ok(report)
    }

    /// Sync every company. Stops at the first critical or authorization failure.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_full(&self) -> Result<Vec<PipelineReport>> {
        self.check_license().await?;
        let companies = self.backend.list_companies(&self.credentials).await?;
        if companies.is_empty() {
            tracing::info!("no companies to sync");
            return Ok(Vec::new());
        }

        let total_units = companies.len() * FULL_SEQUENCE.len();
        let session = self
            .state
            .try_start(SyncKind::Full, total_units)
            .ok_or_else(|| Error::Conflict("another sync is already running".to_string()))?;

        let mut reports = Vec::with_capacity(companies.len());
        for (index, company) in companies.iter().enumerate() {
            let report = self
                .run_steps(
                    session.id,
                    company,
                    index * FULL_SEQUENCE.len(),
                    FULL_SEQUENCE.len(),
                )
                .await;
            let halt = report.critical.is_some() || report.steps.iter().any(|s| s.is_unauthorized());
            reports.push(report);
            if halt {
                tracing::error!(company_id = %company.id, "full sync halted");
                break;
            }
        }

        let success = reports.len() == companies.len()
            && reports.iter().all(|r| r.status == SyncStatus::Synced);
        let message = reports
            .iter()
            .map(describe)
            .collect::<Vec<_>>()
            .join(" | ");
        self.state.end(success, message);
        Ok(reports)
    }

    async fn run_steps(
        &self,
        session_id: Uuid,
        company: &Company,
        unit_offset: usize,
        step_count: usize,
    ) -> PipelineReport {
        let marks = self.resolver.resolve(company.id, &self.credentials).await;

        let mut steps = Vec::with_capacity(step_count);
        let mut critical = None;
        let mut unauthorized = false;
        for (i, kind) in FULL_SEQUENCE.iter().copied().enumerate() {
            self.state.update_progress(
                unit_offset + i,
                &company.name,
                Some(EntityProgress::new(company.id, kind, i, step_count)),
            );
            let outcome = self
                .invoker
                .sync_entity(company.id, kind, marks.get(kind), &self.credentials)
                .await;
            let stop_critical = outcome.critical().map(|k| CriticalAlert {
                company_id: company.id,
                company_name: company.name.clone(),
                entity: kind,
                kind: k,
                message: outcome.message.clone(),
            });
            unauthorized = outcome.is_unauthorized();
            steps.push(outcome);
            if stop_critical.is_some() {
                critical = stop_critical;
                break;
            }
            if unauthorized {
                break;
            }
        }

        let succeeded = steps.iter().filter(|s| s.success).count();
        let status = SyncStatus::classify(succeeded, step_count);
        if !unauthorized {
            let update = CompanyStatusUpdate::new(status, Utc::now());
            if let Err(e) = self
                .backend
                .update_company_status(company.id, &update, &self.credentials)
                .await
            {
                tracing::warn!(company_id = %company.id, error = %e, "company status write-back failed");
            }
        }

        PipelineReport {
            session_id,
            company_id: company.id,
            company_name: company.name.clone(),
            status,
            steps,
            succeeded,
            total_steps: step_count,
            critical,
        }
    }
}

fn describe(report: &PipelineReport) -> String {
    if let Some(alert) = &report.critical {
        return alert.headline();
    }
    let failures: Vec<String> = report.failures().map(|s| s.summary_line()).collect();
    if failures.is_empty() {
        format!("{}: {}/{} steps synced", report.company_name, report.succeeded, report.total_steps)
    } else {
        format!("{}: {}", report.company_name, failures.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use crate::models::CompanyId;
    use crate::sync::memory::MemoryBackend;
    use crate::sync::models::{CriticalKind, SyncEvent};
    use crate::sync::test_support::{ScriptedConnector, StaticLicense, Step, creds};

    struct Harness {
        pipeline: CompanySyncPipeline,
        state: Arc<SyncStateManager>,
        backend: Arc<MemoryBackend>,
        connector: Arc<ScriptedConnector>,
        license: Arc<StaticLicense>,
    }

    fn harness(companies: &[(i64, &str)]) -> Harness {
        harness_with(StaticLicense::allow(), companies)
    }

    fn harness_with(license: StaticLicense, companies: &[(i64, &str)]) -> Harness {
        let state = Arc::new(SyncStateManager::new());
        let backend = Arc::new(MemoryBackend::new().with_companies(
            companies
                .iter()
                .map(|(id, name)| Company::new(CompanyId(*id), *name))
                .collect(),
        ));
        let connector = Arc::new(ScriptedConnector::new());
        let license = Arc::new(license);
        let config = SyncConfig {
            connector_max_attempts: 1,
            ..SyncConfig::default()
        };
        let pipeline = CompanySyncPipeline::new(
            &config,
            state.clone(),
            backend.clone(),
            connector.clone(),
            license.clone(),
            creds(),
        )
        .unwrap();
        Harness {
            pipeline,
            state,
            backend,
            connector,
            license,
        }
    }

    fn acme() -> Company {
        Company::new(CompanyId(1), "Acme")
    }

    #[tokio::test]
    async fn critical_failure_short_circuits_remaining_steps() {
        let h = harness(&[(1, "Acme")]);
        h.connector.script(
            CompanyId(1),
            EntityKind::Currency,
            vec![Step::Fail("Company mismatch: Tally has Globex open".to_string())],
        );

        let report = h.pipeline.run_company(&acme()).await.unwrap();
        assert_eq!(report.steps.len(), 2);
        assert_eq!(
            h.connector.entities_for(CompanyId(1)),
            vec![EntityKind::Group, EntityKind::Currency]
        );
        let alert = report.critical.clone().unwrap();
        assert_eq!(alert.kind, CriticalKind::CompanyMismatch);
        assert_eq!(alert.entity, EntityKind::Currency);
        assert!(alert.headline().contains("Acme"));
        alert.acknowledge();
        assert_eq!(report.status, SyncStatus::Pending);
        assert!(!h.state.is_active());
        assert!(!h.state.history(1)[0].success);
    }

    #[tokio::test]
    async fn progress_reports_rounded_percentages() {
        let h = harness(&[(1, "Acme")]);
        let mut rx = h.state.subscribe();

        let report = h.pipeline.run_company(&acme()).await.unwrap();
        assert_eq!(report.status, SyncStatus::Synced);
        assert_eq!(report.succeeded, 14);

        let mut percentages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Progress { session } = event {
                percentages.push(session.entity_progress.unwrap().percentage);
            }
        }
        assert_eq!(percentages.len(), 14);
        assert_eq!(percentages[0], 7);
        assert_eq!(percentages[6], 50);
        assert_eq!(percentages[13], 100);
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn status_reflects_step_outcomes() {
        let h = harness(&[(1, "Acme")]);
        h.connector.script(
            CompanyId(1),
            EntityKind::Voucher,
            vec![Step::Fail("Voucher export failed".to_string())],
        );
        let partial = h.pipeline.run_company(&acme()).await.unwrap();
        assert_eq!(partial.status, SyncStatus::Pending);
        assert_eq!(partial.steps.len(), 14);
        assert_eq!(partial.failures().count(), 1);

        for kind in FULL_SEQUENCE {
            h.connector
                .script(CompanyId(1), kind, vec![Step::Fail("Tally closed".to_string())]);
        }
        let failed = h.pipeline.run_company(&acme()).await.unwrap();
        assert_eq!(failed.status, SyncStatus::Error);

        let updates = h.backend.status_updates();
        assert_eq!(updates[0].1.sync_status, SyncStatus::Pending);
        assert_eq!(updates[1].1.sync_status, SyncStatus::Error);
        assert_eq!(h.backend.company(CompanyId(1)).unwrap().sync_status, SyncStatus::Error);
    }

    #[tokio::test]
    async fn refused_claim_is_a_conflict() {
        let h = harness(&[(1, "Acme")]);
        let _scheduled = h.state.try_start(SyncKind::Scheduled, 1).unwrap();
        let err = h.pipeline.run_company(&acme()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(h.connector.calls().is_empty());
        assert!(matches!(h.pipeline.run_full().await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn full_run_covers_every_company() {
        let h = harness(&[(1, "Acme"), (2, "Globex")]);
        let mut rx = h.state.subscribe();
        let reports = h.pipeline.run_full().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == SyncStatus::Synced));
        assert_eq!(h.connector.calls().len(), 28);

        match rx.recv().await.unwrap() {
            SyncEvent::Started { session } => {
                assert_eq!(session.kind, SyncKind::Full);
                assert_eq!(session.total_units, 28);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(h.state.history(1)[0].success);
    }

    #[tokio::test]
    async fn full_run_halts_on_critical_failure() {
        let h = harness(&[(1, "Acme"), (2, "Globex")]);
        h.connector.script(
            CompanyId(1),
            EntityKind::Ledger,
            vec![Step::Fail("Another sync is running in Tally".to_string())],
        );
        let reports = h.pipeline.run_full().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].critical.as_ref().map(|a| a.kind),
            Some(CriticalKind::ConcurrentSync)
        );
        assert!(h.connector.entities_for(CompanyId(2)).is_empty());
        assert!(!h.state.history(1)[0].success);
    }

    #[tokio::test]
    async fn rejected_license_refuses_manual_sync() {
        let h = harness_with(StaticLicense::deny(), &[(1, "Acme"), (2, "Globex")]);

        let err = h.pipeline.run_company(&acme()).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(matches!(h.pipeline.run_full().await, Err(Error::Unauthorized(_))));

        assert_eq!(h.license.checks(), 2);
        assert!(h.connector.calls().is_empty());
        assert_eq!(h.backend.list_calls(), 0);
        assert!(h.backend.status_updates().is_empty());
        assert!(!h.state.is_active());
        assert!(h.state.history(10).is_empty());
    }
}
