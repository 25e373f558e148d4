use crate::config::SyncConfig;
use crate::entity::MASTER_SEQUENCE;
use crate::models::{Company, CompanyStatusUpdate, Credentials, SyncStatus};
use crate::sync::invoker::EntitySyncInvoker;
use crate::sync::models::{
    CompanySyncResult, CriticalAlert, CycleOutcome, CycleRun, CycleSummary, EntityProgress,
    SkipReason, SyncKind,
};
use crate::sync::reconcile::Reconciler;
use crate::sync::state::SyncStateManager;
use crate::sync::traits::{BackendStore, LicenseGate, SourceConnector};
use crate::sync::watermark::WatermarkResolver;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Where the scheduler currently is inside a cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    ValidatingLicense,
    ListingCompanies,
    ResolvingWatermarks,
    SyncingEntities,
    Aggregating,
    Ending,
    SchedulingReconciliation,
}

/// Collaborators the scheduler is built from.
pub struct SchedulerDeps {
    pub state: Arc<SyncStateManager>,
    pub backend: Arc<dyn BackendStore>,
    pub connector: Arc<dyn SourceConnector>,
    pub license: Arc<dyn LicenseGate>,
    pub credentials: Credentials,
}

/// Timer-driven sync over every company and the fixed master sequence.
pub struct SyncScheduler {
    state: Arc<SyncStateManager>,
    backend: Arc<dyn BackendStore>,
    license: Arc<dyn LicenseGate>,
    resolver: WatermarkResolver,
    invoker: EntitySyncInvoker,
    reconciler: Arc<Reconciler>,
    credentials: Credentials,
    period: Option<Duration>,
    reconcile_delay: Duration,
    phase: Mutex<SchedulerPhase>,
}

/// Per-company loop result before aggregation.
struct CompanyPass {
    result: CompanySyncResult,
    unauthorized: bool,
    critical: Option<CriticalAlert>,
}

impl SyncScheduler {
    #[tracing::instrument(level = "debug", skip(config, deps))]
    pub fn new(config: &SyncConfig, deps: SchedulerDeps) -> Result<Self> {
        config.validate()?;
        let resolver = WatermarkResolver::new(
            deps.backend.clone(),
            config.scan_page_size,
            config.max_scan_records,
        );
        let invoker = EntitySyncInvoker::new(
            deps.connector,
            config.connection_params(),
            config.fetch_policy(),
        );
        let reconciler = Arc::new(Reconciler::new(deps.backend.clone(), deps.state.clone()));
        Ok(Self {
            state: deps.state,
            backend: deps.backend,
            license: deps.license,
            resolver,
            invoker,
            reconciler,
            credentials: deps.credentials,
            period: config.schedule_period(),
            reconcile_delay: config.reconcile_delay(),
            phase: Mutex::new(SchedulerPhase::Idle),
        })
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Spawn the timer loop. The first cycle runs one period after start.
    ///
    /// Returns `None` when the sync interval is 0.
    pub fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let Some(period) = self.period else {
            tracing::info!("sync interval is 0; scheduled sync disabled");
            return None;
        };
        tracing::info!(period_secs = period.as_secs(), "scheduled sync enabled");
        Some(tokio::spawn(async move { self.run_loop(period).await }))
    }

    /// Run cycles every `period` until the task is cancelled.
    #[tracing::instrument(level = "info", skip(self))]
    async fn run_loop(&self, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let run = self.run_cycle().await;
            match &run.outcome {
                CycleOutcome::Skipped(reason) => {
                    tracing::info!(%reason, "scheduled sync skipped")
                }
                CycleOutcome::Completed(summary) => {
                    if let Some(alert) = &summary.critical {
                        tracing::error!(
                            company_id = %alert.company_id,
                            entity = %alert.entity,
                            kind = ?alert.kind,
                            message = %alert.message,
                            "{}",
                            alert.headline()
                        );
                    }
                    tracing::info!(success = summary.success, message = %summary.message, "scheduled sync finished")
                }
            }
        }
    }

    /// One full cycle. Never fails; problems are reported through the outcome.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_cycle(&self) -> CycleRun {
        let outcome = self.cycle().await;
        self.set_phase(SchedulerPhase::Idle);
        outcome
    }

    async fn cycle(&self) -> CycleRun {
        let skipped = |reason: SkipReason| CycleRun {
            outcome: CycleOutcome::Skipped(reason),
            reconciliation: None,
        };

        self.set_phase(SchedulerPhase::ValidatingLicense);
        match self.license.validate(&self.credentials).await {
            Ok(check) if check.valid => {}
            Ok(check) => {
                tracing::warn!(message = %check.message, "license rejected; skipping cycle");
                return skipped(SkipReason::LicenseRejected(check.message));
            }
            Err(e) => {
                tracing::warn!(error = %e, "license validation failed; skipping cycle");
                return skipped(SkipReason::LicenseRejected(e.to_string()));
            }
        }

        self.set_phase(SchedulerPhase::ListingCompanies);
        let companies = match self.backend.list_companies(&self.credentials).await {
            Ok(c) if c.is_empty() => return skipped(SkipReason::NoCompanies),
            Ok(c) => c,
            Err(Error::Unauthorized(msg)) => {
                tracing::error!(%msg, "backend rejected credentials; skipping cycle");
                return skipped(SkipReason::Unauthorized(msg));
            }
            Err(e) => {
                tracing::warn!(error = %e, "company listing failed; skipping cycle");
                return skipped(SkipReason::CompanyListingFailed(e.to_string()));
            }
        };

        let Some(session) = self.state.try_start(SyncKind::Scheduled, companies.len()) else {
            return skipped(SkipReason::SessionBusy);
        };

        let mut results = Vec::with_capacity(companies.len());
        let mut stopped_unauthorized = false;
        let mut critical = None;
        for (index, company) in companies.iter().enumerate() {
            self.state.update_progress(index, &company.name, None);
            let pass = self.sync_company(index, company).await;
            results.push(pass.result);
            if pass.unauthorized {
                tracing::error!(company_id = %company.id, "backend rejected credentials; stopping cycle");
                stopped_unauthorized = true;
                break;
            }
            if pass.critical.is_some() {
                tracing::error!(company_id = %company.id, "critical connector failure; stopping cycle");
                critical = pass.critical;
                break;
            }
        }

        self.set_phase(SchedulerPhase::Aggregating);
        let halted = stopped_unauthorized || critical.is_some();
        let success = !halted && results.iter().all(|r| r.success);
        let message = summarize(&results, companies.len(), stopped_unauthorized, critical.as_ref());

        self.set_phase(SchedulerPhase::Ending);
        self.state.end(success, message.clone());

        let reconciliation = if halted {
            None
        } else {
            self.set_phase(SchedulerPhase::SchedulingReconciliation);
            Some(self.spawn_reconciliation(companies))
        };

        CycleRun {
            outcome: CycleOutcome::Completed(CycleSummary {
                session_id: session.id,
                success,
                message,
                companies: results,
                stopped_unauthorized,
                critical,
            }),
            reconciliation,
        }
    }

    #[tracing::instrument(level = "info", skip(self, company), fields(company_id = %company.id))]
    async fn sync_company(&self, index: usize, company: &Company) -> CompanyPass {
        self.set_phase(SchedulerPhase::ResolvingWatermarks);
        let marks = self.resolver.resolve(company.id, &self.credentials).await;

        self.set_phase(SchedulerPhase::SyncingEntities);
        let mut result = CompanySyncResult {
            company_id: company.id,
            company_name: company.name.clone(),
            success: false,
            status: SyncStatus::Pending,
            succeeded: 0,
            attempted: 0,
            records: 0,
            errors: Vec::new(),
            critical: None,
        };
        let mut unauthorized = false;
        let mut alert = None;

        for (entity_index, kind) in MASTER_SEQUENCE.iter().copied().enumerate() {
            self.state.update_progress(
                index,
                &company.name,
                Some(EntityProgress::new(
                    company.id,
                    kind,
                    entity_index,
                    MASTER_SEQUENCE.len(),
                )),
            );
            let outcome = self
                .invoker
                .sync_entity(company.id, kind, marks.get(kind), &self.credentials)
                .await;
            result.attempted += 1;
            if outcome.success {
                result.succeeded += 1;
                result.records += outcome.count;
                continue;
            }
            result.errors.push(outcome.summary_line());
            if outcome.is_unauthorized() {
                unauthorized = true;
                break;
            }
            if let Some(critical) = outcome.critical() {
                tracing::error!(entity = %kind, ?critical, "critical connector failure; stopping company");
                result.critical = Some(critical);
                alert = Some(CriticalAlert {
                    company_id: company.id,
                    company_name: company.name.clone(),
                    entity: kind,
                    kind: critical,
                    message: outcome.message.clone(),
                });
                break;
            }
        }

        result.success = result.errors.is_empty();
        result.status = SyncStatus::classify(result.succeeded, MASTER_SEQUENCE.len());

        if !unauthorized {
            let update = CompanyStatusUpdate::new(result.status, Utc::now());
            if let Err(e) = self
                .backend
                .update_company_status(company.id, &update, &self.credentials)
                .await
            {
                tracing::warn!(error = %e, "company status write-back failed");
            }
        }

        CompanyPass {
            result,
            unauthorized,
            critical: alert,
        }
    }

    fn spawn_reconciliation(&self, companies: Vec<Company>) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let credentials = self.credentials.clone();
        let delay = self.reconcile_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let done = reconciler.reconcile_companies(&companies, &credentials).await;
            tracing::info!(
                reconciled = done.len(),
                total = companies.len(),
                "post-sync reconciliation finished"
            );
        })
    }
}

fn summarize(
    results: &[CompanySyncResult],
    total: usize,
    stopped_unauthorized: bool,
    critical: Option<&CriticalAlert>,
) -> String {
    let failed: Vec<&CompanySyncResult> = results.iter().filter(|r| !r.success).collect();
    if failed.is_empty() && !stopped_unauthorized && critical.is_none() {
        return format!("synced {total} companies");
    }
    let mut parts: Vec<String> = failed
        .iter()
        .map(|r| format!("{}: {}", r.company_name, r.errors.join("; ")))
        .collect();
    if stopped_unauthorized {
        parts.push(format!(
            "stopped after {} of {total} companies: unauthorized",
            results.len()
        ));
    }
    if let Some(alert) = critical {
        parts.push(format!(
            "stopped after {} of {total} companies: {}",
            results.len(),
            alert.headline()
        ));
    }
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use crate::models::CompanyId;
    use crate::sync::memory::{MemoryBackend, Operation};
    use crate::sync::models::{CriticalKind, SyncEvent};
    use crate::sync::test_support::{ScriptedConnector, StaticLicense, Step, creds};
    use serde_json::json;

    struct Harness {
        scheduler: Arc<SyncScheduler>,
        state: Arc<SyncStateManager>,
        backend: Arc<MemoryBackend>,
        connector: Arc<ScriptedConnector>,
        license: Arc<StaticLicense>,
    }

    fn config() -> SyncConfig {
        SyncConfig {
            connector_max_attempts: 1,
            reconcile_delay_secs: 0,
            ..SyncConfig::default()
        }
    }

    fn harness_with(config: SyncConfig, license: StaticLicense, companies: &[(i64, &str)]) -> Harness {
        let state = Arc::new(SyncStateManager::new());
        let backend = Arc::new(MemoryBackend::new().with_companies(
            companies
                .iter()
                .map(|(id, name)| Company::new(CompanyId(*id), *name))
                .collect(),
        ));
        let connector = Arc::new(ScriptedConnector::new());
        let license = Arc::new(license);
        let scheduler = SyncScheduler::new(
            &config,
            SchedulerDeps {
                state: state.clone(),
                backend: backend.clone(),
                connector: connector.clone(),
                license: license.clone(),
                credentials: creds(),
            },
        )
        .unwrap();
        Harness {
            scheduler: Arc::new(scheduler),
            state,
            backend,
            connector,
            license,
        }
    }

    fn harness(companies: &[(i64, &str)]) -> Harness {
        harness_with(config(), StaticLicense::allow(), companies)
    }

    #[tokio::test]
    async fn ledger_receives_mapped_watermark() {
        let h = harness(&[(1, "Acme")]);
        h.backend
            .set_master_mapping(CompanyId(1), json!({"masters": {"ledger": 120}}));

        let run = h.scheduler.run_cycle().await;
        let summary = run.outcome.summary().unwrap().clone();
        assert!(summary.success);

        let calls = h.connector.calls();
        let ledger = calls.iter().find(|c| c.entity == EntityKind::Ledger).unwrap();
        assert_eq!(ledger.watermark, 120);
        assert!(
            calls
                .iter()
                .filter(|c| c.entity != EntityKind::Ledger)
                .all(|c| c.watermark == 0)
        );
        assert_eq!(h.connector.entities_for(CompanyId(1)), MASTER_SEQUENCE.to_vec());
        assert_eq!(h.backend.company(CompanyId(1)).unwrap().sync_status, SyncStatus::Synced);
        assert_eq!(h.scheduler.phase(), SchedulerPhase::Idle);
        assert!(!h.state.is_active());
        run.reconciliation.unwrap().await.unwrap();
        assert_eq!(h.backend.reconcile_calls().len(), MASTER_SEQUENCE.len());
    }

    #[tokio::test]
    async fn watermarks_advance_across_cycles() {
        let h = harness(&[(1, "Acme")]);
        h.backend.insert_records(
            CompanyId(1),
            EntityKind::Ledger,
            vec![json!({"guid": "cash", "alterId": 120})],
        );

        let first = h.scheduler.run_cycle().await;
        first.reconciliation.unwrap().await.unwrap();

        h.backend.insert_records(
            CompanyId(1),
            EntityKind::Ledger,
            vec![json!({"guid": "bank", "alterId": 131})],
        );
        let second = h.scheduler.run_cycle().await;
        assert!(second.outcome.summary().unwrap().success);

        let ledger_marks: Vec<u64> = h
            .connector
            .calls()
            .into_iter()
            .filter(|c| c.entity == EntityKind::Ledger)
            .map(|c| c.watermark)
            .collect();
        assert_eq!(ledger_marks.len(), 2);
        assert_eq!(ledger_marks[0], 120);
        assert!(ledger_marks[1] >= 131);
        assert!(ledger_marks[1] >= ledger_marks[0]);
    }

    #[tokio::test]
    async fn one_failing_entity_does_not_stop_the_rest() {
        let h = harness(&[(1, "Acme")]);
        h.connector.script(
            CompanyId(1),
            EntityKind::Unit,
            vec![Step::Fail("Unit export failed".to_string())],
        );

        let run = h.scheduler.run_cycle().await;
        let summary = run.outcome.summary().unwrap();
        assert!(!summary.success);
        assert!(summary.message.contains("Unit: Unit export failed"));

        let company = &summary.companies[0];
        assert_eq!(company.errors, vec!["Unit: Unit export failed".to_string()]);
        assert_eq!(company.attempted, 12);
        assert_eq!(company.succeeded, 11);
        assert_eq!(company.records, 11);
        assert_eq!(company.status, SyncStatus::Pending);
        assert_eq!(h.connector.entities_for(CompanyId(1)).len(), 12);
        assert_eq!(h.state.history(1)[0].success, false);
    }

    #[tokio::test]
    async fn failing_company_does_not_stop_the_next() {
        let h = harness(&[(1, "Acme"), (2, "Globex")]);
        for kind in MASTER_SEQUENCE {
            h.connector
                .script(CompanyId(1), kind, vec![Step::Fail("Tally not responding".to_string())]);
        }

        let run = h.scheduler.run_cycle().await;
        let summary = run.outcome.summary().unwrap();
        assert_eq!(summary.companies.len(), 2);
        assert_eq!(summary.companies[0].status, SyncStatus::Error);
        assert!(summary.companies[1].success);
        assert_eq!(h.connector.entities_for(CompanyId(2)).len(), 12);

        let updates = h.backend.status_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].1.sync_status, SyncStatus::Error);
        assert!(updates[0].1.last_sync_date.is_none());
        assert_eq!(updates[1].1.sync_status, SyncStatus::Synced);
        assert!(updates[1].1.last_sync_date.is_some());
    }

    #[tokio::test]
    async fn critical_failure_stops_the_cycle() {
        let h = harness(&[(1, "Acme"), (2, "Globex")]);
        h.connector.script(
            CompanyId(1),
            EntityKind::CostCenter,
            vec![Step::Fail("company mismatch: Tally has 'Other Co' open".to_string())],
        );

        let run = h.scheduler.run_cycle().await;
        let summary = run.outcome.summary().unwrap();
        assert!(!summary.success);
        assert!(summary.halted());
        assert_eq!(summary.companies.len(), 1);
        let acme = &summary.companies[0];
        assert_eq!(acme.critical, Some(CriticalKind::CompanyMismatch));
        assert_eq!(acme.attempted, 7);
        assert_eq!(h.connector.entities_for(CompanyId(1)).last(), Some(&EntityKind::CostCenter));
        assert!(h.connector.entities_for(CompanyId(2)).is_empty());

        let alert = summary.critical.clone().unwrap();
        assert_eq!(alert.company_id, CompanyId(1));
        assert_eq!(alert.entity, EntityKind::CostCenter);
        assert_eq!(alert.kind, CriticalKind::CompanyMismatch);
        assert!(summary.message.contains(&alert.headline()));
        alert.acknowledge();

        assert!(run.reconciliation.is_none());
        assert!(!h.state.history(1)[0].success);
    }

    #[tokio::test]
    async fn concurrent_sync_failure_leaves_later_companies_untouched() {
        let h = harness(&[(1, "Acme"), (2, "Globex"), (3, "Initech")]);
        h.connector.script(
            CompanyId(2),
            EntityKind::Group,
            vec![Step::Fail("Another sync is running in Tally".to_string())],
        );

        let run = h.scheduler.run_cycle().await;
        let summary = run.outcome.summary().unwrap();
        assert_eq!(summary.companies.len(), 2);
        assert!(summary.companies[0].success);
        assert_eq!(
            summary.critical.as_ref().map(|a| a.kind),
            Some(CriticalKind::ConcurrentSync)
        );
        assert!(h.connector.entities_for(CompanyId(3)).is_empty());
        assert!(run.reconciliation.is_none());
    }

    #[tokio::test]
    async fn unauthorized_entity_stops_the_cycle() {
        let h = harness(&[(1, "Acme"), (2, "Globex")]);
        h.connector
            .script(CompanyId(1), EntityKind::Currency, vec![Step::Unauthorized]);

        let run = h.scheduler.run_cycle().await;
        let summary = run.outcome.summary().unwrap();
        assert!(summary.stopped_unauthorized);
        assert!(!summary.success);
        assert_eq!(summary.companies.len(), 1);
        assert!(h.connector.entities_for(CompanyId(2)).is_empty());
        assert!(h.backend.status_updates().is_empty());
        assert!(run.reconciliation.is_none());
    }

    #[tokio::test]
    async fn rejected_license_makes_no_calls() {
        let h = harness_with(config(), StaticLicense::deny(), &[(1, "Acme")]);
        let run = h.scheduler.run_cycle().await;
        assert!(matches!(
            run.outcome.skip_reason(),
            Some(SkipReason::LicenseRejected(_))
        ));
        assert_eq!(h.license.checks(), 1);
        assert!(h.connector.calls().is_empty());
        assert_eq!(h.backend.list_calls(), 0);
        assert!(h.backend.status_updates().is_empty());
        assert!(h.state.history(10).is_empty());
    }

    #[tokio::test]
    async fn listing_failures_skip_the_cycle() {
        let h = harness(&[]);
        assert_eq!(
            h.scheduler.run_cycle().await.outcome.skip_reason(),
            Some(&SkipReason::NoCompanies)
        );

        h.backend.add_company(Company::new(CompanyId(1), "Acme"));
        h.backend.fail_unauthorized(Operation::ListCompanies);
        assert!(matches!(
            h.scheduler.run_cycle().await.outcome.skip_reason(),
            Some(SkipReason::Unauthorized(_))
        ));

        h.backend.fail(Operation::ListCompanies);
        assert!(matches!(
            h.scheduler.run_cycle().await.outcome.skip_reason(),
            Some(SkipReason::CompanyListingFailed(_))
        ));
        assert!(h.connector.calls().is_empty());
    }

    #[tokio::test]
    async fn busy_session_drops_the_tick() {
        let h = harness(&[(1, "Acme")]);
        let mut rx = h.state.subscribe();
        let _manual = h.state.try_start(SyncKind::CompanySpecific, 14).unwrap();

        let run = h.scheduler.run_cycle().await;
        assert_eq!(run.outcome.skip_reason(), Some(&SkipReason::SessionBusy));
        assert!(h.connector.calls().is_empty());
        assert_eq!(h.state.queue_len(), 1);

        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::Started { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::QueueUpdated { queue_size: 1, .. }
        ));
    }

    #[tokio::test]
    async fn status_write_back_failure_is_not_fatal() {
        let h = harness(&[(1, "Acme")]);
        h.backend.fail(Operation::UpdateCompanyStatus);
        let run = h.scheduler.run_cycle().await;
        assert!(run.outcome.summary().unwrap().success);
    }

    #[tokio::test]
    async fn zero_interval_disables_timer() {
        let h = harness_with(
            SyncConfig {
                sync_interval_minutes: 0,
                ..config()
            },
            StaticLicense::allow(),
            &[(1, "Acme")],
        );
        assert!(h.scheduler.clone().start().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_one_period() {
        let h = harness_with(
            SyncConfig {
                sync_interval_minutes: 1,
                reconcile_delay_secs: 3600,
                ..config()
            },
            StaticLicense::allow(),
            &[(1, "Acme")],
        );
        let handle = h.scheduler.clone().start().unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(h.license.checks(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.license.checks(), 1);
        assert_eq!(h.connector.entities_for(CompanyId(1)).len(), 12);

        handle.abort();
    }
}
