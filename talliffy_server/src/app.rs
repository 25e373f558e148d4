//! Wiring for the `talliffy` binary: builds the engine from config and runs one command.

use crate::cli::ConnectorArgs;
use std::sync::Arc;
use std::time::Duration;
use talliffy_core::config::credentials_from_env;
use talliffy_core::sync::license::LicenseValidator;
use talliffy_core::sync::pipeline::CompanySyncPipeline;
use talliffy_core::sync::reconcile::Reconciler;
use talliffy_core::sync::scheduler::{SchedulerDeps, SyncScheduler};
use talliffy_core::{
    BackendStore, CompanyId, CriticalAlert, CycleOutcome, EntityKind, Error, LicenseGate,
    PipelineReport, ReconcileTarget, SourceConnector, SyncConfig, SyncEvent, SyncStateManager,
};
use talliffy_integrations::backend::HttpBackendStore;
use talliffy_integrations::connectors::{
    ProcessConnector, ProcessConnectorConfig, TokioCommandRunner, probe_tally,
};
use tokio::io::{AsyncBufReadExt, BufReader};

pub struct App {
    pub config: SyncConfig,
    pub state: Arc<SyncStateManager>,
    pub backend: Arc<dyn BackendStore>,
    pub connector: Arc<dyn SourceConnector>,
}

impl App {
    pub fn from_env(connector: &ConnectorArgs) -> anyhow::Result<Self> {
        let config = SyncConfig::from_env()?;
        let backend = HttpBackendStore::new(config.backend_url.clone())?;
        let connector = ProcessConnector::new(
            ProcessConnectorConfig {
                program: connector.connector_program.clone(),
                sync_args: vec![connector.sync_script.clone()],
                license_args: vec![connector.license_script.clone()],
            },
            Arc::new(TokioCommandRunner),
        )?;
        Ok(Self {
            config,
            state: Arc::new(SyncStateManager::new()),
            backend: Arc::new(backend),
            connector: Arc::new(connector),
        })
    }

    fn license(&self) -> Arc<dyn LicenseGate> {
        Arc::new(LicenseValidator::new(
            self.connector.clone(),
            self.config.connection_params(),
        ))
    }

    fn scheduler(&self) -> anyhow::Result<Arc<SyncScheduler>> {
        let deps = SchedulerDeps {
            state: self.state.clone(),
            backend: self.backend.clone(),
            connector: self.connector.clone(),
            license: self.license(),
            credentials: credentials_from_env()?,
        };
        Ok(Arc::new(SyncScheduler::new(&self.config, deps)?))
    }

    /// Timer daemon. Runs until ctrl-c, or a single cycle with `once`.
    pub async fn run(&self, once: bool) -> anyhow::Result<()> {
        let scheduler = self.scheduler()?;
        let _events = self.state.on_event(log_event);

        if once {
            let run = scheduler.run_cycle().await;
            match &run.outcome {
                CycleOutcome::Skipped(reason) => println!("skipped: {reason}"),
                CycleOutcome::Completed(summary) => println!("{}", summary.message),
            }
            if let Some(alert) = run.outcome.summary().and_then(|s| s.critical.clone()) {
                await_acknowledgement(alert).await?;
            }
            if let Some(reconciliation) = run.reconciliation {
                reconciliation.await?;
            }
            return Ok(());
        }

        let Some(mut handle) = scheduler.start() else {
            tracing::warn!("scheduled sync disabled (interval 0); nothing to run");
            return Ok(());
        };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                tracing::info!("shutdown requested");
                handle.abort();
            }
            res = &mut handle => {
                res?;
            }
        }
        Ok(())
    }

    /// Manual pipeline for one company, or every company.
    pub async fn sync_company(&self, company_id: Option<i64>) -> anyhow::Result<()> {
        let credentials = credentials_from_env()?;
        let pipeline = CompanySyncPipeline::new(
            &self.config,
            self.state.clone(),
            self.backend.clone(),
            self.connector.clone(),
            self.license(),
            credentials.clone(),
        )?;
        let _events = self.state.on_event(log_event);

        let reports = match company_id {
            Some(id) => {
                let id = CompanyId(id);
                let company = self
                    .backend
                    .list_companies(&credentials)
                    .await?
                    .into_iter()
                    .find(|c| c.id == id)
                    .ok_or_else(|| Error::NotFound(format!("company {id}")))?;
                vec![pipeline.run_company(&company).await?]
            }
            None => pipeline.run_full().await?,
        };

        for report in &reports {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        for alert in reports.into_iter().filter_map(|r: PipelineReport| r.critical) {
            await_acknowledgement(alert).await?;
        }
        Ok(())
    }

    pub async fn reconcile(&self, company_id: i64, entity: Option<&str>) -> anyhow::Result<()> {
        let target = match entity {
            None => ReconcileTarget::All,
            Some(raw) if raw.eq_ignore_ascii_case("all") => ReconcileTarget::All,
            Some(raw) => ReconcileTarget::Entity(raw.parse::<EntityKind>()?),
        };
        let reconciler = Reconciler::new(self.backend.clone(), self.state.clone());
        let report = reconciler
            .reconcile(CompanyId(company_id), target, &credentials_from_env()?)
            .await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    pub async fn show_config(&self) -> anyhow::Result<()> {
        let reachable = probe_tally("127.0.0.1", self.config.tally_port, Duration::from_secs(2)).await;
        println!("{:#?}", self.config);
        println!(
            "tally port {}: {}",
            self.config.tally_port,
            if reachable { "reachable" } else { "not reachable" }
        );
        Ok(())
    }
}

fn log_event(event: SyncEvent) {
    match serde_json::to_string(&event) {
        Ok(json) => tracing::info!(event = %json, "sync event"),
        Err(e) => tracing::warn!(error = %e, "failed to encode sync event"),
    }
}

/// Block until someone at the terminal confirms they have seen the alert.
async fn await_acknowledgement(alert: CriticalAlert) -> anyhow::Result<()> {
    eprintln!("\n!! {}\n   {}", alert.headline(), alert.message);
    eprintln!("   Press Enter to acknowledge.");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    alert.acknowledge();
    Ok(())
}
