//! Tally connector backed by an external connector program.
//!
//! The program does the XML round-trips with Tally and the uploads to the backend; this
//! module only spawns it and reads the single JSON document it prints on stdout:
//! `{"success": bool, "message": str, "count": int, "lastAlterID": int}` for entity syncs and
//! `{"success": bool, "data": {"license_number": str}, "error": str}` for license lookups.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use talliffy_core::sync::traits::{ConnectorReport, EntitySyncRequest, SourceConnector};
use talliffy_core::{ConnectionParams, Error, Result};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CmdOutput>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    #[tracing::instrument(level = "debug", skip_all, fields(program = %program))]
    async fn run(&self, program: &str, args: &[String]) -> Result<CmdOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).kill_on_drop(true);
        let out = cmd
            .output()
            .await
            .map_err(|e| Error::backend("spawn connector", e))?;
        Ok(CmdOutput {
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConnectorConfig {
    /// Interpreter or binary to run, e.g. `python`.
    pub program: String,
    /// Leading arguments for an entity sync (typically the script path).
    pub sync_args: Vec<String>,
    /// Leading arguments for a license lookup.
    pub license_args: Vec<String>,
}

impl Default for ProcessConnectorConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            sync_args: vec!["incremental_sync.py".to_string()],
            license_args: vec!["tally_license.py".to_string()],
        }
    }
}

/// `SourceConnector` that shells out to the connector program.
pub struct ProcessConnector {
    cfg: ProcessConnectorConfig,
    runner: Arc<dyn CommandRunner>,
}

impl ProcessConnector {
    #[tracing::instrument(level = "debug", skip(runner))]
    pub fn new(cfg: ProcessConnectorConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        if cfg.program.trim().is_empty() {
            return Err(Error::InvalidInput("connector program is empty".to_string()));
        }
        Ok(Self { cfg, runner })
    }

    /// Positional arguments in the order the connector program expects them.
    fn sync_argv(&self, request: &EntitySyncRequest) -> Vec<String> {
        let mut args = self.cfg.sync_args.clone();
        args.extend([
            request.company_id.to_string(),
            request.credentials.user_id.clone(),
            request.connection_params.tally_port.to_string(),
            request.connection_params.backend_url.clone(),
            request.credentials.auth_token.clone(),
            request.credentials.device_token.clone(),
            request.entity.as_str().to_string(),
            request.watermark.to_string(),
        ]);
        args
    }

    fn license_argv(&self, connection: &ConnectionParams) -> Vec<String> {
        let mut args = self.cfg.license_args.clone();
        args.extend(["--port".to_string(), connection.tally_port.to_string()]);
        args
    }
}

/// The connector prints log lines before its result; take the last line that is a JSON
/// object, or the whole output if it is one document.
fn last_json_object(stdout: &str) -> Option<Value> {
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(stdout.trim()) {
        return Some(v);
    }
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| match serde_json::from_str::<Value>(l) {
            Ok(v @ Value::Object(_)) => Some(v),
            _ => None,
        })
}

pub(crate) fn parse_sync_output(out: &CmdOutput) -> ConnectorReport {
    let parsed = last_json_object(&out.stdout)
        .and_then(|v| serde_json::from_value::<ConnectorReport>(v).ok());
    match parsed {
        Some(report) => report,
        None => {
            let stderr = out.stderr.trim();
            ConnectorReport {
                success: false,
                count: 0,
                message: if stderr.is_empty() {
                    format!("failed to parse connector output (exit {})", out.status)
                } else {
                    stderr.to_string()
                },
                last_alter_id: None,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct LicenseOutput {
    success: bool,
    #[serde(default)]
    data: Option<LicenseData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LicenseData {
    #[serde(default, alias = "licenseNumber")]
    license_number: Option<Value>,
}

pub(crate) fn parse_license_output(out: &CmdOutput) -> Result<Option<String>> {
    let Some(doc) = last_json_object(&out.stdout) else {
        return Err(Error::BackendMessage(format!(
            "license lookup produced no result (exit {}): {}",
            out.status,
            out.stderr.trim()
        )));
    };
    let parsed: LicenseOutput = serde_json::from_value(doc)
        .map_err(|e| Error::backend("decode license output", e))?;
    if !parsed.success {
        tracing::warn!(error = ?parsed.error, "license number not available from Tally");
        return Ok(None);
    }
    Ok(parsed
        .data
        .and_then(|d| d.license_number)
        .and_then(|v| match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.trim().is_empty()))
}

#[async_trait]
impl SourceConnector for ProcessConnector {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn sync_entity(&self, request: &EntitySyncRequest) -> Result<ConnectorReport> {
        let out = self
            .runner
            .run(&self.cfg.program, &self.sync_argv(request))
            .await?;
        let report = parse_sync_output(&out);
        if !report.success && out.status != 0 {
            tracing::debug!(exit = out.status, stderr = %out.stderr.trim(), "connector exited with failure");
        }
        Ok(report)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn fetch_license(&self, connection: &ConnectionParams) -> Result<Option<String>> {
        let out = self
            .runner
            .run(&self.cfg.program, &self.license_argv(connection))
            .await?;
        parse_license_output(&out)
    }
}

/// Whether something accepts TCP connections on the Tally port.
#[tracing::instrument(level = "debug")]
pub async fn probe_tally(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
