use crate::models::{ConnectionParams, Credentials};
use crate::{Error, Result};
use std::time::Duration;

pub const DEFAULT_TALLY_PORT: u16 = 9000;

/// Runtime configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub backend_url: String,
    pub tally_port: u16,

    /// Minutes between scheduled cycles. `0` disables the timer.
    pub sync_interval_minutes: u64,
    /// Delay after a scheduled cycle ends before the reconciliation pass starts.
    pub reconcile_delay_secs: u64,

    pub connector_timeout_secs: u64,
    pub connector_max_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,

    /// Upper bound on records scanned per entity by the fallback watermark resolver.
    pub max_scan_records: usize,
    pub scan_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:3000".to_string(),
            tally_port: DEFAULT_TALLY_PORT,
            sync_interval_minutes: 30,
            reconcile_delay_secs: 30,
            connector_timeout_secs: 300,
            connector_max_attempts: 3,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 30_000,
            max_scan_records: 50_000,
            scan_page_size: 500,
        }
    }
}

impl SyncConfig {
    /// Load from `TALLIFFY_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TALLIFFY_BACKEND_URL") {
            cfg.backend_url = v.trim().trim_end_matches('/').to_string();
        }
        if let Some(v) = get("TALLIFFY_TALLY_PORT") {
            cfg.tally_port = parse_var("TALLIFFY_TALLY_PORT", &v)?;
        }
        if let Some(v) = get("TALLIFFY_SYNC_INTERVAL_MINUTES") {
            cfg.sync_interval_minutes = parse_var("TALLIFFY_SYNC_INTERVAL_MINUTES", &v)?;
        }
        if let Some(v) = get("TALLIFFY_RECONCILE_DELAY_SECS") {
            cfg.reconcile_delay_secs = parse_var("TALLIFFY_RECONCILE_DELAY_SECS", &v)?;
        }
        if let Some(v) = get("TALLIFFY_CONNECTOR_TIMEOUT_SECS") {
            cfg.connector_timeout_secs = parse_var("TALLIFFY_CONNECTOR_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("TALLIFFY_CONNECTOR_MAX_ATTEMPTS") {
            cfg.connector_max_attempts = parse_var("TALLIFFY_CONNECTOR_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("TALLIFFY_MAX_SCAN_RECORDS") {
            cfg.max_scan_records = parse_var("TALLIFFY_MAX_SCAN_RECORDS", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.backend_url.trim().is_empty() {
            return Err(Error::InvalidInput("backend_url is empty".to_string()));
        }
        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://")) {
            return Err(Error::InvalidInput(format!(
                "backend_url must be http(s): {}",
                self.backend_url
            )));
        }
        if self.tally_port == 0 {
            return Err(Error::InvalidInput(
                "tally_port must be in 1..=65535".to_string(),
            ));
        }
        if self.connector_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "connector_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.connector_max_attempts == 0 {
            return Err(Error::InvalidInput(
                "connector_max_attempts must be > 0".to_string(),
            ));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            return Err(Error::InvalidInput(
                "retry_backoff_max_ms must be >= retry_backoff_base_ms".to_string(),
            ));
        }
        if self.scan_page_size == 0 {
            return Err(Error::InvalidInput("scan_page_size must be > 0".to_string()));
        }
        Ok(())
    }

    /// Timer period, or `None` when scheduling is disabled.
    pub fn schedule_period(&self) -> Option<Duration> {
        (self.sync_interval_minutes > 0)
            .then(|| Duration::from_secs(self.sync_interval_minutes.saturating_mul(60)))
    }

    pub fn reconcile_delay(&self) -> Duration {
        Duration::from_secs(self.reconcile_delay_secs)
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(self.connector_timeout_secs),
            max_attempts: self.connector_max_attempts,
            backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
            backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }

    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            tally_port: self.tally_port,
            backend_url: self.backend_url.clone(),
        }
    }
}

/// Timeout and retry policy for one connector call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        SyncConfig::default().fetch_policy()
    }
}

impl FetchPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped at `backoff_max`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.min(31);
        let ms = (self.backoff_base.as_millis()).saturating_mul(1u128 << shift);
        Duration::from_millis(ms.min(self.backoff_max.as_millis()) as u64)
    }
}

/// Load credentials from `TALLIFFY_AUTH_TOKEN`, `TALLIFFY_DEVICE_TOKEN`, `TALLIFFY_USER_ID`
/// and the optional `TALLIFFY_LICENSE_NUMBER`.
pub fn credentials_from_env() -> Result<Credentials> {
    credentials_from_lookup(|key| std::env::var(key).ok())
}

pub fn credentials_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Credentials> {
    let required = |key: &str| {
        lookup(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("{key} is not set")))
    };
    let mut creds = Credentials::new(
        required("TALLIFFY_AUTH_TOKEN")?,
        required("TALLIFFY_DEVICE_TOKEN")?,
        lookup("TALLIFFY_USER_ID").unwrap_or_default(),
    );
    if let Some(license) = lookup("TALLIFFY_LICENSE_NUMBER").filter(|v| !v.trim().is_empty()) {
        creds = creds.with_license_number(license);
    }
    Ok(creds)
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| Error::InvalidInput(format!("invalid {key}: {value}")))
}
