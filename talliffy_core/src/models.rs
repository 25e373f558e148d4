use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid company id: {0}")]
    InvalidCompanyId(String),
}

/// Backend identifier of an imported company.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(pub i64);

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for CompanyId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for CompanyId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .parse::<i64>()
            .map_err(|_| IdParseError::InvalidCompanyId(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Company-level sync status as stored by the backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    #[serde(alias = "failed")]
    Error,
}

impl SyncStatus {
    /// Classify an attempt from how many of its steps succeeded.
    ///
    /// All succeeded -> `Synced`, some -> `Pending`, none -> `Error`.
    pub fn classify(succeeded: usize, total: usize) -> Self {
        if total > 0 && succeeded == total {
            SyncStatus::Synced
        } else if succeeded > 0 {
            SyncStatus::Pending
        } else {
            SyncStatus::Error
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A company imported from the source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    #[serde(default, alias = "companyGuid", alias = "guid")]
    pub external_guid: String,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub last_sync_date: Option<DateTime<Utc>>,
}

impl Company {
    pub fn new(id: CompanyId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            external_guid: String::new(),
            sync_status: SyncStatus::Pending,
            last_sync_date: None,
        }
    }

    pub fn with_external_guid(mut self, guid: impl Into<String>) -> Self {
        self.external_guid = guid.into();
        self
    }
}

/// Status write-back payload (`PUT /companies/{id}/sync-status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyStatusUpdate {
    pub sync_status: SyncStatus,
    pub last_sync_date: Option<DateTime<Utc>>,
}

impl CompanyStatusUpdate {
    /// `last_sync_date` only advances when the company ended fully synced.
    pub fn new(sync_status: SyncStatus, at: DateTime<Utc>) -> Self {
        let last_sync_date = (sync_status == SyncStatus::Synced).then_some(at);
        Self {
            sync_status,
            last_sync_date,
        }
    }
}

/// Credentials carried by every backend call and handed to the connector.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub auth_token: String,
    pub device_token: String,
    pub user_id: String,
    #[serde(default)]
    pub license_number: Option<String>,
}

impl Credentials {
    pub fn new(
        auth_token: impl Into<String>,
        device_token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            auth_token: auth_token.into(),
            device_token: device_token.into(),
            user_id: user_id.into(),
            license_number: None,
        }
    }

    pub fn with_license_number(mut self, license: impl Into<String>) -> Self {
        self.license_number = Some(license.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        !self.auth_token.trim().is_empty() && !self.device_token.trim().is_empty()
    }
}

// Tokens never show up in logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_token", &"<redacted>")
            .field("device_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("license_number", &self.license_number)
            .finish()
    }
}

/// How the connector reaches the source system and the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub tally_port: u16,
    pub backend_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn company_accepts_guid_aliases_and_missing_status() {
        let c: Company = serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": "Acme Traders",
            "companyGuid": "abc-123",
        }))
        .unwrap();
        assert_eq!(c.id, CompanyId(7));
        assert_eq!(c.external_guid, "abc-123");
        assert_eq!(c.sync_status, SyncStatus::Pending);
        assert!(c.last_sync_date.is_none());
    }

    #[test]
    fn classify_status_from_step_counts() {
        assert_eq!(SyncStatus::classify(14, 14), SyncStatus::Synced);
        assert_eq!(SyncStatus::classify(3, 14), SyncStatus::Pending);
        assert_eq!(SyncStatus::classify(0, 14), SyncStatus::Error);
        assert_eq!(SyncStatus::classify(0, 0), SyncStatus::Error);
    }

    #[test]
    fn credentials_debug_redacts_tokens() {
        let creds = Credentials::new("secret-token", "device-secret", "42");
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("secret-token"));
        assert!(!dbg.contains("device-secret"));
        assert!(dbg.contains("42"));
    }

    #[test]
    fn status_update_only_stamps_synced() {
        let now = Utc::now();
        assert_eq!(
            CompanyStatusUpdate::new(SyncStatus::Synced, now).last_sync_date,
            Some(now)
        );
        assert!(
            CompanyStatusUpdate::new(SyncStatus::Pending, now)
                .last_sync_date
                .is_none()
        );
    }
}
