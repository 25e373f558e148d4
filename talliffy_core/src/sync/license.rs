use crate::Result;
use crate::models::{ConnectionParams, Credentials};
use crate::sync::traits::{LicenseCheck, LicenseGate, SourceConnector};
use async_trait::async_trait;
use std::sync::Arc;

/// Canonical form for license comparison: trimmed, upper-cased, no whitespace.
pub fn normalize_license(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Hide all but the last four characters.
pub fn mask_license(license: &str) -> String {
    let chars: Vec<char> = license.chars().collect();
    if chars.len() <= 4 {
        return license.to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

/// Source-system licenses that are let through with a warning.
fn is_bypass_license(normalized: &str) -> bool {
    normalized.contains("EDUCATIONAL") || normalized == "UNKNOWN" || normalized == "0"
}

/// Compares the running source system's license with the user's.
pub struct LicenseValidator {
    connector: Arc<dyn SourceConnector>,
    connection: ConnectionParams,
}

impl LicenseValidator {
    pub fn new(connector: Arc<dyn SourceConnector>, connection: ConnectionParams) -> Self {
        Self {
            connector,
            connection,
        }
    }

    /// Pure comparison step, separated from the connector call.
    pub fn compare(user_license: &str, source_license: &str) -> LicenseCheck {
        let user = normalize_license(user_license);
        let source = normalize_license(source_license);
        let source_license = Some(source_license.to_string());

        if !user.is_empty() && user == source {
            return LicenseCheck::valid("license validation successful", source_license);
        }
        if is_bypass_license(&source) {
            tracing::warn!(
                source_license = %source,
                "source system is in educational mode or reports no license; allowing sync"
            );
            return LicenseCheck::valid(
                "license validation bypassed (educational mode/unknown)",
                source_license,
            );
        }
        tracing::warn!(
            expected = %mask_license(&user),
            actual = %mask_license(&source),
            "license mismatch"
        );
        LicenseCheck::invalid(
            format!(
                "license mismatch: Tally license ({}) does not match your license ({})",
                mask_license(&source),
                mask_license(&user)
            ),
            source_license,
        )
    }
}

#[async_trait]
impl LicenseGate for LicenseValidator {
    #[tracing::instrument(level = "info", skip_all)]
    async fn validate(&self, credentials: &Credentials) -> Result<LicenseCheck> {
        let Some(user_license) = credentials
            .license_number
            .as_deref()
            .filter(|l| !l.trim().is_empty())
        else {
            return Ok(LicenseCheck::invalid(
                "user license number not found; please log in again",
                None,
            ));
        };

        let source_license = match self.connector.fetch_license(&self.connection).await {
            Ok(Some(l)) if !l.trim().is_empty() => l,
            Ok(_) => {
                return Ok(LicenseCheck::invalid(
                    "unable to fetch license from Tally; ensure Tally is running",
                    None,
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "license fetch failed");
                return Ok(LicenseCheck::invalid(
                    format!("unable to fetch license from Tally: {e}"),
                    None,
                ));
            }
        };

        Ok(Self::compare(user_license, &source_license))
    }
}
