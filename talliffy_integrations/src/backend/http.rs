//! REST client for the Talliffy backend.
//!
//! Every request carries `Authorization: Bearer <token>` and `X-Device-Token`. Responses are
//! accepted both bare and wrapped in the `{success, data}` envelope.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use talliffy_core::sync::traits::{BackendStore, ListQuery};
use talliffy_core::{
    Company, CompanyId, CompanyStatusUpdate, Credentials, EntityKind, Error, ReconcileReport,
    ReconcileTarget, Result,
};

const DEVICE_TOKEN_HEADER: &str = "x-device-token";

#[derive(Debug, Clone)]
pub struct HttpBackendStore {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBackendStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::InvalidInput("backend base_url is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn headers(credentials: &Credentials) -> Result<HeaderMap> {
        fn value(v: &str) -> Result<HeaderValue> {
            HeaderValue::from_str(v)
                .map_err(|e| Error::InvalidInput(format!("invalid header value: {e}")))
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            value(&format!("Bearer {}", credentials.auth_token))?,
        );
        headers.insert(
            HeaderName::from_static(DEVICE_TOKEN_HEADER),
            value(&credentials.device_token)?,
        );
        Ok(headers)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: Option<&impl Serialize>,
        body: Option<&impl Serialize>,
        credentials: &Credentials,
    ) -> Result<Response> {
        let mut req = self.http.request(method, self.url(path));
        if let Some(q) = query {
            req = req.query(q);
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        req = req.headers(Self::headers(credentials)?);
        req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("{path}: {e}"))
            } else {
                Error::backend(format!("request {path}"), e)
            }
        })
    }

    async fn map_error(resp: Response) -> Error {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let message = if text.is_empty() {
            status.to_string()
        } else {
            text
        };
        error_for_status(status.as_u16(), message)
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<&impl Serialize>,
        body: Option<&impl Serialize>,
        credentials: &Credentials,
    ) -> Result<T> {
        let resp = self.send(method, path, query, body, credentials).await?;
        if !resp.status().is_success() {
            return Err(Self::map_error(resp).await);
        }
        if resp.status().as_u16() == 204 {
            return serde_json::from_value(Value::Null)
                .map_err(|e| Error::backend(format!("decode {path}"), e));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Error::backend(format!("decode {path}"), e))
    }
}

/// 401/403 are authorization failures, other 4xx are the caller's fault, the rest is
/// treated as transient.
pub(crate) fn error_for_status(code: u16, message: String) -> Error {
    match code {
        401 | 403 => Error::Unauthorized(message),
        404 => Error::NotFound(message),
        400..=499 => Error::InvalidInput(format!("backend rejected request ({code}): {message}")),
        _ => Error::BackendMessage(format!("backend returned {code}: {message}")),
    }
}

/// Strip the `{success, data}` envelope when present.
pub(crate) fn unwrap_envelope(value: Value) -> Result<Value> {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            if map.get("success").and_then(Value::as_bool) == Some(false) {
                let message = map
                    .get("message")
                    .or_else(|| map.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string();
                return Err(Error::BackendMessage(message));
            }
            Ok(map.remove("data").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

pub(crate) fn unwrap_list(value: Value) -> Result<Vec<Value>> {
    match unwrap_envelope(value)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(Error::BackendMessage(format!(
            "expected a list, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileBody<'a> {
    entity_type: &'a str,
}

fn reconcile_entity_type(target: ReconcileTarget) -> &'static str {
    match target {
        ReconcileTarget::Entity(kind) => kind.as_str(),
        ReconcileTarget::All => "all",
    }
}

#[async_trait]
impl BackendStore for HttpBackendStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_companies(&self, credentials: &Credentials) -> Result<Vec<Company>> {
        let raw: Value = self
            .request_json(Method::GET, "/companies", None::<&()>, None::<&()>, credentials)
            .await?;
        unwrap_list(raw)?
            .into_iter()
            .map(|v| {
                serde_json::from_value::<Company>(v)
                    .map_err(|e| Error::backend("decode company", e))
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, credentials))]
    async fn master_mapping(
        &self,
        company_id: CompanyId,
        credentials: &Credentials,
    ) -> Result<Value> {
        let raw: Value = self
            .request_json(
                Method::GET,
                &format!("/api/companies/{company_id}/master-mapping"),
                None::<&()>,
                None::<&()>,
                credentials,
            )
            .await?;
        unwrap_envelope(raw)
    }

    #[tracing::instrument(level = "debug", skip(self, credentials))]
    async fn list_entity_records(
        &self,
        company_id: CompanyId,
        entity: EntityKind,
        query: ListQuery,
        credentials: &Credentials,
    ) -> Result<Vec<Value>> {
        let raw: Value = self
            .request_json(
                Method::GET,
                &format!("/{}/company/{company_id}", entity.collection_path()),
                Some(&query),
                None::<&()>,
                credentials,
            )
            .await?;
        unwrap_list(raw)
    }

    #[tracing::instrument(level = "debug", skip(self, credentials))]
    async fn update_company_status(
        &self,
        company_id: CompanyId,
        update: &CompanyStatusUpdate,
        credentials: &Credentials,
    ) -> Result<()> {
        let _: Value = self
            .request_json(
                Method::PUT,
                &format!("/companies/{company_id}/sync-status"),
                None::<&()>,
                Some(update),
                credentials,
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, credentials))]
    async fn reconcile(
        &self,
        company_id: CompanyId,
        target: ReconcileTarget,
        credentials: &Credentials,
    ) -> Result<ReconcileReport> {
        let raw: Value = self
            .request_json(
                Method::POST,
                &format!("/api/companies/{company_id}/reconcile"),
                None::<&()>,
                Some(&ReconcileBody {
                    entity_type: reconcile_entity_type(target),
                }),
                credentials,
            )
            .await?;
        serde_json::from_value(unwrap_envelope(raw)?)
            .map_err(|e| Error::backend("decode reconcile report", e))
    }
}
