use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::record::{FieldValues, Record, RowId};

/// Mutation interface of the host's row store.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn apply_update(
        &self,
        table_id: &str,
        row_id: RowId,
        fields: FieldValues,
    ) -> AppResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedUpdate {
    pub table_id: String,
    pub row_id: RowId,
    pub fields: FieldValues,
}

/// Keeps every applied update in order of arrival.
#[derive(Default)]
pub struct MemoryStore {
    updates: Mutex<Vec<AppliedUpdate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<AppliedUpdate> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    async fn apply_update(
        &self,
        table_id: &str,
        row_id: RowId,
        fields: FieldValues,
    ) -> AppResult<()> {
        self.updates.lock().push(AppliedUpdate {
            table_id: table_id.to_string(),
            row_id,
            fields,
        });
        Ok(())
    }
}

/// Logs updates instead of writing them.
#[derive(Default)]
pub struct DryRunStore;

#[async_trait]
impl HostStore for DryRunStore {
    async fn apply_update(
        &self,
        table_id: &str,
        row_id: RowId,
        fields: FieldValues,
    ) -> AppResult<()> {
        info!(
            target: "dry_run",
            table_id,
            row_id,
            fields = %serde_json::Value::Object(fields),
            "would update record"
        );
        Ok(())
    }
}

/// Grist document REST API.
#[derive(Clone)]
pub struct GristClient {
    http: Client,
    docs_url: String,
    api_key: Option<SecretString>,
}

#[derive(Deserialize)]
struct RecordsResponse {
    records: Vec<Record>,
}

impl GristClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let doc_id = config
            .grist_doc_id
            .as_deref()
            .ok_or_else(|| AppError::Config("GRIST_DOC_ID is not set".into()))?;
        let http = Client::builder()
            .timeout(Duration::from_millis(config.geocode_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            docs_url: format!(
                "{}/api/docs/{}",
                config.grist_server.trim_end_matches('/'),
                doc_id
            ),
            api_key: config.grist_api_key.clone(),
        })
    }

    fn records_url(&self, table_id: &str) -> String {
        format!("{}/tables/{}/records", self.docs_url, table_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    pub async fn fetch_records(&self, table_id: &str) -> AppResult<Vec<Record>> {
        let response = self
            .authorize(self.http.get(self.records_url(table_id)))
            .send()
            .await?;
        let parsed: RecordsResponse = ensure_success(response).await?.json().await?;
        debug!(table_id, count = parsed.records.len(), "fetched records");
        Ok(parsed.records)
    }
}

#[async_trait]
impl HostStore for GristClient {
    async fn apply_update(
        &self,
        table_id: &str,
        row_id: RowId,
        fields: FieldValues,
    ) -> AppResult<()> {
        let body = json!({ "records": [{ "id": row_id, "fields": fields }] });
        let response = self
            .authorize(self.http.patch(self.records_url(table_id)))
            .json(&body)
            .send()
            .await?;
        ensure_success(response).await?;
        debug!(table_id, row_id, "record updated");
        Ok(())
    }
}

async fn ensure_success(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Host {
        status: status.as_u16(),
        body,
    })
}
