//! BigQuery event fetcher over the v2 REST API.
//!
//! `jobs.query` starts the query; `jobs.getQueryResults` is polled until the job
//! completes and then paged with `pageToken` until the result set is drained.

use std::collections::HashMap;
use std::env;
use std::process::Command;
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::query::RESULT_COLUMNS;
use crate::{EventName, PropertyKey, RawEventRow};

pub const BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Source of raw extract rows. Implemented by [`BigQueryClient`]; tests pass
/// in-memory fetchers.
pub trait EventFetcher {
    fn fetch_events(&self, sql: &str) -> Result<Vec<RawEventRow>, WarehouseError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseConfig {
    pub base_url: String,
    pub billing_project: String,
    pub location: Option<String>,
    pub http_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub job_timeout_ms: u64,
    pub page_size: u32,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            base_url: BIGQUERY_BASE_URL.to_string(),
            billing_project: String::new(),
            location: None,
            http_timeout_ms: 60_000,
            poll_timeout_ms: 10_000,
            job_timeout_ms: 600_000,
            page_size: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("no warehouse credentials: set GOOGLE_OAUTH_ACCESS_TOKEN or log in with gcloud ({0})")]
    MissingCredentials(String),
    #[error("no billing project: pass one explicitly or use a project-qualified table")]
    MissingBillingProject,
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("invalid request URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("warehouse returned HTTP {status} for {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode warehouse response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed warehouse response: {0}")]
    MalformedResponse(String),
    #[error("result schema is missing column {0}")]
    MissingColumn(&'static str),
    #[error("row {row}: field {field} has invalid value '{value}'")]
    InvalidField {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("query job {job_id} did not complete within {timeout_ms}ms")]
    JobTimeout { job_id: String, timeout_ms: u64 },
}

/// Project segment of a `project.dataset.table` pattern.
pub fn billing_project_from_table(table_pattern: &str) -> Option<String> {
    let trimmed = table_pattern.trim().trim_matches('`');
    let mut parts = trimmed.split('.');
    let project = parts.next()?;
    let dataset = parts.next();
    let table = parts.next();
    match (dataset, table, parts.next()) {
        (Some(_), Some(_), None) if !project.is_empty() => Some(project.to_string()),
        _ => None,
    }
}

/// Access token from the environment, else from `gcloud auth print-access-token`.
pub fn resolve_access_token() -> Result<String, WarehouseError> {
    if let Ok(token) = env::var(ACCESS_TOKEN_ENV) {
        let trimmed = token.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let output = Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .map_err(|err| WarehouseError::MissingCredentials(err.to_string()))?;
    if !output.status.success() {
        return Err(WarehouseError::MissingCredentials(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(WarehouseError::MissingCredentials(
            "gcloud printed an empty token".to_string(),
        ));
    }
    Ok(token)
}

pub struct BigQueryClient {
    cfg: WarehouseConfig,
    transport: Box<dyn WarehouseTransport>,
}

impl BigQueryClient {
    pub fn new(cfg: WarehouseConfig, access_token: String) -> Result<Self, WarehouseError> {
        if cfg.billing_project.trim().is_empty() {
            return Err(WarehouseError::MissingBillingProject);
        }
        let transport = ReqwestBlockingTransport::new(cfg.http_timeout_ms, access_token)?;
        Ok(Self {
            cfg,
            transport: Box::new(transport),
        })
    }

    #[cfg(test)]
    fn with_transport(cfg: WarehouseConfig, transport: Box<dyn WarehouseTransport>) -> Self {
        Self { cfg, transport }
    }

    fn start_query(&self, sql: &str) -> Result<QueryResponse, WarehouseError> {
        let url = format!(
            "{}/projects/{}/queries",
            self.cfg.base_url, self.cfg.billing_project
        );
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "maxResults": self.cfg.page_size,
            "timeoutMs": self.cfg.poll_timeout_ms,
        });
        if let Some(location) = &self.cfg.location {
            body["location"] = Value::String(location.clone());
        }

        let bytes = self.transport.post_json(&url, &body)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, WarehouseError> {
        let base = format!(
            "{}/projects/{}/queries/{}",
            self.cfg.base_url, job.project_id, job.job_id
        );
        let mut params = vec![
            ("maxResults", self.cfg.page_size.to_string()),
            ("timeoutMs", self.cfg.poll_timeout_ms.to_string()),
        ];
        if let Some(location) = job.location.as_ref().or(self.cfg.location.as_ref()) {
            params.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let url = Url::parse_with_params(&base, &params).map_err(|err| {
            WarehouseError::InvalidUrl {
                url: base.clone(),
                message: err.to_string(),
            }
        })?;
        let bytes = self.transport.get(url.as_str())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl EventFetcher for BigQueryClient {
    fn fetch_events(&self, sql: &str) -> Result<Vec<RawEventRow>, WarehouseError> {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.cfg.job_timeout_ms);
        info!(
            component = "warehouse",
            event = "warehouse.query.start",
            billing_project = %self.cfg.billing_project,
            location = self.cfg.location.as_deref().unwrap_or("default")
        );
        debug!(component = "warehouse", event = "warehouse.query.sql", sql);

        let mut response = self.start_query(sql)?;
        log_response_errors(&response);

        while !response.job_complete {
            let job = response.job_reference.as_ref().ok_or_else(|| {
                WarehouseError::MalformedResponse("incomplete job without jobReference".to_string())
            })?;
            if started.elapsed() >= deadline {
                return Err(WarehouseError::JobTimeout {
                    job_id: job.job_id.clone(),
                    timeout_ms: self.cfg.job_timeout_ms,
                });
            }
            debug!(
                component = "warehouse",
                event = "warehouse.query.poll",
                job_id = %job.job_id,
                elapsed_ms = started.elapsed().as_millis() as u64
            );
            response = self.query_results(job, None)?;
            log_response_errors(&response);
        }

        let schema = response.schema.as_ref().ok_or_else(|| {
            WarehouseError::MalformedResponse("completed job without schema".to_string())
        })?;
        let columns = ColumnIndex::from_schema(schema)?;
        let job = response.job_reference.clone();

        let mut rows = Vec::new();
        let mut page = 0usize;
        loop {
            page += 1;
            for table_row in &response.rows {
                rows.push(decode_row(&columns, table_row, rows.len())?);
            }
            debug!(
                component = "warehouse",
                event = "warehouse.query.page",
                page,
                page_rows = response.rows.len(),
                total_rows = rows.len()
            );

            let Some(token) = response.page_token.take() else {
                break;
            };
            let job = job.as_ref().ok_or_else(|| {
                WarehouseError::MalformedResponse("pageToken without jobReference".to_string())
            })?;
            response = self.query_results(job, Some(&token))?;
            log_response_errors(&response);
        }

        info!(
            component = "warehouse",
            event = "warehouse.query.finish",
            rows = rows.len(),
            pages = page,
            elapsed_ms = started.elapsed().as_millis() as u64
        );
        Ok(rows)
    }
}

fn log_response_errors(response: &QueryResponse) {
    for error in &response.errors {
        warn!(
            component = "warehouse",
            event = "warehouse.query.job_error",
            reason = error.reason.as_deref().unwrap_or("unknown"),
            message = error.message.as_deref().unwrap_or("")
        );
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableFieldSchema {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    event_date: usize,
    event_timestamp: usize,
    event_name: usize,
    user_pseudo_id: usize,
    key: usize,
    string_value: usize,
}

impl ColumnIndex {
    fn from_schema(schema: &TableSchema) -> Result<Self, WarehouseError> {
        let positions: HashMap<&str, usize> = schema
            .fields
            .iter()
            .enumerate()
            .map(|(idx, field)| (field.name.as_str(), idx))
            .collect();
        let find = |name: &'static str| {
            positions
                .get(name)
                .copied()
                .ok_or(WarehouseError::MissingColumn(name))
        };

        let [event_date, event_timestamp, event_name, user_pseudo_id, key, string_value] =
            RESULT_COLUMNS;
        Ok(Self {
            event_date: find(event_date)?,
            event_timestamp: find(event_timestamp)?,
            event_name: find(event_name)?,
            user_pseudo_id: find(user_pseudo_id)?,
            key: find(key)?,
            string_value: find(string_value)?,
        })
    }
}

fn decode_row(
    columns: &ColumnIndex,
    table_row: &TableRow,
    row: usize,
) -> Result<RawEventRow, WarehouseError> {
    let timestamp_raw = required_cell(table_row, columns.event_timestamp, row, "event_timestamp")?;
    let event_timestamp =
        timestamp_raw
            .parse::<i64>()
            .map_err(|_| WarehouseError::InvalidField {
                row,
                field: "event_timestamp",
                value: timestamp_raw.to_string(),
            })?;

    Ok(RawEventRow {
        event_date: required_cell(table_row, columns.event_date, row, "event_date")?.to_string(),
        event_timestamp,
        event_name: EventName::parse(required_cell(
            table_row,
            columns.event_name,
            row,
            "event_name",
        )?),
        user_pseudo_id: required_cell(table_row, columns.user_pseudo_id, row, "user_pseudo_id")?
            .to_string(),
        key: PropertyKey::parse(required_cell(table_row, columns.key, row, "key")?),
        string_value: optional_cell(table_row, columns.string_value, row, "string_value")?
            .map(str::to_string),
    })
}

fn optional_cell<'a>(
    table_row: &'a TableRow,
    idx: usize,
    row: usize,
    field: &'static str,
) -> Result<Option<&'a str>, WarehouseError> {
    match table_row.f.get(idx).map(|cell| &cell.v) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.as_str())),
        Some(other) => Err(WarehouseError::InvalidField {
            row,
            field,
            value: other.to_string(),
        }),
    }
}

fn required_cell<'a>(
    table_row: &'a TableRow,
    idx: usize,
    row: usize,
    field: &'static str,
) -> Result<&'a str, WarehouseError> {
    optional_cell(table_row, idx, row, field)?.ok_or_else(|| WarehouseError::InvalidField {
        row,
        field,
        value: "null".to_string(),
    })
}

trait WarehouseTransport {
    fn post_json(&self, url: &str, body: &Value) -> Result<Vec<u8>, WarehouseError>;
    fn get(&self, url: &str) -> Result<Vec<u8>, WarehouseError>;
}

struct ReqwestBlockingTransport {
    client: reqwest::blocking::Client,
    access_token: String,
}

impl ReqwestBlockingTransport {
    fn new(timeout_ms: u64, access_token: String) -> Result<Self, WarehouseError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| WarehouseError::HttpClientBuild(err.to_string()))?;
        Ok(Self {
            client,
            access_token,
        })
    }

    fn finish(
        url: &str,
        sent: reqwest::Result<reqwest::blocking::Response>,
    ) -> Result<Vec<u8>, WarehouseError> {
        let response = sent.map_err(|err| WarehouseError::HttpRequest {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| WarehouseError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        if !status.is_success() {
            return Err(WarehouseError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }
        Ok(bytes)
    }
}

impl WarehouseTransport for ReqwestBlockingTransport {
    fn post_json(&self, url: &str, body: &Value) -> Result<Vec<u8>, WarehouseError> {
        let payload = serde_json::to_vec(body)?;
        let sent = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send();
        Self::finish(url, sent)
    }

    fn get(&self, url: &str) -> Result<Vec<u8>, WarehouseError> {
        let sent = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send();
        Self::finish(url, sent)
    }
}
