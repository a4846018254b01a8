//! ClickHouse over its HTTP interface.
//!
//! Statements go in the `query` parameter, row data in the request body as
//! `JSONCompactEachRow`: one JSON array per line, positional per schema.

use super::{quote_identifier, StoreClient, TableRef};
use crate::config::ClickHouseConfig;
use crate::decode::DecodedRow;
use crate::schema::{ColumnSpec, Schema};
use crate::{Error, Result, StoreError};
use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Settings for `DESC format(...)`: infer exact types, keep nulls visible.
const DESCRIBE_SETTINGS: &[(&str, &str)] = &[
    ("schema_inference_make_columns_nullable", "0"),
    ("input_format_null_as_default", "0"),
];

/// Settings for inserts: nulls take the column default, lenient timestamps,
/// nested objects land in `String` columns as JSON text.
const INSERT_SETTINGS: &[(&str, &str)] = &[
    ("input_format_null_as_default", "1"),
    ("date_time_input_format", "best_effort"),
    ("input_format_json_read_objects_as_strings", "1"),
];

/// HTTP client for one ClickHouse endpoint.
#[derive(Debug, Clone)]
pub struct ClickHouseClient {
    http: reqwest::Client,
    url: String,
    database: String,
    user: String,
    password: String,
    timeout: Duration,
}

/// `FORMAT JSONCompact` response body.
#[derive(Debug, Deserialize)]
struct JsonCompactResponse {
    data: Vec<Vec<serde_json::Value>>,
}

impl ClickHouseClient {
    /// Build a client without touching the network.
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: config.url(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            timeout,
        })
    }

    /// Build a client and prove the server answers.
    pub async fn connect(config: &ClickHouseConfig) -> Result<Self> {
        let client = Self::new(config)?;
        client.ping().await.map_err(|e| {
            Error::Store(StoreError::ConnectionFailed {
                url: client.url.clone(),
                message: e.to_string(),
            })
        })?;

        info!(url = %client.url, database = %client.database, "Connected to ClickHouse");
        Ok(client)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Bound a request future by the configured timeout.
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(operation)),
        }
    }

    fn timeout_error(&self, operation: &str) -> Error {
        Error::Store(StoreError::Timeout {
            operation: operation.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        })
    }

    /// POST one statement and return the response body.
    async fn send(
        &self,
        operation: &str,
        query: &str,
        body: String,
        settings: &[(&str, &str)],
    ) -> Result<String> {
        let mut params: Vec<(&str, &str)> = Vec::with_capacity(settings.len() + 2);
        params.push(("database", self.database.as_str()));
        params.push(("query", query));
        params.extend_from_slice(settings);

        let request = self
            .http
            .post(&self.url)
            .query(&params)
            .basic_auth(&self.user, Some(&self.password))
            .body(body);

        let started = Instant::now();
        let fut = async {
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    self.timeout_error(operation)
                } else {
                    Error::Store(StoreError::Request(e.to_string()))
                }
            })?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| Error::Store(StoreError::Request(e.to_string())))?;

            if !status.is_success() {
                return Err(Error::Store(StoreError::QueryFailed {
                    status: status.as_u16(),
                    message: text.trim().to_string(),
                }));
            }
            Ok(text)
        };

        let result = self.bounded(operation, fut).await;
        debug!(
            operation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "ClickHouse request finished"
        );
        result
    }
}

/// Quote a value as a single-quoted SQL string literal.
fn string_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn describe_query(sample: &str) -> String {
    format!(
        "DESC format(JSONEachRow, {}) FORMAT JSONCompact",
        string_literal(sample)
    )
}

fn parse_describe(body: &str) -> Result<Vec<ColumnSpec>> {
    let response: JsonCompactResponse = serde_json::from_str(body)
        .map_err(|e| Error::Store(StoreError::UnexpectedResponse(e.to_string())))?;

    response
        .data
        .into_iter()
        .map(|row| match (row.first(), row.get(1)) {
            (Some(serde_json::Value::String(name)), Some(serde_json::Value::String(ty))) => {
                Ok(ColumnSpec::new(name.clone(), ty.clone()))
            }
            _ => Err(Error::Store(StoreError::UnexpectedResponse(format!(
                "DESC row without name and type: {:?}",
                row
            )))),
        })
        .collect()
}

fn insert_query(table: &TableRef, schema: &Schema) -> String {
    let columns: Vec<String> = schema.names().map(quote_identifier).collect();
    format!(
        "INSERT INTO {} ({}) FORMAT JSONCompactEachRow",
        table.qualified(),
        columns.join(", ")
    )
}

fn insert_body(rows: &[DecodedRow]) -> Result<String> {
    let mut body = String::new();
    for row in rows {
        body.push_str(&serde_json::to_string(&row.values)?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl StoreClient for ClickHouseClient {
    async fn ping(&self) -> Result<()> {
        let body = self.send("ping", "SELECT 1", String::new(), &[]).await?;
        if body.trim() == "1" {
            Ok(())
        } else {
            Err(Error::Store(StoreError::UnexpectedResponse(body)))
        }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.send("execute", sql, String::new(), &[]).await?;
        Ok(())
    }

    async fn describe_json(&self, sample: &str) -> Result<Vec<ColumnSpec>> {
        let body = self
            .send("describe", &describe_query(sample), String::new(), DESCRIBE_SETTINGS)
            .await?;
        parse_describe(&body)
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        schema: &Schema,
        rows: &[DecodedRow],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let body = insert_body(rows)?;
        self.send("insert", &insert_query(table, schema), body, INSERT_SETTINGS)
            .await
            .map_err(|e| {
                Error::Store(StoreError::InsertFailed {
                    table: table.to_string(),
                    rows: rows.len(),
                    message: e.to_string(),
                })
            })?;
        Ok(())
    }
}
