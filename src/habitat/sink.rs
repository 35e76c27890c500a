// Habitat - Terrarium temperature, humidity, and water level monitor
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::http::{send_json, HttpError, HttpsClient, JsonResponse};
use async_trait::async_trait;
use hyper::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_DATABASE: &str = "desert_habitat";
pub const DEFAULT_TABLE: &str = "habitat_iot";
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_WRITE_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// A record the backend refused to store, by position in the write request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RejectedRecord {
    pub record_index: usize,
    pub reason: String,
    #[serde(default)]
    pub existing_version: Option<i64>,
}

impl fmt::Display for RejectedRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "record {}: {}", self.record_index, self.reason)?;
        if let Some(v) = self.existing_version {
            write!(f, " (existing version {})", v)?;
        }
        Ok(())
    }
}

/// Error writing measurements to the time-series backend.
#[derive(Debug)]
pub enum SinkError {
    Http(HttpError),
    Status(StatusCode, String),
    RejectedRecords(Vec<RejectedRecord>),
}

impl SinkError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SinkError::Http(e) => e.as_label(),
            SinkError::Status(_, _) => "status",
            SinkError::RejectedRecords(_) => "rejected",
        }
    }

    /// True for failures that may succeed if the write is sent again: transport
    /// errors, timeouts, server errors, and throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Http(_) => true,
            SinkError::Status(s, _) => s.is_server_error() || *s == StatusCode::TOO_MANY_REQUESTS,
            SinkError::RejectedRecords(_) => false,
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Http(e) => write!(f, "unable to write records: {}", e),
            SinkError::Status(s, body) => write!(f, "write failed with status {}: {}", s, body),
            SinkError::RejectedRecords(r) => write!(f, "{} records rejected", r.len()),
        }
    }
}

impl Error for SinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SinkError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HttpError> for SinkError {
    fn from(e: HttpError) -> Self {
        SinkError::Http(e)
    }
}

/// Durable storage for measurements, used to graph the enclosure over time.
#[async_trait]
pub trait MetricsSink {
    /// Store a set of named measurements taken at `timestamp`.
    async fn write_measurements(&self, timestamp: SystemTime, measurements: &[(&str, f64)]) -> Result<(), SinkError>;
}

#[async_trait]
impl<T> MetricsSink for Box<T>
where
    T: MetricsSink + Send + Sync + ?Sized,
{
    async fn write_measurements(&self, timestamp: SystemTime, measurements: &[(&str, f64)]) -> Result<(), SinkError> {
        (**self).write_measurements(timestamp, measurements).await
    }
}

/// Sink used when uploads are turned off. Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disabled;

#[async_trait]
impl MetricsSink for Disabled {
    async fn write_measurements(&self, _timestamp: SystemTime, measurements: &[(&str, f64)]) -> Result<(), SinkError> {
        tracing::debug!(message = "uploads disabled, dropping measurements", count = measurements.len());
        Ok(())
    }
}

/// How long the backend keeps records in each storage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Retention {
    pub memory_store_hours: u32,
    pub magnetic_store_days: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            memory_store_hours: 24,
            magnetic_store_days: 6,
        }
    }
}

/// Location and layout of the table measurements are written to.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesConfig {
    pub endpoint: String,
    pub database: String,
    pub table: String,
    pub dimensions: Vec<(String, String)>,
    pub retention: Retention,
    pub timeout: Duration,
    /// Total tries for each write, including the first
    pub attempts: u32,
    /// Wait before the first retry of a write, doubled for each one after
    pub retry_delay: Duration,
}

impl TimeSeriesConfig {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            database: DEFAULT_DATABASE.to_owned(),
            table: DEFAULT_TABLE.to_owned(),
            dimensions: vec![("habitat".to_owned(), "desert".to_owned())],
            retention: Retention::default(),
            timeout: DEFAULT_SINK_TIMEOUT,
            attempts: DEFAULT_WRITE_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Serialize)]
struct Dimension<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct CommonAttributes<'a> {
    dimensions: Vec<Dimension<'a>>,
    measure_value_type: &'static str,
    time: String,
}

#[derive(Debug, Serialize)]
struct Record<'a> {
    measure_name: &'a str,
    measure_value: String,
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    common_attributes: CommonAttributes<'a>,
    records: Vec<Record<'a>>,
}

#[derive(Debug, Serialize)]
struct TableRequest {
    retention: Retention,
}

#[derive(Debug, Default, Deserialize)]
struct RejectedBody {
    #[serde(default)]
    rejected_records: Vec<RejectedRecord>,
}

/// Outcome of a provisioning request that may find the resource already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provisioned {
    Created,
    Exists,
}

/// Sink that writes to a table of a time-series database over its JSON HTTP API.
///
/// The database and table (and its retention) are created or updated when the
/// sink is connected, so pointing it at an empty backend is enough to start
/// recording.
pub struct HttpTimeSeriesSink {
    client: HttpsClient,
    config: TimeSeriesConfig,
}

impl HttpTimeSeriesSink {
    /// Create a sink and provision its database and table. Provisioning failures
    /// are logged rather than returned since the backend may already be set up
    /// and simply unreachable for the moment.
    pub async fn connect(client: HttpsClient, config: TimeSeriesConfig) -> Self {
        let sink = Self { client, config };
        sink.provision().await;
        sink
    }

    fn database_url(&self) -> String {
        format!("{}/databases/{}", self.config.endpoint, self.config.database)
    }

    fn table_url(&self) -> String {
        format!("{}/tables/{}", self.database_url(), self.config.table)
    }

    fn records_url(&self) -> String {
        format!("{}/records", self.table_url())
    }

    async fn provision(&self) {
        match self.create(self.database_url(), &serde_json::json!({})).await {
            Ok(Provisioned::Created) => {
                tracing::info!(message = "created database", database = %self.config.database);
            }
            Ok(Provisioned::Exists) => {
                tracing::info!(message = "database already exists", database = %self.config.database);
            }
            Err(e) => {
                tracing::error!(message = "create database failed", database = %self.config.database, error = %e);
            }
        }

        let table = TableRequest {
            retention: self.config.retention,
        };

        match self.create(self.table_url(), &table).await {
            Ok(Provisioned::Created) => {
                tracing::info!(message = "created table", table = %self.config.table);
            }
            Ok(Provisioned::Exists) => {
                tracing::info!(message = "table already exists", table = %self.config.table);
            }
            Err(e) => {
                tracing::error!(message = "create table failed", table = %self.config.table, error = %e);
            }
        }

        // Retention of an existing table may differ from what's configured
        match self.update(self.table_url(), &table).await {
            Ok(_) => {
                tracing::info!(
                    message = "updated table retention",
                    table = %self.config.table,
                    memory_store_hours = self.config.retention.memory_store_hours,
                    magnetic_store_days = self.config.retention.magnetic_store_days
                );
            }
            Err(e) => {
                tracing::error!(message = "update table failed", table = %self.config.table, error = %e);
            }
        }
    }

    async fn create<T: Serialize + Sync>(&self, url: String, body: &T) -> Result<Provisioned, SinkError> {
        let res = send_json(&self.client, Method::PUT, &url, body, self.config.timeout).await?;
        match res.status {
            StatusCode::CONFLICT => Ok(Provisioned::Exists),
            s if s.is_success() => Ok(Provisioned::Created),
            s => Err(SinkError::Status(s, body_text(&res))),
        }
    }

    async fn update<T: Serialize + Sync>(&self, url: String, body: &T) -> Result<(), SinkError> {
        let res = send_json(&self.client, Method::PATCH, &url, body, self.config.timeout).await?;
        if res.status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Status(res.status, body_text(&res)))
        }
    }

    async fn write_once(&self, url: &str, req: &WriteRequest<'_>) -> Result<(), SinkError> {
        let res = send_json(&self.client, Method::POST, url, req, self.config.timeout).await?;
        if res.status.is_success() {
            return Ok(());
        }

        let rejected: RejectedBody = serde_json::from_slice(&res.body).unwrap_or_default();
        if rejected.rejected_records.is_empty() {
            Err(SinkError::Status(res.status, body_text(&res)))
        } else {
            Err(SinkError::RejectedRecords(rejected.rejected_records))
        }
    }

    fn write_request<'a>(&'a self, timestamp: SystemTime, measurements: &'a [(&'a str, f64)]) -> WriteRequest<'a> {
        // Clocks before the epoch are a misconfigured device, record them at zero
        let millis = timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        WriteRequest {
            common_attributes: CommonAttributes {
                dimensions: self
                    .config
                    .dimensions
                    .iter()
                    .map(|(name, value)| Dimension { name, value })
                    .collect(),
                measure_value_type: "DOUBLE",
                time: millis.to_string(),
            },
            records: measurements
                .iter()
                .map(|(name, value)| Record {
                    measure_name: name,
                    measure_value: value.to_string(),
                })
                .collect(),
        }
    }
}

fn body_text(res: &JsonResponse) -> String {
    String::from_utf8_lossy(&res.body).into_owned()
}

#[async_trait]
impl MetricsSink for HttpTimeSeriesSink {
    async fn write_measurements(&self, timestamp: SystemTime, measurements: &[(&str, f64)]) -> Result<(), SinkError> {
        let req = self.write_request(timestamp, measurements);
        let url = self.records_url();
        let mut delay = self.config.retry_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.write_once(&url, &req).await {
                Ok(_) => {
                    tracing::info!(message = "wrote records", count = measurements.len(), attempt = attempt);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.config.attempts {
                return Err(err);
            }

            tracing::warn!(
                message = "write records failed, retrying",
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }
}

impl fmt::Debug for HttpTimeSeriesSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTimeSeriesSink").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod test {
    use super::{HttpTimeSeriesSink, MetricsSink, RejectedRecord, SinkError, TimeSeriesConfig};
    use crate::http::https_client;
    use crate::http::test::spawn_server;
    use hyper::{Method, StatusCode};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    const MEASUREMENTS: [(&str, f64); 2] = [("basking_temp_f", 95.5), ("water_level_pct", 50.0)];

    fn fast_retries(url: &str, attempts: u32) -> TimeSeriesConfig {
        let mut config = TimeSeriesConfig::new(url);
        config.attempts = attempts;
        config.retry_delay = Duration::from_millis(1);
        config
    }

    fn posts(requests: &[crate::http::test::Recorded]) -> usize {
        requests.iter().filter(|r| r.method == Method::POST).count()
    }

    #[tokio::test]
    async fn test_connect_creates_and_updates_table() {
        let (url, requests) = spawn_server(|_, _| (StatusCode::CREATED, String::new()));

        let _sink = HttpTimeSeriesSink::connect(https_client(), TimeSeriesConfig::new(&url)).await;

        let recorded = requests.lock().unwrap();
        let methods: Vec<Method> = recorded.iter().map(|r| r.method.clone()).collect();
        assert_eq!(vec![Method::PUT, Method::PUT, Method::PATCH], methods);
    }

    #[tokio::test]
    async fn test_connect_creates_database_and_updates_existing_table() {
        let (url, requests) = spawn_server(|method, path| match (method, path) {
            (&Method::PUT, "/databases/desert_habitat") => (StatusCode::CREATED, String::new()),
            (&Method::PUT, "/databases/desert_habitat/tables/habitat_iot") => (StatusCode::CONFLICT, String::new()),
            _ => (StatusCode::OK, String::new()),
        });

        let _sink = HttpTimeSeriesSink::connect(https_client(), TimeSeriesConfig::new(&url)).await;

        let recorded = requests.lock().unwrap();
        let calls: Vec<(Method, &str)> = recorded.iter().map(|r| (r.method.clone(), r.path.as_str())).collect();
        assert_eq!(
            vec![
                (Method::PUT, "/databases/desert_habitat"),
                (Method::PUT, "/databases/desert_habitat/tables/habitat_iot"),
                (Method::PATCH, "/databases/desert_habitat/tables/habitat_iot"),
            ],
            calls
        );
        assert_eq!(
            serde_json::json!({"retention": {"memory_store_hours": 24, "magnetic_store_days": 6}}),
            recorded[2].body
        );
    }

    #[tokio::test]
    async fn test_connect_tolerates_failures() {
        let (url, requests) = spawn_server(|_, _| (StatusCode::INTERNAL_SERVER_ERROR, "down".to_owned()));

        let _sink = HttpTimeSeriesSink::connect(https_client(), TimeSeriesConfig::new(&url)).await;

        // Every step is attempted even when earlier ones fail
        assert_eq!(3, requests.lock().unwrap().len());
    }

    #[tokio::test]
    async fn test_write_measurements() {
        let (url, requests) = spawn_server(|_, _| (StatusCode::OK, String::new()));
        let sink = HttpTimeSeriesSink::connect(https_client(), TimeSeriesConfig::new(&url)).await;

        let ts = UNIX_EPOCH + Duration::from_millis(1_650_000_000_123);
        sink.write_measurements(ts, &MEASUREMENTS).await.unwrap();

        let recorded = requests.lock().unwrap();
        let write = recorded.last().unwrap();
        assert_eq!(Method::POST, write.method);
        assert_eq!("/databases/desert_habitat/tables/habitat_iot/records", write.path);
        assert_eq!(
            serde_json::json!({
                "common_attributes": {
                    "dimensions": [{"name": "habitat", "value": "desert"}],
                    "measure_value_type": "DOUBLE",
                    "time": "1650000000123",
                },
                "records": [
                    {"measure_name": "basking_temp_f", "measure_value": "95.5"},
                    {"measure_name": "water_level_pct", "measure_value": "50"},
                ],
            }),
            write.body
        );
    }

    #[tokio::test]
    async fn test_write_measurements_retries_server_error() {
        let writes = Arc::new(AtomicU32::new(0));
        let seen = writes.clone();
        let (url, requests) = spawn_server(move |method, _| match method {
            &Method::POST if seen.fetch_add(1, Ordering::SeqCst) == 0 => {
                (StatusCode::SERVICE_UNAVAILABLE, "busy".to_owned())
            }
            _ => (StatusCode::OK, String::new()),
        });
        let sink = HttpTimeSeriesSink::connect(https_client(), fast_retries(&url, 10)).await;

        sink.write_measurements(UNIX_EPOCH, &MEASUREMENTS).await.unwrap();

        assert_eq!(2, posts(&requests.lock().unwrap()));
    }

    #[tokio::test]
    async fn test_write_measurements_retries_throttling() {
        let writes = Arc::new(AtomicU32::new(0));
        let seen = writes.clone();
        let (url, requests) = spawn_server(move |method, _| match method {
            &Method::POST if seen.fetch_add(1, Ordering::SeqCst) < 2 => {
                (StatusCode::TOO_MANY_REQUESTS, "slow down".to_owned())
            }
            _ => (StatusCode::OK, String::new()),
        });
        let sink = HttpTimeSeriesSink::connect(https_client(), fast_retries(&url, 10)).await;

        sink.write_measurements(UNIX_EPOCH, &MEASUREMENTS).await.unwrap();

        assert_eq!(3, posts(&requests.lock().unwrap()));
    }

    #[tokio::test]
    async fn test_write_measurements_rejected() {
        let (url, requests) = spawn_server(|method, _| match method {
            &Method::POST => (
                StatusCode::CONFLICT,
                r#"{"rejected_records":[{"record_index":1,"reason":"duplicate","existing_version":3}]}"#.to_owned(),
            ),
            _ => (StatusCode::OK, String::new()),
        });
        let sink = HttpTimeSeriesSink::connect(https_client(), fast_retries(&url, 10)).await;

        match sink.write_measurements(UNIX_EPOCH, &MEASUREMENTS).await {
            Err(SinkError::RejectedRecords(records)) => {
                assert_eq!(
                    vec![RejectedRecord {
                        record_index: 1,
                        reason: "duplicate".to_owned(),
                        existing_version: Some(3),
                    }],
                    records
                );
                assert_eq!("record 1: duplicate (existing version 3)", records[0].to_string());
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Rejected records would be rejected again
        assert_eq!(1, posts(&requests.lock().unwrap()));
    }

    #[tokio::test]
    async fn test_write_measurements_server_error_exhausts_attempts() {
        let (url, requests) = spawn_server(|method, _| match method {
            &Method::POST => (StatusCode::SERVICE_UNAVAILABLE, "try later".to_owned()),
            _ => (StatusCode::OK, String::new()),
        });
        let sink = HttpTimeSeriesSink::connect(https_client(), fast_retries(&url, 3)).await;

        let err = sink.write_measurements(UNIX_EPOCH, &MEASUREMENTS).await.unwrap_err();
        assert_eq!("status", err.as_label());
        assert_eq!(3, posts(&requests.lock().unwrap()));
    }

    #[tokio::test]
    async fn test_write_measurements_bad_request_not_retried() {
        let (url, requests) = spawn_server(|method, _| match method {
            &Method::POST => (StatusCode::BAD_REQUEST, "malformed".to_owned()),
            _ => (StatusCode::OK, String::new()),
        });
        let sink = HttpTimeSeriesSink::connect(https_client(), fast_retries(&url, 10)).await;

        let err = sink.write_measurements(UNIX_EPOCH, &MEASUREMENTS).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(1, posts(&requests.lock().unwrap()));
    }
}
