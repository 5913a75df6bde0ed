//! Upstream REST client: paginated location listing, bulk character fetches,
//! retry with exponential backoff and classification of upstream failures.

use std::env;
use std::fmt;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::{
    DEFAULT_MAX_RETRIES, DEFAULT_RATE_LIMIT_MS, DEFAULT_RETRY_DELAY_MS, DEFAULT_TIMEOUT_MS,
    SyncConfig,
};
use crate::store::CharacterRow;

/// What a request was for; carried into every log line and error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    LocationPage(u32),
    CharacterBatch(Vec<i64>),
    Character(i64),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocationPage(page) => write!(f, "location page {page}"),
            Self::CharacterBatch(ids) => write!(f, "character batch {ids:?}"),
            Self::Character(id) => write!(f, "character {id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request for {operation}: {detail}")]
    InvalidRequest { operation: String, detail: String },
    #[error("client error for {operation}: HTTP {status}")]
    Client { operation: String, status: StatusCode },
    #[error("server error for {operation}: HTTP {status}")]
    Server { operation: String, status: StatusCode },
    #[error("transport failure for {operation}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response shape for {operation}: {detail}")]
    Shape { operation: String, detail: String },
    #[error("{operation} failed after {attempts} attempts")]
    Exhausted {
        operation: String,
        attempts: usize,
        #[source]
        last: Box<ApiError>,
    },
}

impl ApiError {
    /// Only upstream 5xx responses and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Server { .. } | Self::Transport { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Exhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    fn from_status(operation: &Operation, status: StatusCode) -> Self {
        if status.is_server_error() {
            Self::Server {
                operation: operation.to_string(),
                status,
            }
        } else {
            Self::Client {
                operation: operation.to_string(),
                status,
            }
        }
    }

    fn shape(operation: &Operation, detail: impl Into<String>) -> Self {
        Self::Shape {
            operation: operation.to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Run `attempt` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    pub fn run<T, F>(&self, operation: &Operation, mut attempt: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Result<T, ApiError>,
    {
        let mut retries = 0usize;
        loop {
            let error = match attempt() {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                error!(operation = %operation, error = %error, "upstream request failed");
                return Err(error);
            }

            if retries >= self.max_retries {
                error!(
                    operation = %operation,
                    attempts = retries + 1,
                    error = %error,
                    "upstream request failed after retries"
                );
                return Err(ApiError::Exhausted {
                    operation: operation.to_string(),
                    attempts: retries + 1,
                    last: Box::new(error),
                });
            }

            let delay = self.backoff(retries);
            warn!(
                operation = %operation,
                attempt = retries + 1,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying upstream request"
            );
            sleep(delay);
            retries += 1;
        }
    }

    /// Delay before retry number `retry_index` (0-based): doubling from the base
    /// delay plus a jitter no larger than the base delay or 100ms.
    pub fn backoff(&self, retry_index: usize) -> Duration {
        let exponent = u32::try_from(retry_index).unwrap_or(16).min(16);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let scaled = base_ms.saturating_mul(2u64.saturating_pow(exponent));
        let jitter_cap = base_ms.min(100);
        let jitter = if jitter_cap == 0 {
            0
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| u64::from(duration.subsec_millis()) % jitter_cap)
                .unwrap_or(0)
        };
        Duration::from_millis(scaled.saturating_add(jitter))
    }
}

/// One location record as delivered upstream. Only the id decides whether a
/// record is usable: missing or unparseable ids come through as `None`, and
/// mistyped descriptive fields decode as `None` instead of failing the record.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RawLocation {
    #[serde(default, deserialize_with = "deserialize_lenient_id")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_lenient_text")]
    pub name: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "deserialize_lenient_text")]
    pub location_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_text")]
    pub dimension: Option<String>,
    #[serde(default, deserialize_with = "deserialize_references")]
    pub residents: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct NamedRef {
    #[serde(default, deserialize_with = "deserialize_lenient_text")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RawCharacter {
    #[serde(default, deserialize_with = "deserialize_lenient_id")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_lenient_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_text")]
    pub species: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_text")]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_named")]
    pub origin: Option<NamedRef>,
    #[serde(default, deserialize_with = "deserialize_lenient_named")]
    pub location: Option<NamedRef>,
    #[serde(default, deserialize_with = "deserialize_lenient_text")]
    pub image: Option<String>,
}

impl RawCharacter {
    /// Persisted shape; `None` when the record carries no usable id.
    pub fn to_row(&self) -> Option<CharacterRow> {
        let id = self.id?;
        Some(CharacterRow {
            id,
            name: self.name.clone(),
            status: self.status.clone(),
            species: self.species.clone(),
            gender: self.gender.clone(),
            origin: named_or_empty(self.origin.as_ref()),
            location: named_or_empty(self.location.as_ref()),
            image: self.image.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationPage {
    pub locations: Vec<RawLocation>,
    /// Upstream `info.next`; its presence means another page exists.
    pub next: Option<String>,
    /// Entries of `results` that were not location objects at all.
    pub malformed: usize,
}

impl LocationPage {
    pub fn has_more(&self) -> bool {
        self.next.is_some()
    }
}

/// Read side of the upstream API as seen by ingestion.
pub trait LocationApi {
    fn fetch_page(&mut self, page: u32) -> Result<LocationPage, ApiError>;
    fn fetch_batch(&mut self, ids: &[i64]) -> Result<Vec<RawCharacter>, ApiError>;
    fn fetch_one(&mut self, id: i64) -> Result<RawCharacter, ApiError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_config_with_lookup(&SyncConfig::default(), |_| None)
    }
}

impl ClientConfig {
    /// Resolve every knob as env > config file > built-in default.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::from_config_with_lookup(config, |key| env::var(key).ok())
    }

    fn from_config_with_lookup<F>(config: &SyncConfig, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let api = &config.api;
        Self {
            api_base: config.api_base_with_lookup(&lookup_env),
            user_agent: config.user_agent_with_lookup(&lookup_env),
            timeout_ms: env_number(
                &lookup_env,
                "RMSYNC_HTTP_TIMEOUT_MS",
                api.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            ),
            rate_limit_ms: env_number(
                &lookup_env,
                "RMSYNC_RATE_LIMIT_MS",
                api.rate_limit_ms.unwrap_or(DEFAULT_RATE_LIMIT_MS),
            ),
            max_retries: env_number(
                &lookup_env,
                "RMSYNC_HTTP_RETRIES",
                api.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            ),
            retry_delay_ms: env_number(
                &lookup_env,
                "RMSYNC_HTTP_RETRY_DELAY_MS",
                api.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

pub struct RickAndMortyClient {
    client: Client,
    config: ClientConfig,
    base_url: String,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl RickAndMortyClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build upstream HTTP client")?;
        Self::with_http_client(config, client)
    }

    pub(crate) fn with_http_client(config: ClientConfig, client: Client) -> anyhow::Result<Self> {
        let base_url = config.api_base.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url).with_context(|| format!("invalid upstream API base: {base_url}"))?;
        Ok(Self {
            client,
            config,
            base_url,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str, operation: &Operation) -> Result<Url, ApiError> {
        let raw = format!("{}/{}", self.base_url, path);
        Url::parse(&raw).map_err(|error| ApiError::InvalidRequest {
            operation: operation.to_string(),
            detail: format!("invalid URL {raw}: {error}"),
        })
    }

    fn get_with_retry(
        &mut self,
        url: &Url,
        query: &[(&str, String)],
        operation: &Operation,
    ) -> Result<String, ApiError> {
        let policy = self.config.retry_policy();
        policy.run(operation, || self.get_once(url, query, operation))
    }

    fn get_once(
        &mut self,
        url: &Url,
        query: &[(&str, String)],
        operation: &Operation,
    ) -> Result<String, ApiError> {
        self.apply_rate_limit();
        debug!(operation = %operation, url = %url, "upstream request");
        let response = self
            .client
            .get(url.clone())
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept", "application/json")
            .query(query)
            .send()
            .map_err(|source| ApiError::Transport {
                operation: operation.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(operation = %operation, status = status.as_u16(), "upstream API error");
            return Err(ApiError::from_status(operation, status));
        }

        response.text().map_err(|source| ApiError::Transport {
            operation: operation.to_string(),
            source,
        })
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

impl LocationApi for RickAndMortyClient {
    fn fetch_page(&mut self, page: u32) -> Result<LocationPage, ApiError> {
        let operation = Operation::LocationPage(page);
        if page == 0 {
            return Err(ApiError::InvalidRequest {
                operation: operation.to_string(),
                detail: "pages are numbered from 1".to_string(),
            });
        }
        let url = self.endpoint("location", &operation)?;
        let body = self.get_with_retry(&url, &[("page", page.to_string())], &operation)?;
        parse_location_page(&body, &operation)
    }

    fn fetch_batch(&mut self, ids: &[i64]) -> Result<Vec<RawCharacter>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let operation = Operation::CharacterBatch(ids.to_vec());
        let joined = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.endpoint(&format!("character/{joined}"), &operation)?;
        let body = self.get_with_retry(&url, &[], &operation)?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|error| ApiError::shape(&operation, format!("invalid JSON: {error}")))?;
        Ok(normalize_batch(value, &operation))
    }

    fn fetch_one(&mut self, id: i64) -> Result<RawCharacter, ApiError> {
        let operation = Operation::Character(id);
        let url = self.endpoint(&format!("character/{id}"), &operation)?;
        let body = self.get_with_retry(&url, &[], &operation)?;
        let character: RawCharacter = serde_json::from_str(&body)
            .map_err(|error| ApiError::shape(&operation, error.to_string()))?;
        if character.id.is_none() {
            return Err(ApiError::shape(&operation, "character record has no id"));
        }
        Ok(character)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(default)]
    info: Option<PageInfo>,
    #[serde(default)]
    results: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(default)]
    next: Option<String>,
}

/// Decode one `/location?page=N` body. Entries of `results` that are not
/// location objects are counted and dropped rather than failing the page.
pub fn parse_location_page(body: &str, operation: &Operation) -> Result<LocationPage, ApiError> {
    let envelope: PageEnvelope = serde_json::from_str(body)
        .map_err(|error| ApiError::shape(operation, error.to_string()))?;

    let mut page = LocationPage {
        next: envelope.info.and_then(|info| info.next),
        ..LocationPage::default()
    };
    for (index, value) in envelope.results.unwrap_or_default().into_iter().enumerate() {
        match serde_json::from_value::<RawLocation>(value) {
            Ok(location) => page.locations.push(location),
            Err(error) => {
                warn!(operation = %operation, index, error = %error, "skipping malformed location record");
                page.malformed += 1;
            }
        }
    }
    Ok(page)
}

/// Upstream answers a single id with one object and several ids with an array;
/// both come out as a list. Elements that are not character records are dropped.
pub fn normalize_batch(value: Value, operation: &Operation) -> Vec<RawCharacter> {
    let values = match value {
        Value::Array(values) => values,
        value @ Value::Object(_) => vec![value],
        other => {
            warn!(operation = %operation, body = %other, "unexpected batch response shape");
            return Vec::new();
        }
    };

    let mut out = Vec::with_capacity(values.len());
    for value in values {
        match serde_json::from_value::<RawCharacter>(value) {
            Ok(character) if character.id.is_some() => out.push(character),
            Ok(_) => warn!(operation = %operation, "skipping character record without id"),
            Err(error) => {
                warn!(operation = %operation, error = %error, "skipping malformed character record")
            }
        }
    }
    out
}

fn named_or_empty(named: Option<&NamedRef>) -> String {
    named
        .and_then(|named| named.name.clone())
        .unwrap_or_default()
}

fn deserialize_lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    })
}

fn deserialize_lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        _ => None,
    })
}

fn deserialize_lenient_named<'de, D>(deserializer: D) -> Result<Option<NamedRef>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(value @ Value::Object(_)) => serde_json::from_value(value).ok(),
        _ => None,
    })
}

fn deserialize_references<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(values)) => values,
        _ => Vec::new(),
    };
    Ok(values
        .into_iter()
        .map(|value| match value {
            Value::String(text) => text,
            other => other.to_string(),
        })
        .collect())
}

fn env_number<F, T>(lookup_env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup_env(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use serde_json::json;

    use super::*;

    pub(crate) struct CannedServer {
        pub(crate) base_url: String,
        handle: JoinHandle<Vec<String>>,
    }

    impl CannedServer {
        /// Request lines seen, in order. Blocks until every canned response was served.
        pub(crate) fn request_lines(self) -> Vec<String> {
            self.handle.join().expect("server thread")
        }
    }

    pub(crate) fn serve(responses: Vec<(u16, &'static str)>) -> CannedServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let read = stream.read(&mut chunk).expect("read request");
                    if read == 0 {
                        break;
                    }
                    buffer.extend_from_slice(&chunk[..read]);
                    if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&buffer).to_string();
                seen.push(request.lines().next().unwrap_or_default().to_string());
                let reason = match status {
                    200 => "OK",
                    404 => "Not Found",
                    503 => "Service Unavailable",
                    _ => "Status",
                };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream
                    .write_all(response.as_bytes())
                    .expect("write response");
                stream.flush().expect("flush response");
            }
            seen
        });
        CannedServer {
            base_url: format!("http://{addr}/api"),
            handle,
        }
    }

    pub(crate) fn test_client(api_base: &str) -> RickAndMortyClient {
        let config = ClientConfig {
            api_base: api_base.to_string(),
            user_agent: "rmsync-test".to_string(),
            timeout_ms: 5_000,
            rate_limit_ms: 0,
            max_retries: 3,
            retry_delay_ms: 1,
        };
        let http = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("http client");
        RickAndMortyClient::with_http_client(config, http).expect("client")
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
        }
    }

    fn server_error(operation: &Operation) -> ApiError {
        ApiError::from_status(operation, StatusCode::SERVICE_UNAVAILABLE)
    }

    const PAGE_BODY: &str = r#"{"info":{"next":"https://example.invalid/api/location?page=2"},"results":[{"id":3,"name":"Citadel of Ricks","type":"Space station","dimension":"unknown","residents":["https://example.invalid/api/character/1"]}]}"#;

    #[test]
    fn status_classification_splits_client_and_server() {
        let operation = Operation::LocationPage(1);
        let not_found = ApiError::from_status(&operation, StatusCode::NOT_FOUND);
        assert!(matches!(not_found, ApiError::Client { .. }));
        assert!(!not_found.is_retryable());

        let bad_gateway = ApiError::from_status(&operation, StatusCode::BAD_GATEWAY);
        assert!(matches!(bad_gateway, ApiError::Server { .. }));
        assert!(bad_gateway.is_retryable());
        assert_eq!(bad_gateway.status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn retry_recovers_after_two_server_errors() {
        let operation = Operation::LocationPage(2);
        let calls = Cell::new(0);
        let result = fast_policy().run(&operation, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(server_error(&operation))
            } else {
                Ok("page body")
            }
        });
        assert_eq!(result.expect("third attempt succeeds"), "page body");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let operation = Operation::Character(9000);
        let calls = Cell::new(0);
        let result: Result<(), ApiError> = fast_policy().run(&operation, || {
            calls.set(calls.get() + 1);
            Err(ApiError::from_status(&operation, StatusCode::NOT_FOUND))
        });
        assert!(matches!(result, Err(ApiError::Client { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn shape_errors_are_not_retried() {
        let operation = Operation::Character(1);
        let calls = Cell::new(0);
        let result: Result<(), ApiError> = fast_policy().run(&operation, || {
            calls.set(calls.get() + 1);
            Err(ApiError::shape(&operation, "not an object"))
        });
        assert!(matches!(result, Err(ApiError::Shape { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhausted_budget_reports_attempts_and_last_error() {
        let operation = Operation::CharacterBatch(vec![1, 2]);
        let calls = Cell::new(0);
        let result: Result<(), ApiError> = fast_policy().run(&operation, || {
            calls.set(calls.get() + 1);
            Err(server_error(&operation))
        });
        match result {
            Err(ApiError::Exhausted {
                attempts, last, ..
            }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last, ApiError::Server { .. }));
            }
            other => panic!("expected exhausted error, got {other:?}"),
        }
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
        };
        let first = policy.backoff(0);
        let third = policy.backoff(2);
        assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(20));
        assert!(third >= Duration::from_millis(40) && third < Duration::from_millis(50));
        assert_eq!(fast_policy().backoff(5), Duration::ZERO);
    }

    #[test]
    fn parse_page_reads_cursor_and_records() {
        let page = parse_location_page(PAGE_BODY, &Operation::LocationPage(1)).expect("parse");
        assert!(page.has_more());
        assert_eq!(page.locations.len(), 1);
        assert_eq!(page.locations[0].id, Some(3));
        assert_eq!(
            page.locations[0].location_type.as_deref(),
            Some("Space station")
        );

        let last = parse_location_page(
            r#"{"info":{"next":null},"results":[]}"#,
            &Operation::LocationPage(7),
        )
        .expect("parse last page");
        assert!(!last.has_more());
        assert!(last.locations.is_empty());
    }

    #[test]
    fn parse_page_tolerates_bad_records() {
        let body = json!({
            "info": {"next": null},
            "results": [
                "not a location",
                {"name": "No Id"},
                {"id": "12", "residents": [null, "https://example.invalid/api/character/4"]},
            ]
        })
        .to_string();
        let page = parse_location_page(&body, &Operation::LocationPage(1)).expect("parse");
        assert_eq!(page.malformed, 1);
        assert_eq!(page.locations.len(), 2);
        assert_eq!(page.locations[0].id, None);
        assert_eq!(page.locations[1].id, Some(12));
        assert_eq!(page.locations[1].residents.len(), 2);
        assert_eq!(page.locations[1].residents[0], "null");
    }

    #[test]
    fn parse_page_rejects_non_object_body() {
        let error = parse_location_page("[1, 2]", &Operation::LocationPage(1))
            .expect_err("array body is not a page");
        assert!(matches!(error, ApiError::Shape { .. }));
    }

    #[test]
    fn normalize_batch_accepts_object_or_array() {
        let operation = Operation::CharacterBatch(vec![1]);
        let single = normalize_batch(json!({"id": 1, "name": "Rick Sanchez"}), &operation);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].name.as_deref(), Some("Rick Sanchez"));

        let many = normalize_batch(
            json!([{"id": 1}, {"name": "nameless"}, 42, {"id": 2, "origin": {"name": "Earth"}}]),
            &operation,
        );
        let ids: Vec<Option<i64>> = many.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);

        assert!(normalize_batch(json!("nothing here"), &operation).is_empty());
    }

    #[test]
    fn mistyped_fields_do_not_drop_a_record_with_an_id() {
        let body = json!({
            "info": {"next": null},
            "results": [
                {"id": 5, "name": 42, "type": "Planet", "dimension": ["x"], "residents": "none"}
            ]
        })
        .to_string();
        let page = parse_location_page(&body, &Operation::LocationPage(1)).expect("parse");
        assert_eq!(page.malformed, 0);
        assert_eq!(page.locations.len(), 1);
        let location = &page.locations[0];
        assert_eq!(location.id, Some(5));
        assert_eq!(location.name, None);
        assert_eq!(location.location_type.as_deref(), Some("Planet"));
        assert_eq!(location.dimension, None);
        assert!(location.residents.is_empty());

        let characters = normalize_batch(
            json!([
                {"id": 1, "origin": "Earth", "status": false},
                {"id": 2, "location": {"name": 7}, "image": null}
            ]),
            &Operation::CharacterBatch(vec![1, 2]),
        );
        let ids: Vec<Option<i64>> = characters.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert_eq!(characters[0].origin, None);
        assert_eq!(characters[0].status, None);
        assert_eq!(characters[1].location, Some(NamedRef { name: None }));
        let row = characters[0].to_row().expect("row");
        assert_eq!(row.origin, "");
    }

    #[test]
    fn raw_character_row_defaults_missing_place_names() {
        let raw: RawCharacter = serde_json::from_value(json!({
            "id": 8,
            "name": "Adjudicator Rick",
            "origin": {"name": "unknown"},
            "location": null
        }))
        .expect("decode");
        let row = raw.to_row().expect("row");
        assert_eq!(row.origin, "unknown");
        assert_eq!(row.location, "");
        assert!(RawCharacter::default().to_row().is_none());
    }

    #[test]
    fn client_config_prefers_env_then_file() {
        let mut file = SyncConfig::default();
        file.api.max_retries = Some(5);
        file.api.timeout_ms = Some(1_000);
        let env = HashMap::from([
            ("RMSYNC_HTTP_TIMEOUT_MS".to_string(), "2500".to_string()),
            ("RMSYNC_HTTP_RETRIES".to_string(), "not-a-number".to_string()),
        ]);
        let resolved = ClientConfig::from_config_with_lookup(&file, |key| env.get(key).cloned());
        assert_eq!(resolved.timeout_ms, 2_500);
        assert_eq!(resolved.max_retries, 5);
        assert_eq!(resolved.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert_eq!(resolved.retry_policy().max_retries, 5);
    }

    #[test]
    fn fetch_page_retries_server_errors_over_http() {
        let server = serve(vec![
            (503, r#"{"error":"busy"}"#),
            (503, r#"{"error":"busy"}"#),
            (200, PAGE_BODY),
        ]);
        let mut client = test_client(&server.base_url);

        let page = client.fetch_page(1).expect("third attempt succeeds");
        assert_eq!(page.locations.len(), 1);
        assert!(page.has_more());
        assert_eq!(client.request_count(), 3);

        let lines = server.request_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|line| line.starts_with("GET /api/location?page=1 ")));
    }

    #[test]
    fn fetch_page_fails_fast_on_not_found() {
        let server = serve(vec![(404, r#"{"error":"There is nothing here"}"#)]);
        let mut client = test_client(&server.base_url);

        let error = client.fetch_page(99).expect_err("404 must fail");
        assert!(matches!(error, ApiError::Client { .. }));
        assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(client.request_count(), 1);
        assert_eq!(server.request_lines().len(), 1);
    }

    #[test]
    fn fetch_batch_normalizes_single_object_over_http() {
        let server = serve(vec![(200, r#"{"id":1,"name":"Rick Sanchez"}"#)]);
        let mut client = test_client(&server.base_url);

        let characters = client.fetch_batch(&[1]).expect("batch");
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].id, Some(1));
        let lines = server.request_lines();
        assert!(lines[0].starts_with("GET /api/character/1 "));
    }

    #[test]
    fn fetch_batch_joins_ids_in_path() {
        let server = serve(vec![(200, r#"[{"id":1},{"id":2}]"#)]);
        let mut client = test_client(&server.base_url);

        let characters = client.fetch_batch(&[1, 2]).expect("batch");
        assert_eq!(characters.len(), 2);
        let lines = server.request_lines();
        assert!(lines[0].starts_with("GET /api/character/1,2 "));
    }

    #[test]
    fn fetch_batch_with_no_ids_skips_network() {
        let mut client = test_client("http://127.0.0.1:9/api");
        assert!(client.fetch_batch(&[]).expect("empty batch").is_empty());
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn fetch_page_zero_is_rejected_locally() {
        let mut client = test_client("http://127.0.0.1:9/api");
        let error = client.fetch_page(0).expect_err("page 0 is invalid");
        assert!(matches!(error, ApiError::InvalidRequest { .. }));
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn fetch_one_decodes_single_character() {
        let server = serve(vec![(
            200,
            r#"{"id":7,"name":"Abradolf Lincler","status":"unknown","origin":{"name":"Earth (Replacement Dimension)"},"location":{"name":"Testicle Monster Dimension"}}"#,
        )]);
        let mut client = test_client(&server.base_url);
        let character = client.fetch_one(7).expect("fetch one");
        let row = character.to_row().expect("row");
        assert_eq!(row.origin, "Earth (Replacement Dimension)");
        assert_eq!(row.location, "Testicle Monster Dimension");
        assert!(server.request_lines()[0].starts_with("GET /api/character/7 "));
    }
}
