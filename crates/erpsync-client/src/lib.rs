//! Authenticated HTTP clients for the Accurate Online API.
//!
//! Two surfaces: [`ErpClient`] signs every request with an HMAC over a fresh
//! timestamp and talks to the official read-only API; [`ReportSession`] drives
//! the cookie-keyed report-export pair used for historical backfills.

use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use erpsync_core::{ApiCredentials, ReportCredentials};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, COOKIE};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "erpsync-client";

/// Token-validation endpoint; the one POST outside the report flow, and the
/// only call made before an API host is known.
const AUTH_URL: &str = "https://account.accurate.id/api/api-token.do";

pub const REPORT_PLAN_ID: &str = "ViewSalesByItemDetailReport";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected; call connect() first")]
    NotConnected,
    #[error("transport failure after {attempts} attempts: {source}")]
    Transport {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("provider rejected {endpoint}: {detail}")]
    Provider { endpoint: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Transient transport failures (reset, timeout, protocol) are the only
/// retryable class. HTTP statuses are business errors and never retried.
pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts including the first; exhausting them surfaces the
    /// last transport error.
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Exponential: base, then doubling per attempt (2s, 4s, 8s).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Whether another attempt is allowed after `attempt_index` failed.
    pub fn retries_remaining(&self, attempt_index: usize) -> bool {
        attempt_index + 1 < self.max_attempts
    }
}

/// Hex HMAC-SHA256 of the timestamp string, keyed by the signing secret.
pub fn sign_timestamp(secret: &str, timestamp: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Provider response envelope: `s` is the success flag, `d` the payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub s: bool,
    #[serde(default)]
    pub d: JsonValue,
    /// Message text, sometimes a string, sometimes a list.
    #[serde(default)]
    pub m: JsonValue,
    /// The execute-report endpoint returns this at the top level.
    #[serde(default, rename = "cacheId")]
    pub cache_id: Option<String>,
}

impl Envelope {
    pub fn detail_text(&self) -> String {
        if !self.m.is_null() {
            self.m.to_string()
        } else {
            self.d.to_string()
        }
    }
}

/// Database identity returned by the auth handshake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectedDatabase {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ConnectedDatabase {
    pub fn label(&self) -> &str {
        self.alias
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("unknown")
    }
}

pub struct ErpClient {
    http: reqwest::Client,
    credentials: ApiCredentials,
    api_host: Option<String>,
    backoff: BackoffPolicy,
}

impl ErpClient {
    /// `api_host` is the entity's fixed regional host, or `None` to adopt
    /// whatever host [`ErpClient::connect`] discovers.
    pub fn new(credentials: ApiCredentials, api_host: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(60))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            credentials,
            api_host: api_host.map(|h| h.trim_end_matches('/').to_string()),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn api_host(&self) -> Option<&str> {
        self.api_host.as_deref()
    }

    /// Signatures are generated per attempt, never reused: the provider
    /// rejects stale timestamps.
    fn auth_headers(&self) -> HeaderMap {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_timestamp(&self.credentials.signature_secret, &timestamp);
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::try_from(format!("Bearer {}", self.credentials.api_token))
                .expect("token is valid header text"),
        );
        headers.insert(
            "X-Api-Timestamp",
            HeaderValue::try_from(timestamp).expect("timestamp is ascii"),
        );
        headers.insert(
            "X-Api-Signature",
            HeaderValue::try_from(signature).expect("hex signature is ascii"),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    /// Validate the token and resolve the regional API host. The provider
    /// may answer "use this host" for entities without a fixed one; fixed
    /// and discovered hosts are treated uniformly from here on.
    pub async fn connect(&mut self) -> Result<ConnectedDatabase, ClientError> {
        let response = self
            .http
            .post(AUTH_URL)
            .headers(self.auth_headers())
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                url: AUTH_URL.to_string(),
            });
        }
        let envelope: Envelope = response.json().await?;
        if !envelope.s {
            return Err(ClientError::Provider {
                endpoint: AUTH_URL.to_string(),
                detail: envelope.detail_text(),
            });
        }
        let database = envelope
            .d
            .get("database")
            .and_then(|v| serde_json::from_value::<ConnectedDatabase>(v.clone()).ok())
            .unwrap_or_default();
        if !database.host.is_empty() {
            self.api_host = Some(database.host.trim_end_matches('/').to_string());
        }
        Ok(database)
    }

    /// Read-only GET with transport-level retry. Non-2xx statuses and
    /// `s == false` payloads fail immediately; only connection resets,
    /// timeouts and protocol errors are retried, with fresh signatures.
    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Envelope, ClientError> {
        let host = self.api_host.as_deref().ok_or(ClientError::NotConnected)?;
        let url = format!("{host}{endpoint}");

        let mut attempt = 0usize;
        loop {
            let result = self
                .http
                .get(&url)
                .headers(self.auth_headers())
                .query(params)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && self.backoff.retries_remaining(attempt)
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            endpoint,
                            attempt = attempt + 1,
                            delay_secs = delay.as_secs(),
                            "transport error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ClientError::Transport {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            };

            let status = response.status();
            if !status.is_success() {
                return Err(ClientError::HttpStatus {
                    status: status.as_u16(),
                    url,
                });
            }
            let envelope: Envelope = response.json().await?;
            if !envelope.s {
                return Err(ClientError::Provider {
                    endpoint: endpoint.to_string(),
                    detail: envelope.detail_text(),
                });
            }
            return Ok(envelope);
        }
    }
}

/// Cookie-keyed session against the report host: execute a rendered report,
/// then export it as spreadsheet bytes.
pub struct ReportSession {
    http: reqwest::Client,
    credentials: ReportCredentials,
}

impl ReportSession {
    pub fn new(credentials: ReportCredentials) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .build()
            .context("building reqwest client")?;
        Ok(Self { http, credentials })
    }

    fn cookie_header(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::try_from(format!(
                "_dsi={}; _usi={}",
                self.credentials.dsi, self.credentials.usi
            ))
            .expect("cookie values are ascii"),
        );
        headers
    }

    /// Render the sales-by-item report server-side; returns the cache id
    /// the export call redeems.
    pub async fn execute_report(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<String, ClientError> {
        let url = format!(
            "{}/accurate/report/execute-report.do",
            self.credentials.report_host
        );
        let report_input = report_input_json(start, end).to_string();
        let form = [
            ("id", self.credentials.report_id.as_str()),
            ("planId", REPORT_PLAN_ID),
            ("reportInput", report_input.as_str()),
            ("cacheId", ""),
            ("pageIndex", "0"),
            ("_usi", self.credentials.usi.as_str()),
            ("_dsi", self.credentials.dsi.as_str()),
        ];

        let response = self
            .http
            .post(&url)
            .headers(self.cookie_header())
            .form(&form)
            .timeout(Duration::from_secs(120))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let envelope: Envelope = response.json().await?;
        if !envelope.s {
            return Err(ClientError::Provider {
                endpoint: url,
                detail: envelope.detail_text(),
            });
        }
        extract_cache_id(&envelope).ok_or(ClientError::Provider {
            endpoint: url,
            detail: "response carried no cacheId".to_string(),
        })
    }

    /// Download the rendered report as `xls` bytes. A JSON content type on
    /// this endpoint signals failure, not data.
    pub async fn export_report(&self, cache_id: &str) -> Result<Vec<u8>, ClientError> {
        let url = format!(
            "{}/accurate/report/export-report.do",
            self.credentials.report_host
        );
        let form = [
            ("_usi", self.credentials.usi.as_str()),
            ("_dsi", self.credentials.dsi.as_str()),
            ("cacheId", cache_id),
            ("exportType", "xls"),
            ("name", ""),
        ];

        let response = self
            .http
            .post(&url)
            .headers(self.cookie_header())
            .form(&form)
            .timeout(Duration::from_secs(300))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        if is_json {
            let detail = response.text().await.unwrap_or_default();
            return Err(ClientError::Provider {
                endpoint: url,
                detail: erpsync_core::LoadRecord::truncate_error(&detail),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn report_input_json(start: NaiveDate, end: NaiveDate) -> JsonValue {
    json!({
        "param": {
            "startDate": start.format("%d/%m/%Y").to_string(),
            "endDate": end.format("%d/%m/%Y").to_string(),
            "selectedBranch": [{"name": "[Semua Cabang]", "id": null}],
            "currentUserRole": [],
        },
        "filter": [],
        "subSelection": 0,
        "selection": [],
    })
}

fn extract_cache_id(envelope: &Envelope) -> Option<String> {
    envelope.cache_id.clone().or_else(|| {
        envelope
            .d
            .get("cacheId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hmac_sha256_hex() {
        assert_eq!(
            sign_timestamp("topsecret", "1700000000"),
            "a21fd4816ec741b58b2f890f9fff62579b0c122d02c78096b0a92bc4825c506b"
        );
        assert_eq!(
            sign_timestamp("secret", "0"),
            "1779fd3337dd353e424d808d9190aff8f09e46a8cbbe6469079b2d7f0e246e37"
        );
    }

    #[test]
    fn backoff_doubles_from_two_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
    }

    #[test]
    fn retry_cap_allows_exactly_three_attempts() {
        let policy = BackoffPolicy::default();
        // Attempt indices 0 and 1 may be followed by another try; the third
        // failure is final. A fourth attempt is unreachable.
        assert!(policy.retries_remaining(0));
        assert!(policy.retries_remaining(1));
        assert!(!policy.retries_remaining(2));
    }

    #[test]
    fn envelope_parses_success_flag_and_payload() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"s": true, "d": [{"id": 7}]}"#).unwrap();
        assert!(envelope.s);
        assert_eq!(envelope.d[0]["id"], 7);

        let rejected: Envelope =
            serde_json::from_str(r#"{"s": false, "m": "invalid signature"}"#).unwrap();
        assert!(!rejected.s);
        assert!(rejected.detail_text().contains("invalid signature"));
    }

    #[test]
    fn connect_payload_yields_database_identity() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"s": true, "d": {"database": {"host": "https://zeus.accurate.id/", "alias": "PT Example"}}}"#,
        )
        .unwrap();
        let database: ConnectedDatabase =
            serde_json::from_value(envelope.d["database"].clone()).unwrap();
        assert_eq!(database.host, "https://zeus.accurate.id/");
        assert_eq!(database.label(), "PT Example");
    }

    #[test]
    fn report_input_uses_day_month_year_and_all_branches() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 30).unwrap();
        let input = report_input_json(start, end);
        assert_eq!(input["param"]["startDate"], "01/01/2024");
        assert_eq!(input["param"]["endDate"], "30/03/2024");
        assert_eq!(input["param"]["selectedBranch"][0]["name"], "[Semua Cabang]");
    }

    #[test]
    fn cache_id_is_read_from_payload() {
        let nested: Envelope =
            serde_json::from_str(r#"{"s": true, "d": {"cacheId": "abc123"}}"#).unwrap();
        assert_eq!(extract_cache_id(&nested).as_deref(), Some("abc123"));

        let top_level: Envelope =
            serde_json::from_str(r#"{"s": true, "cacheId": "xyz", "d": {}}"#).unwrap();
        assert_eq!(extract_cache_id(&top_level).as_deref(), Some("xyz"));

        let missing: Envelope = serde_json::from_str(r#"{"s": true, "d": {}}"#).unwrap();
        assert!(extract_cache_id(&missing).is_none());
    }
}
