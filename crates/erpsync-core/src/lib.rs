//! Core domain model for erpsync: entity registry, credentials, row types.

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "erpsync-core";

/// Sentinel for invoices without a named customer (walk-in sales).
pub const DEFAULT_CUSTOMER: &str = "UMUM";
/// Sentinel for line items without a department or branch.
pub const DEFAULT_DEPARTMENT: &str = "UNKNOWN";
/// Sentinel for line items without a sales unit.
pub const DEFAULT_UNIT: &str = "PAIR";

/// Provenance source tag for official-API pulls.
pub const SOURCE_API: &str = "accurate_api";
/// Provenance source tag for report-export pulls.
pub const SOURCE_REPORT: &str = "report_export";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "missing credentials for {entity}: set ACCURATE_API_TOKEN and \
         ACCURATE_SIGNATURE_SECRET, or provide {env_file} in {env_dir}"
    )]
    MissingCredentials {
        entity: String,
        env_file: String,
        env_dir: String,
    },
    #[error("missing report session for {entity}: set ACCURATE_DSI, ACCURATE_USI and ACCURATE_REPORT_ID")]
    MissingReportSession { entity: String },
    #[error("unknown entity {0:?}")]
    UnknownEntity(String),
    #[error("reading {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenvy::Error,
    },
}

/// One independently-credentialed business unit with its own target tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub key: String,
    pub display_name: String,
    pub env_file: String,
    /// Fixed regional API host, or `None` to adopt the host returned by login.
    pub api_host: Option<String>,
    /// `None` for entities with no sales data.
    pub sales_table: Option<String>,
    pub stock_table: String,
}

impl EntityConfig {
    fn new(key: &str, api_host: Option<&str>, has_sales: bool) -> Self {
        Self {
            key: key.to_string(),
            display_name: key.to_ascii_uppercase(),
            env_file: format!(".env.{key}"),
            api_host: api_host.map(str::to_string),
            sales_table: has_sales.then(|| format!("raw.sales_{key}")),
            stock_table: format!("raw.stock_{key}"),
        }
    }
}

/// Immutable entity table, built once at startup and passed into the driver.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    entities: Vec<EntityConfig>,
}

impl EntityRegistry {
    /// The fixed production entity set. LJBB carries no sales data and
    /// discovers its API host at login time.
    pub fn builtin() -> Self {
        Self {
            entities: vec![
                EntityConfig::new("ddd", Some("https://zeus.accurate.id"), true),
                EntityConfig::new("ljbb", None, false),
                EntityConfig::new("mbb", Some("https://iris.accurate.id"), true),
                EntityConfig::new("ubb", Some("https://zeus.accurate.id"), true),
            ],
        }
    }

    pub fn from_entities(entities: Vec<EntityConfig>) -> Self {
        Self { entities }
    }

    pub fn get(&self, key: &str) -> Result<&EntityConfig, ConfigError> {
        self.entities
            .iter()
            .find(|e| e.key == key)
            .ok_or_else(|| ConfigError::UnknownEntity(key.to_string()))
    }

    pub fn all(&self) -> &[EntityConfig] {
        &self.entities
    }

    /// Entities that have a sales target table.
    pub fn sales_entities(&self) -> Vec<&EntityConfig> {
        self.entities
            .iter()
            .filter(|e| e.sales_table.is_some())
            .collect()
    }
}

/// Per-entity API token + signing secret. Lives only for one run.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_token: String,
    pub signature_secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_token", &"<redacted>")
            .field("signature_secret", &"<redacted>")
            .finish()
    }
}

/// Session-cookie pair + report plan identity for the report-export API.
#[derive(Clone)]
pub struct ReportCredentials {
    pub dsi: String,
    pub usi: String,
    pub report_host: String,
    pub report_id: String,
}

impl std::fmt::Debug for ReportCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportCredentials")
            .field("report_host", &self.report_host)
            .field("dsi", &"<redacted>")
            .field("usi", &"<redacted>")
            .finish()
    }
}

fn env_file_values(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let mut values = HashMap::new();
    for item in dotenvy::from_path_iter(path).map_err(|source| ConfigError::EnvFile {
        path: path.display().to_string(),
        source,
    })? {
        let (key, value) = item.map_err(|source| ConfigError::EnvFile {
            path: path.display().to_string(),
            source,
        })?;
        values.insert(key, value);
    }
    Ok(values)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn lookup(name: &str, file_values: &HashMap<String, String>) -> Option<String> {
    env_var(name).or_else(|| file_values.get(name).cloned().filter(|v| !v.is_empty()))
}

/// Resolve the API token + signing secret for one entity.
///
/// Priority per value: shared env var, entity-scoped env var, the entity's
/// `.env.<key>` file under `env_dir`. The file is parsed directly so one
/// entity's credentials never leak into the process environment.
pub fn resolve_api_credentials(
    entity: &EntityConfig,
    env_dir: &Path,
) -> Result<ApiCredentials, ConfigError> {
    let file_values = env_file_values(&env_dir.join(&entity.env_file))?;
    let scoped = |name: &str| format!("{}_{}", entity.key.to_ascii_uppercase(), name);

    let api_token = env_var("ACCURATE_API_TOKEN")
        .or_else(|| env_var(&scoped("ACCURATE_API_TOKEN")))
        .or_else(|| lookup("ACCURATE_API_TOKEN", &file_values));
    let signature_secret = env_var("ACCURATE_SIGNATURE_SECRET")
        .or_else(|| env_var(&scoped("ACCURATE_SIGNATURE_SECRET")))
        .or_else(|| lookup("ACCURATE_SIGNATURE_SECRET", &file_values));

    match (api_token, signature_secret) {
        (Some(api_token), Some(signature_secret)) => Ok(ApiCredentials {
            api_token,
            signature_secret,
        }),
        _ => Err(ConfigError::MissingCredentials {
            entity: entity.display_name.clone(),
            env_file: entity.env_file.clone(),
            env_dir: env_dir.display().to_string(),
        }),
    }
}

/// Resolve the report-export session for one entity.
pub fn resolve_report_credentials(
    entity: &EntityConfig,
    env_dir: &Path,
) -> Result<ReportCredentials, ConfigError> {
    let file_values = env_file_values(&env_dir.join(&entity.env_file))?;
    let get = |name: &str| lookup(name, &file_values);

    let dsi = get("ACCURATE_DSI");
    let usi = get("ACCURATE_USI");
    let report_id = get("ACCURATE_REPORT_ID");
    let report_host =
        get("ACCURATE_REPORT_HOST").unwrap_or_else(|| "https://zeus-report.accurate.id".into());

    match (dsi, usi, report_id) {
        (Some(dsi), Some(usi), Some(report_id)) if dsi != "PASTE_YOUR_DSI_COOKIE_HERE" => {
            Ok(ReportCredentials {
                dsi,
                usi,
                report_host,
                report_id,
            })
        }
        _ => Err(ConfigError::MissingReportSession {
            entity: entity.display_name.clone(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Sales,
    Stock,
}

impl DataKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Sales => "sales",
            DataKind::Stock => "stock",
        }
    }
}

/// One flat (invoice, product) fact ready for the sales table.
///
/// The trailing optional fields come only from the official API; report
/// exports do not carry them and load NULLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesRow {
    pub trans_date: NaiveDate,
    pub department: String,
    pub customer: String,
    pub invoice_no: String,
    pub product_code: String,
    pub product_name: String,
    pub unit: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub total_price: f64,
    pub cost: f64,
    pub warehouse: Option<String>,
    pub vendor_price: Option<f64>,
    pub dpp_amount: Option<f64>,
    pub tax_amount: Option<f64>,
}

/// One (item, warehouse) balance fact for the stock table. Zero balances
/// are valid stock facts and are retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockRow {
    pub product_code: String,
    pub product_name: String,
    pub warehouse: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub vendor_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Success,
    Error,
}

impl LoadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadStatus::Success => "success",
            LoadStatus::Error => "error",
        }
    }
}

/// Append-only audit entry, one per run (or per failed chunk).
#[derive(Debug, Clone, Serialize)]
pub struct LoadRecord {
    pub source: String,
    pub entity: String,
    pub data_kind: DataKind,
    pub batch_id: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub rows_loaded: i64,
    pub status: LoadStatus,
    pub error_message: Option<String>,
}

const ERROR_MESSAGE_LIMIT: usize = 500;

impl LoadRecord {
    /// Truncates to the audit column width, on a char boundary.
    pub fn truncate_error(message: &str) -> String {
        message.chars().take(ERROR_MESSAGE_LIMIT).collect()
    }
}

/// Run-scoped provenance attached to every persisted row.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub snapshot_date: NaiveDate,
    pub batch_id: String,
}

impl LoadContext {
    pub fn new(source: &str, kind: DataKind, entity_key: &str, now: NaiveDateTime) -> Self {
        Self {
            snapshot_date: now.date(),
            batch_id: format!(
                "{source}_{}_{entity_key}_{}",
                kind.as_str(),
                now.format("%Y%m%d_%H%M%S")
            ),
        }
    }
}

/// Round a monetary amount to 2 decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse a provider date: `DD/MM/YYYY` as sent by the API, with ISO
/// `YYYY-MM-DD` accepted as a fallback.
pub fn parse_provider_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y-%m-%d"))
        .ok()
}
