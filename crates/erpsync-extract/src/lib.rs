//! Paginated fetch traversal and row normalization.
//!
//! The traversal walks a paged list endpoint to exhaustion, then fetches one
//! detail per record, throttled to stay under the provider's rate ceiling.
//! Normalizers flatten fetched details (or report workbook rows) into the
//! fixed [`SalesRow`]/[`StockRow`] schema.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use calamine::{Data, Reader, Xlsx};
use chrono::NaiveDate;
use erpsync_client::{ClientError, ErpClient};
use erpsync_core::{
    parse_provider_date, round2, SalesRow, StockRow, DEFAULT_CUSTOMER, DEFAULT_DEPARTMENT,
    DEFAULT_UNIT,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "erpsync-extract";

pub const PAGE_SIZE: usize = 100;

/// Provider rate ceiling is ~8 requests/second.
pub const CALL_INTERVAL: Duration = Duration::from_millis(125);

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("decoding {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("parsing report workbook: {0}")]
    Workbook(#[from] calamine::XlsxError),
    #[error("report workbook has no sheets")]
    EmptyWorkbook,
}

/// One entry of a paged list response; only the id matters for the detail
/// follow-up, the code is kept for log lines.
#[derive(Debug, Clone, Deserialize)]
pub struct ListEntry {
    pub id: i64,
    #[serde(default, alias = "no")]
    pub number: Option<String>,
}

/// Seam between the traversal and the HTTP client, so pagination behavior
/// is testable without a live provider.
#[async_trait]
pub trait PagedApi: Send + Sync {
    async fn list_page(&self, page: usize) -> Result<Vec<ListEntry>, ExtractError>;
    async fn detail(&self, id: i64) -> Result<JsonValue, ExtractError>;
}

async fn throttle(interval: Duration) {
    if !interval.is_zero() {
        tokio::time::sleep(interval).await;
    }
}

/// Walk the list endpoint until a short page. A total-count field in the
/// response is never consulted.
pub async fn fetch_list(
    api: &dyn PagedApi,
    interval: Duration,
) -> Result<Vec<ListEntry>, ExtractError> {
    let mut entries = Vec::new();
    let mut page = 1usize;
    loop {
        let batch = api.list_page(page).await?;
        let exhausted = batch.len() < PAGE_SIZE;
        debug!(page, count = batch.len(), "fetched list page");
        entries.extend(batch);
        if exhausted {
            return Ok(entries);
        }
        page += 1;
        throttle(interval).await;
    }
}

/// Fetch one detail per entry. A failed detail is logged and skipped; one
/// bad record must not abort the sweep.
pub async fn fetch_details(
    api: &dyn PagedApi,
    entries: &[ListEntry],
    interval: Duration,
) -> Vec<JsonValue> {
    let mut details = Vec::with_capacity(entries.len());
    for entry in entries {
        throttle(interval).await;
        match api.detail(entry.id).await {
            Ok(detail) => details.push(detail),
            Err(err) => {
                warn!(
                    id = entry.id,
                    number = entry.number.as_deref().unwrap_or(""),
                    error = %err,
                    "detail fetch failed, skipping record"
                );
            }
        }
    }
    details
}

pub async fn fetch_all(api: &dyn PagedApi, interval: Duration) -> Result<Vec<JsonValue>, ExtractError> {
    let entries = fetch_list(api, interval).await?;
    Ok(fetch_details(api, &entries, interval).await)
}

fn page_params(page: usize) -> Vec<(String, String)> {
    vec![
        ("sp.page".into(), page.to_string()),
        ("sp.pageSize".into(), PAGE_SIZE.to_string()),
    ]
}

fn decode_list(payload: JsonValue) -> Result<Vec<ListEntry>, ExtractError> {
    if payload.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(payload).map_err(|source| ExtractError::Decode {
        what: "list page",
        source,
    })
}

/// Sales invoices filtered to a transaction date range.
pub struct SalesInvoiceApi<'a> {
    pub client: &'a ErpClient,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[async_trait]
impl PagedApi for SalesInvoiceApi<'_> {
    async fn list_page(&self, page: usize) -> Result<Vec<ListEntry>, ExtractError> {
        let mut params = page_params(page);
        params.push(("filter.transDate.op".into(), "BETWEEN".into()));
        params.push((
            "filter.transDate.val[0]".into(),
            self.start.format("%d/%m/%Y").to_string(),
        ));
        params.push((
            "filter.transDate.val[1]".into(),
            self.end.format("%d/%m/%Y").to_string(),
        ));
        let envelope = self
            .client
            .get("/accurate/api/sales-invoice/list.do", &params)
            .await?;
        decode_list(envelope.d)
    }

    async fn detail(&self, id: i64) -> Result<JsonValue, ExtractError> {
        let params = vec![("id".into(), id.to_string())];
        let envelope = self
            .client
            .get("/accurate/api/sales-invoice/detail.do", &params)
            .await?;
        Ok(envelope.d)
    }
}

/// Inventory items; details carry the per-warehouse balances.
pub struct ItemApi<'a> {
    pub client: &'a ErpClient,
}

#[async_trait]
impl PagedApi for ItemApi<'_> {
    async fn list_page(&self, page: usize) -> Result<Vec<ListEntry>, ExtractError> {
        let envelope = self
            .client
            .get("/accurate/api/item/list.do", &page_params(page))
            .await?;
        decode_list(envelope.d)
    }

    async fn detail(&self, id: i64) -> Result<JsonValue, ExtractError> {
        let params = vec![("id".into(), id.to_string())];
        let envelope = self
            .client
            .get("/accurate/api/item/detail.do", &params)
            .await?;
        Ok(envelope.d)
    }
}

// ---- wire model -----------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemRef {
    #[serde(default)]
    pub no: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default, rename = "vendorPrice")]
    pub vendor_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default, rename = "unitPrice")]
    pub unit_price: Option<f64>,
    #[serde(default, rename = "totalPrice")]
    pub total_price: Option<f64>,
    #[serde(default, rename = "unitCost")]
    pub unit_cost: Option<f64>,
    #[serde(default, rename = "averageCost")]
    pub average_cost: Option<f64>,
    #[serde(default, rename = "dppAmount")]
    pub dpp_amount: Option<f64>,
    #[serde(default, rename = "tax1Amount")]
    pub tax1_amount: Option<f64>,
    #[serde(default)]
    pub item: Option<ItemRef>,
    #[serde(default, rename = "itemUnit")]
    pub item_unit: Option<NamedRef>,
    #[serde(default)]
    pub department: Option<NamedRef>,
    #[serde(default)]
    pub warehouse: Option<NamedRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceDetail {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default, rename = "transDate")]
    pub trans_date: Option<String>,
    #[serde(default)]
    pub customer: Option<NamedRef>,
    #[serde(default, rename = "branchName")]
    pub branch_name: Option<String>,
    #[serde(default, rename = "detailItem")]
    pub items: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseBalance {
    #[serde(default, rename = "warehouseName")]
    pub warehouse_name: Option<String>,
    #[serde(default)]
    pub balance: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemDetail {
    #[serde(default)]
    pub no: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "unitPrice")]
    pub unit_price: Option<f64>,
    #[serde(default, rename = "vendorPrice")]
    pub vendor_price: Option<f64>,
    #[serde(default, rename = "detailWarehouseData")]
    pub warehouses: Vec<WarehouseBalance>,
}

fn decode_detail<T: serde::de::DeserializeOwned>(value: JsonValue, what: &'static str) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(detail) => Some(detail),
        Err(err) => {
            warn!(what, error = %err, "undecodable detail payload, skipping record");
            None
        }
    }
}

/// Fetch and decode all invoice details for a date range.
pub async fn fetch_sales(
    client: &ErpClient,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<InvoiceDetail>, ExtractError> {
    let api = SalesInvoiceApi { client, start, end };
    let details = fetch_all(&api, CALL_INTERVAL).await?;
    Ok(details
        .into_iter()
        .filter_map(|v| decode_detail(v, "sales invoice"))
        .collect())
}

/// Fetch and decode all inventory item details.
pub async fn fetch_stock(client: &ErpClient) -> Result<Vec<ItemDetail>, ExtractError> {
    let api = ItemApi { client };
    let details = fetch_all(&api, CALL_INTERVAL).await?;
    Ok(details
        .into_iter()
        .filter_map(|v| decode_detail(v, "inventory item"))
        .collect())
}

// ---- normalizers ----------------------------------------------------------

/// The provider does not expose true transaction cost, so the first two
/// tiers are documented-dead; the priority order is kept for forward
/// compatibility.
fn first_nonzero(candidates: [f64; 3]) -> f64 {
    candidates.into_iter().find(|v| *v != 0.0).unwrap_or(0.0)
}

/// Flatten one invoice detail into zero or more sales rows.
///
/// Lines with non-positive quantity or an empty product code are dropped,
/// never erred.
pub fn flatten_invoice(invoice: &InvoiceDetail) -> Vec<SalesRow> {
    let invoice_no = invoice.number.clone().unwrap_or_default();
    let customer = invoice
        .customer
        .as_ref()
        .and_then(|c| c.name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_CUSTOMER.to_string());
    let branch = invoice.branch_name.clone().filter(|n| !n.is_empty());

    let Some(trans_date) = invoice
        .trans_date
        .as_deref()
        .and_then(parse_provider_date)
    else {
        warn!(invoice = invoice_no, "invoice without a parseable date, skipping");
        return Vec::new();
    };

    let mut rows = Vec::new();
    for line in &invoice.items {
        let quantity = line.quantity.unwrap_or(0.0);
        if quantity <= 0.0 {
            continue;
        }
        let item = line.item.clone().unwrap_or_default();
        let product_code = item.no.clone().unwrap_or_default();
        if product_code.is_empty() {
            continue;
        }

        let cost = first_nonzero([
            line.unit_cost.unwrap_or(0.0),
            line.average_cost.unwrap_or(0.0),
            item.cost.unwrap_or(0.0),
        ]);
        let department = line
            .department
            .as_ref()
            .and_then(|d| d.name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| branch.clone())
            .unwrap_or_else(|| DEFAULT_DEPARTMENT.to_string());
        let unit = line
            .item_unit
            .as_ref()
            .and_then(|u| u.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_UNIT.to_string());

        rows.push(SalesRow {
            trans_date,
            department,
            customer: customer.clone(),
            invoice_no: invoice_no.clone(),
            product_code,
            product_name: item.name.clone().unwrap_or_default(),
            unit,
            quantity: quantity as i64,
            unit_price: round2(line.unit_price.unwrap_or(0.0)),
            total_price: round2(line.total_price.unwrap_or(0.0)),
            cost: round2(cost),
            warehouse: line.warehouse.as_ref().and_then(|w| w.name.clone()),
            vendor_price: Some(round2(item.vendor_price.unwrap_or(0.0))),
            dpp_amount: Some(round2(line.dpp_amount.unwrap_or(0.0))),
            tax_amount: Some(round2(line.tax1_amount.unwrap_or(0.0))),
        });
    }
    rows
}

/// One row per (item, warehouse) balance. Zero balances are kept: an
/// empty shelf is a valid stock fact.
pub fn flatten_item(item: &ItemDetail) -> Vec<StockRow> {
    let product_code = item.no.clone().unwrap_or_default();
    let product_name = item.name.clone().unwrap_or_default();
    let unit_price = round2(item.unit_price.unwrap_or(0.0));
    let vendor_price = round2(item.vendor_price.unwrap_or(0.0));

    item.warehouses
        .iter()
        .map(|wh| StockRow {
            product_code: product_code.clone(),
            product_name: product_name.clone(),
            warehouse: wh.warehouse_name.clone().unwrap_or_default(),
            quantity: wh.balance.unwrap_or(0.0) as i64,
            unit_price,
            vendor_price,
        })
        .collect()
}

// ---- report workbook ------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportColumn {
    Date,
    Department,
    Customer,
    ProductCode,
    InvoiceNo,
    ProductName,
    Unit,
    Quantity,
    UnitPrice,
    TotalPrice,
    Cost,
}

/// Canonical mapping, matched case-insensitively by substring against the
/// export's header cells (the export's column titles drift between report
/// versions).
const COLUMN_MAP: &[(&str, ReportColumn)] = &[
    ("tanggal", ReportColumn::Date),
    ("nama departemen", ReportColumn::Department),
    ("nama pelanggan", ReportColumn::Customer),
    ("kode #", ReportColumn::ProductCode),
    ("nomor #", ReportColumn::InvoiceNo),
    ("nama barang", ReportColumn::ProductName),
    ("satuan", ReportColumn::Unit),
    ("kuantitas", ReportColumn::Quantity),
    ("@harga", ReportColumn::UnitPrice),
    ("total harga", ReportColumn::TotalPrice),
    ("bpp", ReportColumn::Cost),
];

fn cell_text(cell: Option<&Data>) -> Option<String> {
    match cell? {
        Data::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Data::Int(i) => Some(i.to_string()),
        Data::Float(f) => Some(if f.fract() == 0.0 {
            format!("{}", *f as i64)
        } else {
            f.to_string()
        }),
        _ => None,
    }
}

/// Numeric coercion failures become zero rather than erroring.
fn cell_number(cell: Option<&Data>) -> f64 {
    match cell {
        Some(Data::Float(f)) => *f,
        Some(Data::Int(i)) => *i as f64,
        Some(Data::String(s)) => s.trim().replace(',', "").parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

// Excel serials count days since 1899-12-30.
fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(chrono::Duration::days(serial.floor() as i64))
}

fn cell_date(cell: Option<&Data>) -> Option<NaiveDate> {
    match cell? {
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()),
        Data::DateTimeIso(s) => parse_provider_date(s),
        Data::String(s) => parse_provider_date(s),
        Data::Float(f) => excel_serial_to_date(*f),
        _ => None,
    }
}

fn match_columns(header: &[Data]) -> Vec<(usize, ReportColumn)> {
    let lowered: Vec<String> = header
        .iter()
        .map(|cell| cell_text(Some(cell)).unwrap_or_default().to_lowercase())
        .collect();
    let mut columns = Vec::new();
    for (needle, column) in COLUMN_MAP {
        if let Some(idx) = lowered
            .iter()
            .position(|title| !title.is_empty() && title.contains(needle))
        {
            columns.push((idx, *column));
        }
    }
    columns
}

fn column_index(columns: &[(usize, ReportColumn)], wanted: ReportColumn) -> Option<usize> {
    columns
        .iter()
        .find(|(_, column)| *column == wanted)
        .map(|(idx, _)| *idx)
}

/// Clean grouped report rows into sales rows.
///
/// The export repeats date/department/customer/invoice only on a group's
/// first row, so those columns are forward-filled down the group before the
/// usual retention rules apply. Report rows never carry warehouse or tax
/// detail; those stay `None`.
pub fn clean_report_rows(rows: &[Vec<Data>]) -> Vec<SalesRow> {
    let Some((header, body)) = rows.split_first() else {
        return Vec::new();
    };
    let columns = match_columns(header);
    let idx = |wanted| column_index(&columns, wanted);

    let (date_idx, code_idx, qty_idx) = match (
        idx(ReportColumn::Date),
        idx(ReportColumn::ProductCode),
        idx(ReportColumn::Quantity),
    ) {
        (Some(d), Some(c), Some(q)) => (d, c, q),
        _ => {
            warn!("report header missing date, code or quantity column");
            return Vec::new();
        }
    };

    let mut filled_date: Option<NaiveDate> = None;
    let mut filled_department: Option<String> = None;
    let mut filled_customer: Option<String> = None;
    let mut filled_invoice: Option<String> = None;

    let mut out = Vec::new();
    for row in body {
        let cell = |i: usize| row.get(i);

        // Sparse header-like columns carry forward from the group's first row.
        if let Some(date) = cell_date(cell(date_idx)) {
            filled_date = Some(date);
        }
        if let Some(department) = idx(ReportColumn::Department).and_then(|i| cell_text(cell(i))) {
            filled_department = Some(department);
        }
        if let Some(customer) = idx(ReportColumn::Customer).and_then(|i| cell_text(cell(i))) {
            filled_customer = Some(customer);
        }
        if let Some(invoice) = idx(ReportColumn::InvoiceNo).and_then(|i| cell_text(cell(i))) {
            filled_invoice = Some(invoice);
        }

        let product_code = match cell_text(cell(code_idx)) {
            Some(code) => code,
            None => continue,
        };
        let quantity = cell_number(cell(qty_idx)) as i64;
        if quantity == 0 {
            continue;
        }
        let Some(trans_date) = filled_date else {
            continue;
        };

        out.push(SalesRow {
            trans_date,
            department: filled_department
                .clone()
                .unwrap_or_else(|| DEFAULT_DEPARTMENT.to_string()),
            customer: filled_customer
                .clone()
                .unwrap_or_else(|| DEFAULT_CUSTOMER.to_string()),
            invoice_no: filled_invoice.clone().unwrap_or_default(),
            product_code,
            product_name: idx(ReportColumn::ProductName)
                .and_then(|i| cell_text(cell(i)))
                .unwrap_or_default(),
            unit: idx(ReportColumn::Unit)
                .and_then(|i| cell_text(cell(i)))
                .unwrap_or_else(|| DEFAULT_UNIT.to_string()),
            quantity,
            unit_price: round2(idx(ReportColumn::UnitPrice).map_or(0.0, |i| cell_number(cell(i)))),
            total_price: round2(
                idx(ReportColumn::TotalPrice).map_or(0.0, |i| cell_number(cell(i))),
            ),
            cost: round2(idx(ReportColumn::Cost).map_or(0.0, |i| cell_number(cell(i)))),
            warehouse: None,
            vendor_price: None,
            dpp_amount: None,
            tax_amount: None,
        });
    }
    out
}

/// Parse the exported workbook's first sheet into sales rows.
pub fn parse_report_workbook(bytes: &[u8]) -> Result<Vec<SalesRow>, ExtractError> {
    let mut workbook = Xlsx::new(Cursor::new(bytes.to_vec()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(ExtractError::EmptyWorkbook)??;
    let rows: Vec<Vec<Data>> = range.rows().map(|row| row.to_vec()).collect();
    Ok(clean_report_rows(&rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeApi {
        pages: Vec<Vec<ListEntry>>,
        list_calls: AtomicUsize,
        failing_ids: Vec<i64>,
    }

    impl FakeApi {
        fn new(pages: Vec<Vec<ListEntry>>) -> Self {
            Self {
                pages,
                list_calls: AtomicUsize::new(0),
                failing_ids: Vec::new(),
            }
        }

        fn entries(count: usize, offset: i64) -> Vec<ListEntry> {
            (0..count)
                .map(|i| ListEntry {
                    id: offset + i as i64,
                    number: None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl PagedApi for FakeApi {
        async fn list_page(&self, page: usize) -> Result<Vec<ListEntry>, ExtractError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.get(page - 1).cloned().unwrap_or_default())
        }

        async fn detail(&self, id: i64) -> Result<JsonValue, ExtractError> {
            if self.failing_ids.contains(&id) {
                return Err(ExtractError::Decode {
                    what: "detail",
                    source: serde_json::from_str::<JsonValue>("boom").unwrap_err(),
                });
            }
            Ok(json!({ "id": id }))
        }
    }

    #[tokio::test]
    async fn pagination_stops_after_a_short_page() {
        let api = FakeApi::new(vec![FakeApi::entries(100, 0), FakeApi::entries(30, 100)]);
        let entries = fetch_list(&api, Duration::ZERO).await.unwrap();
        assert_eq!(entries.len(), 130);
        // The partial page terminates the sweep; no further list call issued.
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_first_page_terminates_immediately() {
        let api = FakeApi::new(vec![]);
        let entries = fetch_list(&api, Duration::ZERO).await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_detail_is_skipped_not_fatal() {
        let mut api = FakeApi::new(vec![FakeApi::entries(3, 0)]);
        api.failing_ids = vec![1];
        let details = fetch_all(&api, Duration::ZERO).await.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0]["id"], 0);
        assert_eq!(details[1]["id"], 2);
    }

    fn invoice_fixture() -> InvoiceDetail {
        serde_json::from_value(json!({
            "number": "SI-001",
            "transDate": "05/03/2024",
            "customer": { "name": "PT Pelanggan" },
            "branchName": "Cabang Utama",
            "detailItem": [
                {
                    "quantity": 2.0,
                    "unitPrice": 150000.456,
                    "totalPrice": 300000.912,
                    "unitCost": 0,
                    "averageCost": 0,
                    "item": { "no": "SKU-1", "name": "Produk A", "cost": 15000, "vendorPrice": 12000 },
                    "itemUnit": { "name": "BOX" },
                    "department": { "name": "Retail" },
                    "warehouse": { "name": "Gudang 1" },
                    "dppAmount": 270000.0,
                    "tax1Amount": 29700.0
                },
                { "quantity": 0, "item": { "no": "SKU-2" } },
                { "quantity": -1, "item": { "no": "SKU-3" } },
                { "quantity": 5, "item": { "no": "" } }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn flatten_keeps_only_positive_quantity_with_product_code() {
        let rows = flatten_invoice(&invoice_fixture());
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.invoice_no, "SI-001");
        assert_eq!(row.product_code, "SKU-1");
        assert_eq!(row.quantity, 2);
        assert_eq!(
            row.trans_date,
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
        assert_eq!(row.unit_price, 150000.46);
        assert_eq!(row.total_price, 300000.91);
    }

    #[test]
    fn cost_falls_back_to_master_item_cost() {
        let rows = flatten_invoice(&invoice_fixture());
        // unitCost and averageCost are zero (the API never populates them);
        // the master item cost is the first live tier.
        assert_eq!(rows[0].cost, 15000.00);
    }

    #[test]
    fn cost_defaults_to_zero_when_every_tier_is_absent() {
        let invoice: InvoiceDetail = serde_json::from_value(json!({
            "number": "SI-002",
            "transDate": "01/01/2024",
            "detailItem": [ { "quantity": 1, "item": { "no": "SKU-9" } } ]
        }))
        .unwrap();
        let rows = flatten_invoice(&invoice);
        assert_eq!(rows[0].cost, 0.00);
    }

    #[test]
    fn missing_names_fall_back_to_sentinels() {
        let invoice: InvoiceDetail = serde_json::from_value(json!({
            "number": "SI-003",
            "transDate": "02/01/2024",
            "detailItem": [ { "quantity": 1, "item": { "no": "SKU-9" } } ]
        }))
        .unwrap();
        let row = &flatten_invoice(&invoice)[0];
        assert_eq!(row.customer, DEFAULT_CUSTOMER);
        assert_eq!(row.department, DEFAULT_DEPARTMENT);
        assert_eq!(row.unit, DEFAULT_UNIT);
    }

    #[test]
    fn department_falls_back_to_branch_before_sentinel() {
        let invoice: InvoiceDetail = serde_json::from_value(json!({
            "number": "SI-004",
            "transDate": "02/01/2024",
            "branchName": "Cabang Dua",
            "detailItem": [ { "quantity": 1, "item": { "no": "SKU-9" } } ]
        }))
        .unwrap();
        assert_eq!(flatten_invoice(&invoice)[0].department, "Cabang Dua");
    }

    #[test]
    fn stock_rows_keep_zero_balances() {
        let item: ItemDetail = serde_json::from_value(json!({
            "no": "SKU-1",
            "name": "Produk A",
            "unitPrice": 100.005,
            "vendorPrice": 80.0,
            "detailWarehouseData": [
                { "warehouseName": "Gudang 1", "balance": 12 },
                { "warehouseName": "Gudang 2", "balance": 0 }
            ]
        }))
        .unwrap();
        let rows = flatten_item(&item);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].quantity, 12);
        assert_eq!(rows[1].quantity, 0);
        assert_eq!(rows[0].unit_price, 100.01);
    }

    fn s(text: &str) -> Data {
        Data::String(text.to_string())
    }

    fn report_fixture() -> Vec<Vec<Data>> {
        vec![
            vec![
                s("Tanggal"),
                s("Nama Departemen"),
                s("Nama Pelanggan"),
                s("Nomor #"),
                s("Kode #"),
                s("Nama Barang"),
                s("Satuan"),
                s("Kuantitas"),
                s("@Harga"),
                s("Total Harga"),
                s("BPP"),
            ],
            vec![
                s("05/03/2024"),
                s("Retail"),
                s("PT Pelanggan"),
                s("SI-100"),
                s("SKU-1"),
                s("Produk A"),
                s("PAIR"),
                Data::Float(2.0),
                Data::Float(1000.0),
                Data::Float(2000.0),
                Data::Float(500.0),
            ],
            vec![
                Data::Empty,
                Data::Empty,
                Data::Empty,
                Data::Empty,
                s("SKU-2"),
                s("Produk B"),
                s("PAIR"),
                Data::Float(1.0),
                Data::Float(500.0),
                Data::Float(500.0),
                Data::Float(200.0),
            ],
            vec![
                Data::Empty,
                Data::Empty,
                Data::Empty,
                Data::Empty,
                s("SKU-3"),
                s("Produk C"),
                s("PAIR"),
                Data::Float(3.0),
                Data::Float(100.0),
                Data::Float(300.0),
                Data::Float(50.0),
            ],
        ]
    }

    #[test]
    fn report_groups_forward_fill_header_columns() {
        let rows = clean_report_rows(&report_fixture());
        assert_eq!(rows.len(), 3);
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        for row in &rows {
            assert_eq!(row.trans_date, date);
            assert_eq!(row.invoice_no, "SI-100");
            assert_eq!(row.customer, "PT Pelanggan");
            assert_eq!(row.department, "Retail");
        }
        assert_eq!(rows[2].product_code, "SKU-3");
    }

    #[test]
    fn report_drops_zero_quantity_and_missing_codes() {
        let mut fixture = report_fixture();
        fixture.push(vec![
            Data::Empty,
            Data::Empty,
            Data::Empty,
            Data::Empty,
            s("SKU-4"),
            s("Produk D"),
            s("PAIR"),
            Data::Float(0.0),
            Data::Float(0.0),
            Data::Float(0.0),
            Data::Float(0.0),
        ]);
        fixture.push(vec![
            Data::Empty,
            Data::Empty,
            Data::Empty,
            Data::Empty,
            Data::Empty,
            s("Subtotal"),
            Data::Empty,
            Data::Float(6.0),
            Data::Empty,
            Data::Float(2800.0),
            Data::Empty,
        ]);
        let rows = clean_report_rows(&fixture);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn report_numeric_coercion_failures_become_zero() {
        let mut fixture = report_fixture();
        fixture[1][8] = s("not a number");
        let rows = clean_report_rows(&fixture);
        assert_eq!(rows[0].unit_price, 0.0);
        assert_eq!(rows[0].quantity, 2);
    }

    #[test]
    fn report_rows_leave_api_only_columns_null() {
        let rows = clean_report_rows(&report_fixture());
        assert!(rows[0].warehouse.is_none());
        assert!(rows[0].vendor_price.is_none());
        assert!(rows[0].dpp_amount.is_none());
        assert!(rows[0].tax_amount.is_none());
    }

    #[test]
    fn excel_serial_dates_convert_from_epoch_base() {
        assert_eq!(
            excel_serial_to_date(45356.0),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        // time-of-day fraction is dropped
        assert_eq!(
            excel_serial_to_date(45356.75),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
    }

    #[test]
    fn numeric_date_cells_parse_as_serials() {
        assert_eq!(
            cell_date(Some(&Data::Float(45356.0))),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
    }

    #[test]
    fn list_entry_accepts_item_style_code_field() {
        let entry: ListEntry = serde_json::from_value(json!({ "id": 9, "no": "SKU-9" })).unwrap();
        assert_eq!(entry.number.as_deref(), Some("SKU-9"));
    }
}
