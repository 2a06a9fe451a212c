//! Per-entity run orchestration: connect, fetch, normalize, persist, and
//! collect one outcome per entity so the caller can decide the exit code.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use erpsync_client::{ErpClient, ReportSession};
use erpsync_core::{
    resolve_api_credentials, resolve_report_credentials, DataKind, EntityConfig, EntityRegistry,
    LoadContext, SalesRow, SOURCE_API, SOURCE_REPORT,
};
use erpsync_extract as extract;
use erpsync_load as load;
use sqlx::PgPool;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "erpsync-pipeline";

/// Historical report pulls are sliced into windows of this many days,
/// inclusive of both ends. Larger windows time out server-side.
pub const REPORT_CHUNK_DAYS: i64 = 90;

/// The report host needs a pause between render and export; exporting
/// immediately returns an empty workbook.
pub const EXPORT_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding the per-entity `.env.<key>` files.
    pub env_dir: PathBuf,
    /// Destination for fallback CSVs and local exports.
    pub output_dir: PathBuf,
    /// Fetch and normalize, then report counts without touching the sink.
    pub dry_run: bool,
    /// Write a CSV export instead of loading the warehouse.
    pub local_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Loaded,
    DryRun,
    LocalExport,
    Skipped,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Loaded => "loaded",
            OutcomeStatus::DryRun => "dry-run",
            OutcomeStatus::LocalExport => "local-export",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntityOutcome {
    pub entity: String,
    pub kind: DataKind,
    pub rows: usize,
    pub status: OutcomeStatus,
    pub detail: Option<String>,
}

impl EntityOutcome {
    fn new(entity: &str, kind: DataKind, rows: usize, status: OutcomeStatus) -> Self {
        Self {
            entity: entity.to_string(),
            kind,
            rows,
            status,
            detail: None,
        }
    }

    fn failed(entity: &str, kind: DataKind, detail: String) -> Self {
        Self {
            detail: Some(detail),
            ..Self::new(entity, kind, 0, OutcomeStatus::Failed)
        }
    }
}

/// Outcomes for one invocation across its selected entities. One entity
/// failing never stops the others; the report decides the exit code.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<EntityOutcome>,
}

impl RunReport {
    pub fn push(&mut self, outcome: EntityOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status != OutcomeStatus::Failed)
    }

    pub fn log_summary(&self) {
        for outcome in &self.outcomes {
            info!(
                entity = %outcome.entity,
                kind = outcome.kind.as_str(),
                rows = outcome.rows,
                status = outcome.status.as_str(),
                detail = outcome.detail.as_deref().unwrap_or(""),
                "run outcome"
            );
        }
    }
}

/// Recent-window bounds: the last `days_back` calendar days up to and
/// including today, so `days_back = 1` is today alone.
pub fn sales_window(today: NaiveDate, days_back: u32) -> (NaiveDate, NaiveDate) {
    let span = days_back.saturating_sub(1) as i64;
    (today - chrono::Duration::days(span), today)
}

/// Contiguous chunks covering `[start, end]`, none longer than
/// [`REPORT_CHUNK_DAYS`].
pub fn report_chunks(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let chunk_end = (cursor + chrono::Duration::days(REPORT_CHUNK_DAYS - 1)).min(end);
        chunks.push((cursor, chunk_end));
        cursor = chunk_end + chrono::Duration::days(1);
    }
    chunks
}

fn select_entities<'r>(
    registry: &'r EntityRegistry,
    selector: Option<&str>,
) -> anyhow::Result<Vec<&'r EntityConfig>> {
    match selector {
        Some(key) => Ok(vec![registry.get(key)?]),
        None => Ok(registry.all().iter().collect()),
    }
}

/// Pull recent sales for every selected entity.
pub async fn sales_run(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    registry: &EntityRegistry,
    selector: Option<&str>,
    window: (NaiveDate, NaiveDate),
) -> anyhow::Result<RunReport> {
    let mut report = RunReport::default();
    for entity in select_entities(registry, selector)? {
        if entity.sales_table.is_none() {
            info!(entity = %entity.key, "entity carries no sales data, skipping");
            report.push(EntityOutcome::new(
                &entity.key,
                DataKind::Sales,
                0,
                OutcomeStatus::Skipped,
            ));
            continue;
        }
        report.push(run_sales(config, pool, entity, window).await);
    }
    report.log_summary();
    Ok(report)
}

/// Pull today's stock snapshot for every selected entity.
pub async fn stock_run(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    registry: &EntityRegistry,
    selector: Option<&str>,
) -> anyhow::Result<RunReport> {
    let mut report = RunReport::default();
    for entity in select_entities(registry, selector)? {
        report.push(run_stock(config, pool, entity).await);
    }
    report.log_summary();
    Ok(report)
}

/// Backfill sales from report exports over an explicit date range.
pub async fn historical_run(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    registry: &EntityRegistry,
    selector: Option<&str>,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<RunReport> {
    let mut report = RunReport::default();
    for entity in select_entities(registry, selector)? {
        if entity.sales_table.is_none() {
            report.push(EntityOutcome::new(
                &entity.key,
                DataKind::Sales,
                0,
                OutcomeStatus::Skipped,
            ));
            continue;
        }
        report.push(run_historical(config, pool, entity, start, end).await);
    }
    report.log_summary();
    Ok(report)
}

pub async fn run_sales(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    entity: &EntityConfig,
    window: (NaiveDate, NaiveDate),
) -> EntityOutcome {
    match sales_inner(config, pool, entity, window).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(entity = %entity.key, error = format!("{err:#}"), "sales run failed");
            EntityOutcome::failed(&entity.key, DataKind::Sales, format!("{err:#}"))
        }
    }
}

async fn sales_inner(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    entity: &EntityConfig,
    window: (NaiveDate, NaiveDate),
) -> anyhow::Result<EntityOutcome> {
    let credentials = resolve_api_credentials(entity, &config.env_dir)?;
    let mut client = ErpClient::new(credentials, entity.api_host.clone())?;
    let database = client.connect().await?;
    info!(entity = %entity.key, database = database.label(), "connected to provider");

    let invoices = extract::fetch_sales(&client, window.0, window.1).await?;
    let rows: Vec<SalesRow> = invoices.iter().flat_map(extract::flatten_invoice).collect();
    info!(
        entity = %entity.key,
        invoices = invoices.len(),
        rows = rows.len(),
        from = %window.0,
        to = %window.1,
        "sales fetch complete"
    );

    let ctx = LoadContext::new(
        SOURCE_API,
        DataKind::Sales,
        &entity.key,
        Local::now().naive_local(),
    );
    persist_sales(config, pool, entity, SOURCE_API, &rows, window, &ctx).await
}

async fn persist_sales(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    entity: &EntityConfig,
    source: &str,
    rows: &[SalesRow],
    window: (NaiveDate, NaiveDate),
    ctx: &LoadContext,
) -> anyhow::Result<EntityOutcome> {
    if config.dry_run {
        info!(entity = %entity.key, rows = rows.len(), "dry run, nothing persisted");
        return Ok(EntityOutcome::new(
            &entity.key,
            DataKind::Sales,
            rows.len(),
            OutcomeStatus::DryRun,
        ));
    }

    let pool = pool.context("no warehouse connection available")?;
    match load::load_sales(pool, source, entity, rows, window, ctx).await {
        Ok(record) => Ok(EntityOutcome::new(
            &entity.key,
            DataKind::Sales,
            record.rows_loaded as usize,
            OutcomeStatus::Loaded,
        )),
        Err(err) => {
            let failure =
                load::failure_record(source, entity, DataKind::Sales, ctx, window, &err.to_string());
            load::record_failure(pool, &failure).await;
            preserve_rows(config, ctx, rows);
            Err(err).context("loading sales rows")
        }
    }
}

pub async fn run_stock(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    entity: &EntityConfig,
) -> EntityOutcome {
    match stock_inner(config, pool, entity).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(entity = %entity.key, error = format!("{err:#}"), "stock run failed");
            EntityOutcome::failed(&entity.key, DataKind::Stock, format!("{err:#}"))
        }
    }
}

async fn stock_inner(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    entity: &EntityConfig,
) -> anyhow::Result<EntityOutcome> {
    let credentials = resolve_api_credentials(entity, &config.env_dir)?;
    let mut client = ErpClient::new(credentials, entity.api_host.clone())?;
    let database = client.connect().await?;
    info!(entity = %entity.key, database = database.label(), "connected to provider");

    let items = extract::fetch_stock(&client).await?;
    let rows: Vec<_> = items.iter().flat_map(extract::flatten_item).collect();
    info!(entity = %entity.key, items = items.len(), rows = rows.len(), "stock fetch complete");

    let ctx = LoadContext::new(
        SOURCE_API,
        DataKind::Stock,
        &entity.key,
        Local::now().naive_local(),
    );

    if config.local_only {
        let path = load::fallback_path(&config.output_dir, &ctx);
        load::write_csv(&path, &rows)?;
        info!(entity = %entity.key, path = %path.display(), "stock exported locally");
        return Ok(EntityOutcome::new(
            &entity.key,
            DataKind::Stock,
            rows.len(),
            OutcomeStatus::LocalExport,
        ));
    }
    if config.dry_run {
        info!(entity = %entity.key, rows = rows.len(), "dry run, nothing persisted");
        return Ok(EntityOutcome::new(
            &entity.key,
            DataKind::Stock,
            rows.len(),
            OutcomeStatus::DryRun,
        ));
    }

    let pool = pool.context("no warehouse connection available")?;
    match load::load_stock(pool, SOURCE_API, entity, &rows, &ctx).await {
        Ok(record) => Ok(EntityOutcome::new(
            &entity.key,
            DataKind::Stock,
            record.rows_loaded as usize,
            OutcomeStatus::Loaded,
        )),
        Err(err) => {
            let window = (ctx.snapshot_date, ctx.snapshot_date);
            let failure = load::failure_record(
                SOURCE_API,
                entity,
                DataKind::Stock,
                &ctx,
                window,
                &err.to_string(),
            );
            load::record_failure(pool, &failure).await;
            preserve_rows(config, &ctx, &rows);
            Err(err).context("loading stock snapshot")
        }
    }
}

pub async fn run_historical(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    entity: &EntityConfig,
    start: NaiveDate,
    end: NaiveDate,
) -> EntityOutcome {
    match historical_inner(config, pool, entity, start, end).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(entity = %entity.key, error = format!("{err:#}"), "historical run failed");
            EntityOutcome::failed(&entity.key, DataKind::Sales, format!("{err:#}"))
        }
    }
}

/// One failed chunk is logged and the remaining chunks still run; the
/// outcome only turns failed at the end so a transient error does not cost
/// the whole backfill.
async fn historical_inner(
    config: &PipelineConfig,
    pool: Option<&PgPool>,
    entity: &EntityConfig,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<EntityOutcome> {
    let credentials = resolve_report_credentials(entity, &config.env_dir)?;
    let session = ReportSession::new(credentials)?;

    let chunks = report_chunks(start, end);
    let mut total_rows = 0usize;
    let mut failed_chunks = 0usize;

    for (chunk_start, chunk_end) in &chunks {
        let rows = match fetch_report_chunk(&session, *chunk_start, *chunk_end).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    entity = %entity.key,
                    from = %chunk_start,
                    to = %chunk_end,
                    error = format!("{err:#}"),
                    "report chunk failed"
                );
                failed_chunks += 1;
                continue;
            }
        };
        info!(
            entity = %entity.key,
            from = %chunk_start,
            to = %chunk_end,
            rows = rows.len(),
            "report chunk cleaned"
        );

        let ctx = LoadContext::new(
            SOURCE_REPORT,
            DataKind::Sales,
            &entity.key,
            Local::now().naive_local(),
        );
        match persist_sales(
            config,
            pool,
            entity,
            SOURCE_REPORT,
            &rows,
            (*chunk_start, *chunk_end),
            &ctx,
        )
        .await
        {
            Ok(outcome) => total_rows += outcome.rows,
            Err(err) => {
                warn!(
                    entity = %entity.key,
                    from = %chunk_start,
                    to = %chunk_end,
                    error = format!("{err:#}"),
                    "report chunk load failed"
                );
                failed_chunks += 1;
            }
        }
    }

    if failed_chunks > 0 {
        return Ok(EntityOutcome {
            rows: total_rows,
            ..EntityOutcome::failed(
                &entity.key,
                DataKind::Sales,
                format!("{failed_chunks} of {} chunks failed", chunks.len()),
            )
        });
    }
    let status = if config.dry_run {
        OutcomeStatus::DryRun
    } else {
        OutcomeStatus::Loaded
    };
    Ok(EntityOutcome::new(
        &entity.key,
        DataKind::Sales,
        total_rows,
        status,
    ))
}

async fn fetch_report_chunk(
    session: &ReportSession,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<Vec<SalesRow>> {
    let cache_id = session.execute_report(start, end).await?;
    tokio::time::sleep(EXPORT_SETTLE).await;
    let bytes = session.export_report(&cache_id).await?;
    Ok(extract::parse_report_workbook(&bytes)?)
}

fn preserve_rows<T: serde::Serialize>(config: &PipelineConfig, ctx: &LoadContext, rows: &[T]) {
    let path = load::fallback_path(&config.output_dir, ctx);
    match load::write_csv(&path, rows) {
        Ok(()) => warn!(path = %path.display(), rows = rows.len(), "unpersisted rows preserved as csv"),
        Err(err) => error!(path = %path.display(), error = %err, "could not write fallback csv"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn recent_window_spans_exactly_days_back_days() {
        let (from, to) = sales_window(date(2026, 2, 24), 3);
        assert_eq!(from, date(2026, 2, 22));
        assert_eq!(to, date(2026, 2, 24));
        assert_eq!((to - from).num_days() + 1, 3);
    }

    #[test]
    fn one_day_window_is_today_alone() {
        let (from, to) = sales_window(date(2026, 2, 24), 1);
        assert_eq!(from, to);

        // zero behaves like one rather than inverting the window
        let (from, to) = sales_window(date(2026, 2, 24), 0);
        assert_eq!(from, to);
    }

    #[test]
    fn report_chunks_are_contiguous_and_capped() {
        let chunks = report_chunks(date(2026, 1, 1), date(2026, 6, 30));
        assert_eq!(
            chunks,
            vec![
                (date(2026, 1, 1), date(2026, 3, 31)),
                (date(2026, 4, 1), date(2026, 6, 29)),
                (date(2026, 6, 30), date(2026, 6, 30)),
            ]
        );
        for (from, to) in &chunks {
            assert!((*to - *from).num_days() < REPORT_CHUNK_DAYS);
        }
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1 + chrono::Duration::days(1), pair[1].0);
        }
    }

    #[test]
    fn single_day_range_is_one_chunk() {
        let chunks = report_chunks(date(2026, 5, 1), date(2026, 5, 1));
        assert_eq!(chunks, vec![(date(2026, 5, 1), date(2026, 5, 1))]);
    }

    #[test]
    fn inverted_range_yields_no_chunks() {
        assert!(report_chunks(date(2026, 5, 2), date(2026, 5, 1)).is_empty());
    }

    #[test]
    fn report_fails_only_on_failed_outcomes() {
        let mut report = RunReport::default();
        report.push(EntityOutcome::new("ddd", DataKind::Sales, 10, OutcomeStatus::Loaded));
        report.push(EntityOutcome::new("ljbb", DataKind::Sales, 0, OutcomeStatus::Skipped));
        assert!(report.all_succeeded());

        report.push(EntityOutcome::failed("mbb", DataKind::Sales, "boom".into()));
        assert!(!report.all_succeeded());
    }

    #[test]
    fn selector_picks_one_entity_or_all() {
        let registry = EntityRegistry::builtin();
        let one = select_entities(&registry, Some("mbb")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].key, "mbb");

        let all = select_entities(&registry, None).unwrap();
        assert_eq!(all.len(), 4);

        assert!(select_entities(&registry, Some("zzz")).is_err());
    }
}
