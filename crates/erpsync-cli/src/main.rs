use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use erpsync_core::EntityRegistry;
use erpsync_load::SinkConfig;
use erpsync_pipeline::{sales_window, PipelineConfig, RunReport};
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "erpsync")]
#[command(about = "Accurate Online to Postgres warehouse pulls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Directory holding the per-entity .env files
    #[arg(long, global = true, default_value = ".")]
    env_dir: PathBuf,

    /// Destination for fallback CSVs and local exports
    #[arg(long, global = true, default_value = "output")]
    output: PathBuf,

    /// Override the warehouse host from PG_HOST / DATABASE_URL
    #[arg(long, global = true)]
    pg_host: Option<String>,

    /// Fetch and normalize but do not touch the warehouse
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull recent sales invoices through the official API
    Sales {
        /// Entity key, or "all"
        #[arg(default_value = "all")]
        entity: String,

        /// How many days back the window reaches
        #[arg(long, default_value_t = 3)]
        days: u32,
    },
    /// Pull today's stock snapshot for every warehouse
    Stock {
        /// Entity key, or "all"
        #[arg(default_value = "all")]
        entity: String,

        /// Write a CSV export instead of loading the warehouse
        #[arg(long)]
        local_only: bool,
    },
    /// Backfill sales from report exports over a date range
    Historical {
        /// Entity key, or "all"
        #[arg(default_value = "all")]
        entity: String,

        /// First transaction date, YYYY-MM-DD
        #[arg(long)]
        start: NaiveDate,

        /// Last transaction date, YYYY-MM-DD
        #[arg(long)]
        end: NaiveDate,
    },
    /// Apply warehouse schema migrations
    Migrate,
}

fn selector(entity: &str) -> Option<&str> {
    (entity != "all").then_some(entity)
}

async fn open_pool(common: &CommonArgs, needs_sink: bool) -> Result<Option<PgPool>> {
    if !needs_sink {
        return Ok(None);
    }
    let sink = SinkConfig::from_env().with_host_override(common.pg_host.clone());
    Ok(Some(erpsync_load::connect(&sink).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let registry = EntityRegistry::builtin();

    let report: RunReport = match cli.command {
        Commands::Sales { ref entity, days } => {
            let config = PipelineConfig {
                env_dir: cli.common.env_dir.clone(),
                output_dir: cli.common.output.clone(),
                dry_run: cli.common.dry_run,
                local_only: false,
            };
            let pool = open_pool(&cli.common, !config.dry_run).await?;
            let window = sales_window(Local::now().date_naive(), days);
            erpsync_pipeline::sales_run(&config, pool.as_ref(), &registry, selector(entity), window)
                .await?
        }
        Commands::Stock {
            ref entity,
            local_only,
        } => {
            let config = PipelineConfig {
                env_dir: cli.common.env_dir.clone(),
                output_dir: cli.common.output.clone(),
                dry_run: cli.common.dry_run,
                local_only,
            };
            let pool = open_pool(&cli.common, !config.dry_run && !config.local_only).await?;
            erpsync_pipeline::stock_run(&config, pool.as_ref(), &registry, selector(entity)).await?
        }
        Commands::Historical {
            ref entity,
            start,
            end,
        } => {
            if start > end {
                bail!("start date {start} is after end date {end}");
            }
            let config = PipelineConfig {
                env_dir: cli.common.env_dir.clone(),
                output_dir: cli.common.output.clone(),
                dry_run: cli.common.dry_run,
                local_only: false,
            };
            let pool = open_pool(&cli.common, !config.dry_run).await?;
            erpsync_pipeline::historical_run(
                &config,
                pool.as_ref(),
                &registry,
                selector(entity),
                start,
                end,
            )
            .await?
        }
        Commands::Migrate => {
            let sink = SinkConfig::from_env().with_host_override(cli.common.pg_host.clone());
            let pool = erpsync_load::connect(&sink).await?;
            erpsync_load::run_migrations(&pool).await?;
            info!("migrations applied");
            return Ok(());
        }
    };

    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn all_maps_to_no_selector() {
        assert_eq!(selector("all"), None);
        assert_eq!(selector("ddd"), Some("ddd"));
    }
}
