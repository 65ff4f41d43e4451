use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sentivol_core::{MergeOutcome, TableRef};
use sentivol_storage::{BigQueryConfig, BigQueryWarehouse};
use sentivol_upsert::batch_file::{read_batch_file, read_schema_file};
use sentivol_upsert::{AppendRequest, UpsertConfig, UpsertRequest, Upserter};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sentivol")]
#[command(about = "Reconcile ingestion batches into warehouse tables")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge a batch into a table, updating existing keys and inserting new ones.
    Upsert(UpsertArgs),
    /// Append a batch to a table without key matching.
    Append(AppendArgs),
    /// Print the merge statement an upsert would run.
    Plan(PlanArgs),
}

#[derive(Debug, Args)]
struct TableArgs {
    /// `project.dataset.table`, `dataset.table`, or a bare name inside `BQ_DATASET`.
    #[arg(short, long)]
    table: String,
    /// JSON file with `[{name, type, mode}]` or `{"fields": [...]}`; skips the schema fetch.
    #[arg(long)]
    schema: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct UpsertArgs {
    #[command(flatten)]
    table: TableArgs,
    /// JSON array or newline-delimited JSON objects.
    #[arg(short, long)]
    batch: PathBuf,
    #[arg(short, long, value_delimiter = ',', required = true)]
    keys: Vec<String>,
    #[arg(long)]
    staging: Option<String>,
    #[arg(long, env = "SENTIVOL_LOCATION")]
    location: Option<String>,
}

#[derive(Debug, Args)]
struct AppendArgs {
    #[command(flatten)]
    table: TableArgs,
    #[arg(short, long)]
    batch: PathBuf,
    #[arg(long, env = "SENTIVOL_LOCATION")]
    location: Option<String>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(short, long)]
    table: String,
    #[arg(long)]
    schema: PathBuf,
    #[arg(short, long, value_delimiter = ',', required = true)]
    keys: Vec<String>,
    /// Batch file whose columns drive the plan.
    #[arg(short, long, conflicts_with = "columns")]
    batch: Option<PathBuf>,
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
    #[arg(long)]
    staging: Option<String>,
}

fn resolve_table(name: &str, bigquery: Option<&BigQueryConfig>) -> Result<TableRef> {
    if name.contains('.') {
        return name
            .parse()
            .with_context(|| format!("parsing table id {name}"));
    }
    match bigquery {
        Some(config) => Ok(config.table(name)),
        None => bail!("table `{name}` needs a dataset: pass dataset.table or set BQ_DATASET"),
    }
}

fn bigquery_upserter() -> Result<(Upserter<BigQueryWarehouse>, BigQueryConfig)> {
    let bigquery = BigQueryConfig::from_env()?;
    let warehouse = BigQueryWarehouse::new(bigquery.clone())?;
    Ok((Upserter::new(warehouse, UpsertConfig::from_env()), bigquery))
}

fn report(outcome: &MergeOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

async fn run_upsert(args: UpsertArgs) -> Result<()> {
    let (upserter, bigquery) = bigquery_upserter()?;
    let target = resolve_table(&args.table.table, Some(&bigquery))?;
    let batch = read_batch_file(&args.batch).await?;

    let mut request = UpsertRequest::new(target, batch, args.keys);
    if let Some(path) = &args.table.schema {
        request = request.with_schema(read_schema_file(path).await?);
    }
    if let Some(staging) = &args.staging {
        request = request.with_staging(resolve_table(staging, Some(&bigquery))?);
    }
    if let Some(location) = args.location {
        request = request.with_location(location);
    }

    match upserter.upsert(request).await {
        Ok(outcome) => report(&outcome),
        Err(err) => {
            if let Some(statement) = err.statement() {
                error!(status = err.status().as_str(), "failed statement:\n{statement}");
            }
            Err(err).context("upsert failed")
        }
    }
}

async fn run_append(args: AppendArgs) -> Result<()> {
    let (upserter, bigquery) = bigquery_upserter()?;
    let target = resolve_table(&args.table.table, Some(&bigquery))?;
    let batch = read_batch_file(&args.batch).await?;

    let mut request = AppendRequest::new(target, batch);
    if let Some(path) = &args.table.schema {
        request = request.with_schema(read_schema_file(path).await?);
    }
    request.location = args.location;

    let outcome = upserter.append(request).await.context("append failed")?;
    report(&outcome)
}

async fn run_plan(args: PlanArgs) -> Result<()> {
    // Planning never calls the warehouse; BigQuery settings only qualify bare table names.
    let bigquery = BigQueryConfig::from_env().ok();
    let target = resolve_table(&args.table, bigquery.as_ref())?;
    let staging = args
        .staging
        .as_deref()
        .map(|name| resolve_table(name, bigquery.as_ref()))
        .transpose()?;
    let schema = read_schema_file(&args.schema).await?;

    let columns = match &args.batch {
        Some(path) => read_batch_file(path).await?.columns().to_vec(),
        None if !args.columns.is_empty() => args.columns.clone(),
        None => schema.column_names().map(String::from).collect(),
    };

    let upserter = Upserter::new(sentivol_storage::MemoryWarehouse::new(), UpsertConfig::from_env());
    let plan = upserter
        .plan(&target, &schema, &args.keys, &columns, staging.as_ref())
        .context("planning merge")?;
    info!(basis = ?plan.ranking.basis, "planned merge");
    println!("{}", plan.render());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sentivol=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Upsert(args) => run_upsert(args).await,
        Commands::Append(args) => run_append(args).await,
        Commands::Plan(args) => run_plan(args).await,
    }
}
