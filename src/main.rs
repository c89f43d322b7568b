use anyhow::Result;
use callstage::{
    catalog::CkanCatalog,
    config::{PipelineConfig, Timeouts, TEST_ROW_LIMIT},
    fetch::HttpArchiveFetcher,
    pipeline::Pipeline,
    store::GcsStore,
    warehouse::BigQueryWarehouse,
};
use clap::Parser;
use reqwest::Client;
use std::{env, sync::Arc};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Fetches a yearly 311 service-request archive and stages it as CSV + parquet
/// in GCS, then loads the parquet into a partitioned BigQuery table.
#[derive(Parser, Debug)]
#[command(name = "callstage")]
struct Args {
    /// GCS bucket for the staged CSV and parquet files
    #[arg(short = 'b', long = "bucket_name")]
    bucket_name: Option<String>,

    /// BigQuery dataset receiving the facts table
    #[arg(short = 'd', long = "dataset_name")]
    dataset_name: Option<String>,

    /// Year to extract (2015-2023)
    #[arg(short = 'y', long, default_value = "2020")]
    year: String,

    /// Re-run stages even if their destinations already exist
    #[arg(short = 'O', long)]
    overwrite: bool,

    /// Only transform a small section of the csv
    #[arg(short = 't', long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let args = Args::parse();

    // Deployment-environment defaults, resolved exactly once; components only
    // ever see the frozen config.
    let bucket = args
        .bucket_name
        .or_else(|| env::var("TF_VAR_data_lake_bucket").ok())
        .unwrap_or_else(|| "service-data-lake".to_string());
    let dataset = args
        .dataset_name
        .or_else(|| env::var("TF_VAR_bq_dataset").ok())
        .unwrap_or_else(|| "service_calls_models".to_string());
    let location = env::var("TF_VAR_region").unwrap_or_else(|_| "us-west1".to_string());

    let cfg = PipelineConfig::new(
        bucket,
        dataset,
        location,
        &args.year,
        args.overwrite,
        args.test.then_some(TEST_ROW_LIMIT),
        Timeouts::default(),
    )?;
    info!(
        bucket = %cfg.bucket,
        dataset = %cfg.dataset,
        year = cfg.year,
        overwrite = cfg.overwrite,
        "startup"
    );

    let client = Client::new();
    let catalog = Arc::new(CkanCatalog::new(client.clone(), cfg.timeouts.catalog));
    let fetcher = Arc::new(HttpArchiveFetcher::new(client, cfg.timeouts.download));
    let store = Arc::new(GcsStore::new().await?);
    let warehouse =
        Arc::new(BigQueryWarehouse::new(cfg.location.clone(), cfg.timeouts.load_poll).await?);

    let pipeline = Pipeline::new(cfg, catalog, fetcher, store, warehouse);
    let summary = pipeline.run().await?;

    info!(
        year = summary.year,
        normalized = %summary.normalized_uri,
        table = %summary.table,
        skipped_download = summary.skipped_download,
        skipped_transform = summary.skipped_transform,
        load_job = %summary.load.id,
        "pipeline done"
    );
    Ok(())
}
