//! One-shot enrichment: geocode the customer file and write the enriched workbook.

use address_enrichment::config::Config;
use address_enrichment::enrichment::enrich_from_config;
use tokio_util::sync::CancellationToken;

/// Main entry point for the enrichment script.
///
/// Loads the dataset found in the working directory, geocodes the records that
/// lack coordinates, persists the result and prints the run report as JSON.
/// Ctrl-C stops issuing lookups; what was resolved so far is still saved.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let outcome = enrich_from_config(&config, &cancel).await?;

    println!("{}", serde_json::to_string_pretty(&outcome.report)?);

    let missing = outcome.dataset.len() - outcome.dataset.geocoded_count();
    if missing > 0 {
        tracing::warn!("{} record(s) still have no coordinates", missing);
    }

    Ok(())
}
