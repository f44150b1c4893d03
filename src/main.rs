use address_enrichment::config::Config;
use address_enrichment::enrichment::enrich_from_config;
use address_enrichment::handlers::{self, AppState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the application.
///
/// Loads the customer dataset, geocodes whatever lacks coordinates (Ctrl-C
/// stops the geocoding early and keeps what was resolved), persists the
/// enriched file and then serves the dashboard read model until the next
/// Ctrl-C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "address_enrichment=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // One watcher for the whole process: it stops geocoding or the server
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let outcome = enrich_from_config(&config, &cancel).await?;

    if outcome.report.cancelled {
        tracing::warn!("Enrichment was interrupted, not starting the server");
        return Ok(());
    }

    tracing::info!(
        "Dataset ready: {}/{} record(s) geocoded",
        outcome.dataset.geocoded_count(),
        outcome.dataset.len()
    );

    let app_state = Arc::new(AppState {
        dataset: Arc::new(outcome.dataset),
        config: config.clone(),
        enrichment: Some(outcome.report),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    handlers::serve(listener, handlers::app(app_state), cancel).await?;
    tracing::info!("Server stopped");

    Ok(())
}
