use crate::config::Config;
use crate::enrichment::EnrichmentReport;
use crate::errors::AppError;
use crate::models::Dataset;
use crate::report::{self, ClientFilter, ClientRow, FilterOptions, MapView, SalesSummary};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Largest request body accepted; the API is read-only.
pub const MAX_REQUEST_BODY: usize = 64 * 1024;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// The enriched dataset, read-only for the lifetime of the server.
    pub dataset: Arc<Dataset>,
    /// Application configuration.
    pub config: Config,
    /// What the startup enrichment run did.
    pub enrichment: Option<EnrichmentReport>,
}

/// Query parameters shared by the read endpoints.
///
/// Multi-valued filters are comma-separated: `?provincia=Córdoba,Mendoza`.
#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    pub provincia: Option<String>,
    pub grupo: Option<String>,
    pub ventas_min: Option<f64>,
    pub ventas_max: Option<f64>,
}

impl ReportQuery {
    pub fn into_filter(self) -> Result<ClientFilter, AppError> {
        let split = |raw: Option<String>| -> Vec<String> {
            raw.map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
        };

        let filter = ClientFilter {
            provinces: split(self.provincia),
            groups: split(self.grupo),
            min_sales: self.ventas_min,
            max_sales: self.ventas_max,
        };
        filter.validate()?;
        Ok(filter)
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/filters", get(get_filters))
        .route("/api/v1/clients", get(get_clients))
        .route("/api/v1/summary", get(get_summary))
        .route("/api/v1/map", get(get_map))
        .route("/api/v1/enrichment", get(get_enrichment))
        .with_state(state)
}

/// The routes wrapped in the HTTP middleware stack the binary serves.
pub fn app(state: Arc<AppState>) -> Router {
    routes(state)
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serves `app` until `shutdown` is cancelled, then drains open connections.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "address-enrichment",
            "version": env!("CARGO_PKG_VERSION"),
            "records": state.dataset.len(),
            "geocoded": state.dataset.geocoded_count(),
        })),
    )
}

/// GET /api/v1/filters
///
/// Distinct provinces and economic groups plus the sales range, used to
/// populate the dashboard's filter widgets.
pub async fn get_filters(State(state): State<Arc<AppState>>) -> Json<FilterOptions> {
    Json(report::filter_options(&state.dataset))
}

/// GET /api/v1/clients
pub async fn get_clients(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<Vec<ClientRow>>, AppError> {
    let filter = query.into_filter()?;
    let rows = filter
        .apply(&state.dataset)
        .into_iter()
        .map(ClientRow::from)
        .collect();
    Ok(Json(rows))
}

/// GET /api/v1/summary
pub async fn get_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<SalesSummary>, AppError> {
    let filter = query.into_filter()?;
    let records = filter.apply(&state.dataset);
    tracing::debug!("Summary over {} matching client(s)", records.len());
    Ok(Json(report::summarize(&records)))
}

/// GET /api/v1/map
pub async fn get_map(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<MapView>, AppError> {
    let filter = query.into_filter()?;
    let records = filter.apply(&state.dataset);
    Ok(Json(report::map_view(&records)))
}

/// GET /api/v1/enrichment
///
/// Report of the geocoding run performed at startup.
pub async fn get_enrichment(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "output_path": state.config.output_path,
        "report": state.enrichment,
    }))
}
