/// Address enrichment: attaches coordinates to customer records.
///
/// The workflow for a dataset:
/// 1. Skip entirely if both coordinate columns are already populated
/// 2. Compose each unresolved record's address (incomplete ones are skipped)
/// 3. Resolve through the geocoder: cache, circuit breaker, rate limiter, retries
/// 4. Persist the enriched dataset to the well-known output file
use crate::circuit_breaker::{create_geocoder_circuit_breaker, Admission, GeocoderCircuitBreaker};
use crate::config::Config;
use crate::errors::AppError;
use crate::geocoding::{GeocodeError, Geocoder, NominatimGeocoder};
use crate::models::{Coordinate, Dataset};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::storage;
use chrono::{DateTime, Utc};
use failsafe::futures::CircuitBreaker;
use moka::future::Cache;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Counters describing one enrichment run.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentReport {
    pub total_records: usize,
    /// Records that already carried a coordinate when the run started.
    pub previously_resolved: usize,
    pub resolved: usize,
    pub not_found: usize,
    /// Lookups that kept failing after retries (demoted to not found).
    pub failed: usize,
    pub incomplete_address: usize,
    pub cache_hits: usize,
    /// Number of times the geocoder itself was invoked, retries included.
    pub geocoder_calls: usize,
    /// True when the dataset was already fully geocoded and left untouched.
    pub skipped: bool,
    pub cancelled: bool,
    pub persisted_to: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EnrichmentReport {
    fn start(total_records: usize) -> Self {
        Self {
            total_records,
            previously_resolved: 0,
            resolved: 0,
            not_found: 0,
            failed: 0,
            incomplete_address: 0,
            cache_hits: 0,
            geocoder_calls: 0,
            skipped: false,
            cancelled: false,
            persisted_to: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// The enriched dataset together with what happened to it.
#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub dataset: Dataset,
    pub report: EnrichmentReport,
}

/// Enrichment finished but the result could not be persisted.
///
/// The in-memory outcome is kept so the caller can retry the write alone.
#[derive(Debug)]
pub struct EnrichmentFailure {
    pub outcome: Box<EnrichmentOutcome>,
    pub error: AppError,
}

impl EnrichmentFailure {
    pub fn into_outcome(self) -> EnrichmentOutcome {
        *self.outcome
    }
}

impl fmt::Display for EnrichmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enriched {} record(s) but could not persist them: {}",
            self.outcome.dataset.len(),
            self.error
        )
    }
}

impl std::error::Error for EnrichmentFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

enum LookupOutcome {
    Found(Coordinate),
    NotFound,
    Failed(GeocodeError),
    Cancelled,
}

/// Geocodes the records of a dataset and persists the result.
pub struct AddressEnricher<G> {
    geocoder: G,
    limiter: RateLimiter,
    retry: RetryPolicy,
    breaker: GeocoderCircuitBreaker,
    /// Definitive answers per composed address, for the lifetime of the enricher.
    cache: Cache<String, Option<Coordinate>>,
    output_path: PathBuf,
    country: String,
}

impl<G: Geocoder> AddressEnricher<G> {
    pub fn new(geocoder: G, config: &Config) -> Self {
        Self {
            geocoder,
            limiter: RateLimiter::new(config.min_request_interval),
            retry: RetryPolicy::from_config(config),
            breaker: create_geocoder_circuit_breaker(
                config.breaker_threshold,
                config.breaker_cooldown,
                config.breaker_max_cooldown,
            ),
            cache: Cache::builder().max_capacity(100_000).build(),
            output_path: config.output_path.clone(),
            country: config.country.clone(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Resolves missing coordinates and persists the enriched dataset.
    ///
    /// A dataset that is already fully geocoded is returned unchanged and is
    /// not written again. Individual lookup failures never abort the run;
    /// only a persistence failure is returned as an error.
    pub async fn enrich(
        &self,
        dataset: Dataset,
        cancel: &CancellationToken,
    ) -> Result<EnrichmentOutcome, EnrichmentFailure> {
        if dataset.is_fully_geocoded() {
            tracing::info!(
                "All {} record(s) already have coordinates, skipping geocoding",
                dataset.len()
            );
            let mut report = EnrichmentReport::start(dataset.len());
            report.previously_resolved = dataset.len();
            report.skipped = true;
            report.finish();
            return Ok(EnrichmentOutcome { dataset, report });
        }

        let mut outcome = self.resolve(dataset, cancel).await;

        match storage::persist_dataset(&outcome.dataset, &self.output_path) {
            Ok(()) => {
                outcome.report.persisted_to = Some(self.output_path.clone());
                Ok(outcome)
            }
            Err(error) => {
                tracing::error!("✗ Failed to persist enriched dataset: {}", error);
                Err(EnrichmentFailure {
                    outcome: Box::new(outcome),
                    error,
                })
            }
        }
    }

    /// Resolves coordinates for every record lacking one, in dataset order.
    ///
    /// Performs no I/O besides geocoder calls.
    pub async fn resolve(&self, mut dataset: Dataset, cancel: &CancellationToken) -> EnrichmentOutcome {
        let mut report = EnrichmentReport::start(dataset.len());
        let total = dataset.len();

        tracing::info!("Starting geocoding of {} record(s)", total);

        for (idx, record) in dataset.records_mut().iter_mut().enumerate() {
            if record.coordinate.is_some() {
                report.previously_resolved += 1;
                continue;
            }

            let Some(address) = record.compose_address(&self.country) else {
                tracing::debug!(
                    "[{}/{}] Skipping '{}': incomplete address",
                    idx + 1,
                    total,
                    record.client
                );
                report.incomplete_address += 1;
                continue;
            };

            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if let Some(cached) = self.cache.get(&address).await {
                report.cache_hits += 1;
                record.coordinate = cached;
                continue;
            }

            match self.lookup(&address, cancel, &mut report.geocoder_calls).await {
                LookupOutcome::Found(coordinate) => {
                    tracing::info!(
                        "[{}/{}] ✓ {} -> {:.5},{:.5}",
                        idx + 1,
                        total,
                        address,
                        coordinate.latitude,
                        coordinate.longitude
                    );
                    self.cache.insert(address, Some(coordinate)).await;
                    record.coordinate = Some(coordinate);
                    report.resolved += 1;
                }
                LookupOutcome::NotFound => {
                    tracing::warn!("[{}/{}] No match for '{}'", idx + 1, total, address);
                    self.cache.insert(address, None).await;
                    report.not_found += 1;
                }
                LookupOutcome::Failed(e) => {
                    tracing::warn!(
                        "[{}/{}] ✗ Geocoding '{}' failed: {}",
                        idx + 1,
                        total,
                        address,
                        e
                    );
                    report.failed += 1;
                }
                LookupOutcome::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }
        }

        if report.cancelled {
            tracing::warn!("Geocoding cancelled, keeping what was resolved so far");
        }

        dataset.mark_coordinate_columns();
        report.finish();

        tracing::info!(
            "Geocoding finished: {} resolved, {} not found, {} failed, {} incomplete, {} cached",
            report.resolved,
            report.not_found,
            report.failed,
            report.incomplete_address,
            report.cache_hits
        );

        EnrichmentOutcome { dataset, report }
    }

    async fn lookup(
        &self,
        address: &str,
        cancel: &CancellationToken,
        calls: &mut usize,
    ) -> LookupOutcome {
        // The first lookup after the open window gets one attempt; retries resume once it closes
        let policy = match self.breaker.admit(cancel).await {
            Admission::Closed => self.retry,
            Admission::HalfOpen => self.retry.with_max_attempts(1),
            Admission::Cancelled => return LookupOutcome::Cancelled,
        };

        let result = self
            .breaker
            .call(self.lookup_with_retry(address, policy, cancel, calls))
            .await;

        match result {
            Ok(Some(coordinate)) => LookupOutcome::Found(coordinate),
            Ok(None) => LookupOutcome::NotFound,
            Err(failsafe::Error::Inner(GeocodeError::Cancelled)) => LookupOutcome::Cancelled,
            Err(failsafe::Error::Inner(e)) => LookupOutcome::Failed(e),
            Err(failsafe::Error::Rejected) => {
                if cancel.is_cancelled() {
                    LookupOutcome::Cancelled
                } else {
                    LookupOutcome::Failed(GeocodeError::CircuitOpen)
                }
            }
        }
    }

    async fn lookup_with_retry(
        &self,
        address: &str,
        policy: RetryPolicy,
        cancel: &CancellationToken,
        calls: &mut usize,
    ) -> Result<Option<Coordinate>, GeocodeError> {
        let mut attempt = 1;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GeocodeError::Cancelled),
                _ = self.limiter.acquire() => {}
            }

            *calls += 1;
            match self.geocoder.geocode(address).await {
                Ok(found) => return Ok(found),
                Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.backoff(attempt);
                    tracing::debug!(
                        "Attempt {}/{} for '{}' failed ({}), retrying in {:?}",
                        attempt,
                        policy.max_attempts,
                        address,
                        e,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(GeocodeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Loads the configured dataset, enriches it against Nominatim and persists it.
///
/// A persistence failure is retried once before giving up.
pub async fn enrich_from_config(
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<EnrichmentOutcome> {
    let working_dir = std::env::current_dir()?;
    let input = storage::discover_input(&working_dir, &config.discovery_candidates())?;
    let dataset = storage::load_dataset(&input)?;

    let geocoder = NominatimGeocoder::new(config)?;
    let enricher = AddressEnricher::new(geocoder, config);

    match enricher.enrich(dataset, cancel).await {
        Ok(outcome) => Ok(outcome),
        Err(failure) => {
            tracing::warn!("Retrying persistence of enriched dataset");
            let mut outcome = failure.into_outcome();
            storage::persist_dataset(&outcome.dataset, enricher.output_path())?;
            outcome.report.persisted_to = Some(enricher.output_path().to_path_buf());
            Ok(outcome)
        }
    }
}
