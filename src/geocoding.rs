use crate::config::Config;
use crate::errors::AppError;
use crate::models::Coordinate;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Why a single lookup produced no answer.
///
/// "Not found" is not an error: resolvers return `Ok(None)` for it.
#[derive(Debug, Clone, PartialEq)]
pub enum GeocodeError {
    /// Network failure or timeout.
    Transport(String),
    /// The service answered with a non-2xx status.
    Status(u16),
    /// The response body could not be understood.
    Decode(String),
    /// The request could not be built; retrying will not help.
    InvalidRequest(String),
    /// The circuit breaker rejected the call.
    CircuitOpen,
    /// The caller cancelled the batch while this lookup was pending.
    Cancelled,
}

impl GeocodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GeocodeError::Transport(_) | GeocodeError::Status(_) | GeocodeError::Decode(_)
        )
    }
}

impl fmt::Display for GeocodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeocodeError::Transport(msg) => write!(f, "geocoder request failed: {}", msg),
            GeocodeError::Status(status) => write!(f, "geocoder returned status {}", status),
            GeocodeError::Decode(msg) => write!(f, "failed to parse geocoder response: {}", msg),
            GeocodeError::InvalidRequest(msg) => write!(f, "invalid geocoder request: {}", msg),
            GeocodeError::CircuitOpen => write!(f, "geocoder circuit breaker is open"),
            GeocodeError::Cancelled => write!(f, "lookup cancelled"),
        }
    }
}

impl std::error::Error for GeocodeError {}

/// Resolves a free-text address to a coordinate.
///
/// Implementations perform exactly one lookup per call; rate limiting,
/// retries and caching are layered on top by the enrichment service.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinate>, GeocodeError>;
}

#[async_trait]
impl<G: Geocoder + ?Sized> Geocoder for Arc<G> {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinate>, GeocodeError> {
        (**self).geocode(address).await
    }
}

/// One entry of a Nominatim `/search` response.
#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

impl NominatimPlace {
    fn coordinate(&self) -> Result<Coordinate, GeocodeError> {
        let latitude = parse_degrees(&self.lat, 90.0)?;
        let longitude = parse_degrees(&self.lon, 180.0)?;
        Ok(Coordinate::new(latitude, longitude))
    }
}

fn parse_degrees(raw: &str, limit: f64) -> Result<f64, GeocodeError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.abs() <= limit)
        .ok_or_else(|| GeocodeError::Decode(format!("invalid coordinate value '{}'", raw)))
}

/// Forward geocoding against a Nominatim instance.
#[derive(Clone)]
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create geocoder client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.nominatim_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinate>, GeocodeError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/search", self.base_url),
            &[("q", address), ("format", "json"), ("limit", "1")],
        )
        .map_err(|e| GeocodeError::InvalidRequest(format!("Failed to build URL: {}", e)))?;

        tracing::debug!("Nominatim: searching '{}'", address);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GeocodeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
                tracing::warn!(
                    "Nominatim refused request with {} - check the request interval",
                    status
                );
            }
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let places: Vec<NominatimPlace> = response
            .json()
            .await
            .map_err(|e| GeocodeError::Decode(e.to_string()))?;

        match places.first() {
            Some(place) => {
                let coordinate = place.coordinate()?;
                tracing::debug!(
                    "Nominatim: '{}' -> {:.5},{:.5} ({})",
                    address,
                    coordinate.latitude,
                    coordinate.longitude,
                    place.display_name.as_deref().unwrap_or("-")
                );
                Ok(Some(coordinate))
            }
            None => Ok(None),
        }
    }
}
