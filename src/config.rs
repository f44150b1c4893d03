use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_OUTPUT_PATH: &str = "clientes_geolocalizados.xlsx";
pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub nominatim_base_url: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    /// Minimum spacing between two geocoder calls across the whole batch.
    pub min_request_interval: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed lookups that open the circuit breaker.
    pub breaker_threshold: u32,
    /// How long a tripped breaker stays open; doubles on each consecutive trip.
    pub breaker_cooldown: Duration,
    pub breaker_max_cooldown: Duration,
    pub output_path: PathBuf,
    pub input_candidates: Vec<PathBuf>,
    pub country: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            nominatim_base_url: DEFAULT_NOMINATIM_URL.to_string(),
            user_agent: default_user_agent(),
            request_timeout: Duration::from_secs(10),
            min_request_interval: Duration::from_secs(1),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(10),
            breaker_max_cooldown: Duration::from_secs(60),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            input_candidates: vec![
                PathBuf::from("clientes.xlsx"),
                PathBuf::from("clientes.csv"),
            ],
            country: "Argentina".to_string(),
        }
    }
}

fn default_user_agent() -> String {
    format!("dashboard_clientes/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| defaults.port.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            nominatim_base_url: std::env::var("NOMINATIM_BASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|url| {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        anyhow::bail!("NOMINATIM_BASE_URL must start with http:// or https://");
                    }
                    Ok(url.trim_end_matches('/').to_string())
                })
                .transpose()?
                .unwrap_or(defaults.nominatim_base_url),
            user_agent: std::env::var("GEOCODER_USER_AGENT")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.user_agent),
            request_timeout: env_secs("GEOCODER_TIMEOUT_SECS")?
                .unwrap_or(defaults.request_timeout),
            min_request_interval: env_millis("GEOCODER_MIN_INTERVAL_MS")?
                .unwrap_or(defaults.min_request_interval),
            max_attempts: env_u32("GEOCODER_MAX_ATTEMPTS")?
                .map(|attempts| {
                    if attempts == 0 {
                        anyhow::bail!("GEOCODER_MAX_ATTEMPTS must be at least 1");
                    }
                    Ok(attempts)
                })
                .transpose()?
                .unwrap_or(defaults.max_attempts),
            initial_backoff: env_millis("GEOCODER_BACKOFF_MS")?
                .unwrap_or(defaults.initial_backoff),
            max_backoff: defaults.max_backoff,
            breaker_threshold: env_u32("GEOCODER_BREAKER_THRESHOLD")?
                .map(|threshold| {
                    if threshold == 0 {
                        anyhow::bail!("GEOCODER_BREAKER_THRESHOLD must be at least 1");
                    }
                    Ok(threshold)
                })
                .transpose()?
                .unwrap_or(defaults.breaker_threshold),
            breaker_cooldown: env_secs("GEOCODER_BREAKER_COOLDOWN_SECS")?
                .unwrap_or(defaults.breaker_cooldown),
            breaker_max_cooldown: defaults.breaker_max_cooldown,
            output_path: std::env::var("ENRICHED_OUTPUT_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            input_candidates: std::env::var("INPUT_CANDIDATES")
                .ok()
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect::<Vec<_>>()
                })
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.input_candidates),
            country: std::env::var("ADDRESS_COUNTRY")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.country),
        };

        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Nominatim URL: {}", config.nominatim_base_url);
        tracing::debug!(
            "Geocoder: interval {:?}, {} attempt(s), timeout {:?}",
            config.min_request_interval,
            config.max_attempts,
            config.request_timeout
        );
        tracing::debug!("Enriched output: {}", config.output_path.display());
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    /// Files searched for the input dataset: the enrichment file first, so a
    /// previous run's coordinates are reused, then the raw candidates.
    pub fn discovery_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![self.output_path.clone()];
        for candidate in &self.input_candidates {
            if !candidates.contains(candidate) {
                candidates.push(candidate.clone());
            }
        }
        candidates
    }
}

fn env_u64(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer", name)),
        _ => Ok(None),
    }
}

fn env_u32(name: &str) -> anyhow::Result<Option<u32>> {
    env_u64(name)?
        .map(|value| {
            u32::try_from(value).map_err(|_| anyhow::anyhow!("{} is out of range", name))
        })
        .transpose()
}

fn env_millis(name: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_u64(name)?.map(Duration::from_millis))
}

fn env_secs(name: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_u64(name)?.map(Duration::from_secs))
}
