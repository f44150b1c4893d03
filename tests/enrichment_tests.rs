/// Tests for the address enrichment workflow
/// Uses a scripted in-memory geocoder and tokio's paused clock
use address_enrichment::config::Config;
use address_enrichment::enrichment::AddressEnricher;
use address_enrichment::geocoding::{GeocodeError, Geocoder};
use address_enrichment::models::{
    CellValue, Coordinate, Dataset, COLUMN_CLIENT, COLUMN_LATITUDE, COLUMN_LOCALITY,
    COLUMN_LONGITUDE, COLUMN_POSTAL_CODE, COLUMN_PROVINCE, COLUMN_SALES,
};
use address_enrichment::storage;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Answer = Result<Option<Coordinate>, GeocodeError>;

/// Geocoder answering from a per-address script, recording every call.
#[derive(Default)]
struct MockGeocoder {
    scripted: Mutex<HashMap<String, VecDeque<Answer>>>,
    fallback: Option<Answer>,
    calls: Mutex<Vec<(String, Instant)>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl MockGeocoder {
    fn new() -> Self {
        Self::default()
    }

    fn respond(self, address: &str, answer: Answer) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push_back(answer);
        self
    }

    fn found(self, address: &str, latitude: f64, longitude: f64) -> Self {
        self.respond(address, Ok(Some(Coordinate::new(latitude, longitude))))
    }

    fn otherwise(mut self, answer: Answer) -> Self {
        self.fallback = Some(answer);
        self
    }

    fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(address, _)| address.clone())
            .collect()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinate>, GeocodeError> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((address.to_string(), Instant::now()));
            calls.len()
        };
        if let Some((after, token)) = &self.cancel_after {
            if count >= *after {
                token.cancel();
            }
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(address)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(answer) => answer,
            None => self.fallback.clone().unwrap_or(Ok(None)),
        }
    }
}

/// Helper function to create test config writing into `dir`
fn create_test_config(dir: &Path) -> Config {
    Config {
        output_path: dir.join("clientes_geolocalizados.xlsx"),
        min_request_interval: Duration::from_secs(1),
        max_attempts: 3,
        initial_backoff: Duration::from_millis(200),
        ..Config::default()
    }
}

fn header(with_coordinates: bool) -> Vec<String> {
    let mut names = vec![
        COLUMN_CLIENT,
        COLUMN_POSTAL_CODE,
        COLUMN_LOCALITY,
        COLUMN_PROVINCE,
        COLUMN_SALES,
    ];
    if with_coordinates {
        names.push(COLUMN_LATITUDE);
        names.push(COLUMN_LONGITUDE);
    }
    names.into_iter().map(String::from).collect()
}

fn text(s: &str) -> CellValue {
    if s.is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(s.to_string())
    }
}

fn dataset(rows: &[(&str, &str, &str, &str)]) -> Dataset {
    let rows = rows
        .iter()
        .map(|(id, postal, locality, province)| {
            vec![
                text(id),
                text(postal),
                text(locality),
                text(province),
                CellValue::Number(1000.0),
            ]
        })
        .collect();
    Dataset::from_rows(header(false), rows).unwrap()
}

fn dataset_with_coordinates(rows: &[(&str, &str, Option<(f64, f64)>)]) -> Dataset {
    let rows = rows
        .iter()
        .map(|(id, postal, coordinate)| {
            vec![
                text(id),
                text(postal),
                text("CABA"),
                text("Buenos Aires"),
                CellValue::Number(1000.0),
                coordinate.map_or(CellValue::Empty, |c| CellValue::Number(c.0)),
                coordinate.map_or(CellValue::Empty, |c| CellValue::Number(c.1)),
            ]
        })
        .collect();
    Dataset::from_rows(header(true), rows).unwrap()
}

fn coordinates(dataset: &Dataset) -> Vec<Option<Coordinate>> {
    dataset.records().iter().map(|r| r.coordinate).collect()
}

#[tokio::test(start_paused = true)]
async fn test_single_record_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder =
        Arc::new(MockGeocoder::new().found("1000, CABA, Buenos Aires, Argentina", -34.6, -58.4));
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset(&[("A", "1000", "CABA", "Buenos Aires")]);
    let outcome = enricher
        .enrich(input, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.dataset.len(), 1);
    assert_eq!(
        outcome.dataset.records()[0].coordinate,
        Some(Coordinate::new(-34.6, -58.4))
    );
    assert_eq!(geocoder.calls(), vec!["1000, CABA, Buenos Aires, Argentina"]);
    assert_eq!(outcome.report.resolved, 1);
    assert_eq!(outcome.report.persisted_to.as_deref(), Some(config.output_path.as_path()));
    assert!(config.output_path.exists());
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_address_never_sent() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder = Arc::new(MockGeocoder::new().otherwise(Ok(Some(Coordinate::new(1.0, 1.0)))));
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset(&[("B", "", "X", "Y")]);
    let outcome = enricher
        .enrich(input, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(coordinates(&outcome.dataset), vec![None]);
    assert!(geocoder.calls().is_empty());
    assert_eq!(outcome.report.incomplete_address, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fully_geocoded_dataset_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder = Arc::new(MockGeocoder::new().otherwise(Ok(Some(Coordinate::new(0.0, 0.0)))));
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset_with_coordinates(&[
        ("A", "1000", Some((-34.6, -58.4))),
        ("B", "1001", Some((-34.7, -58.5))),
        ("C", "1002", Some((-34.8, -58.6))),
    ]);
    let outcome = enricher
        .enrich(input.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.dataset, input);
    assert!(geocoder.calls().is_empty());
    assert!(outcome.report.skipped);
    assert_eq!(outcome.report.persisted_to, None);
    assert!(!config.output_path.exists());
}

#[tokio::test(start_paused = true)]
async fn test_only_missing_coordinates_are_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder = Arc::new(
        MockGeocoder::new().found("1001, CABA, Buenos Aires, Argentina", -34.7, -58.5),
    );
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset_with_coordinates(&[
        ("A", "1000", Some((-34.6, -58.4))),
        ("B", "1001", None),
    ]);
    let outcome = enricher
        .enrich(input, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(geocoder.calls(), vec!["1001, CABA, Buenos Aires, Argentina"]);
    assert_eq!(
        coordinates(&outcome.dataset),
        vec![
            Some(Coordinate::new(-34.6, -58.4)),
            Some(Coordinate::new(-34.7, -58.5))
        ]
    );
    assert_eq!(outcome.report.previously_resolved, 1);
}

#[tokio::test(start_paused = true)]
async fn test_calls_respect_minimum_interval() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder = Arc::new(MockGeocoder::new().otherwise(Ok(Some(Coordinate::new(-30.0, -60.0)))));
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset(&[
        ("A", "1000", "CABA", "Buenos Aires"),
        ("B", "5000", "Córdoba", "Córdoba"),
        ("C", "5500", "Mendoza", "Mendoza"),
        ("D", "2000", "Rosario", "Santa Fe"),
        ("E", "4000", "San Miguel de Tucumán", "Tucumán"),
    ]);
    let outcome = enricher
        .enrich(input, &CancellationToken::new())
        .await
        .unwrap();

    let times = geocoder.call_times();
    assert_eq!(times.len(), 5);
    for pair in times.windows(2) {
        assert!(
            pair[1] - pair[0] >= config.min_request_interval,
            "calls only {:?} apart",
            pair[1] - pair[0]
        );
    }
    assert_eq!(outcome.report.resolved, 5);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_rate_limited_too() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        initial_backoff: Duration::from_millis(10),
        ..create_test_config(dir.path())
    };
    let address = "1000, CABA, Buenos Aires, Argentina";
    let geocoder = Arc::new(
        MockGeocoder::new()
            .respond(address, Err(GeocodeError::Status(503)))
            .respond(address, Err(GeocodeError::Transport("timeout".into())))
            .found(address, -34.6, -58.4),
    );
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let outcome = enricher
        .enrich(
            dataset(&[("A", "1000", "CABA", "Buenos Aires")]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let times = geocoder.call_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= config.min_request_interval);
    }
    assert_eq!(outcome.report.resolved, 1);
    assert_eq!(outcome.report.geocoder_calls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_failure_does_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let bad = "5000, Córdoba, Córdoba, Argentina";
    let geocoder = Arc::new(
        MockGeocoder::new()
            .found("1000, CABA, Buenos Aires, Argentina", -34.6, -58.4)
            .respond(bad, Err(GeocodeError::Transport("connection reset".into())))
            .respond(bad, Err(GeocodeError::Transport("connection reset".into())))
            .respond(bad, Err(GeocodeError::Status(502)))
            .found("5500, Mendoza, Mendoza, Argentina", -32.9, -68.8),
    );
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset(&[
        ("A", "1000", "CABA", "Buenos Aires"),
        ("B", "5000", "Córdoba", "Córdoba"),
        ("C", "5500", "Mendoza", "Mendoza"),
    ]);
    let outcome = enricher
        .enrich(input, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.dataset.len(), 3);
    assert_eq!(
        coordinates(&outcome.dataset),
        vec![
            Some(Coordinate::new(-34.6, -58.4)),
            None,
            Some(Coordinate::new(-32.9, -68.8))
        ]
    );
    let bad_calls = geocoder.calls().iter().filter(|a| a.as_str() == bad).count();
    assert_eq!(bad_calls, config.max_attempts as usize);
    assert_eq!(outcome.report.failed, 1);
    assert_eq!(outcome.report.resolved, 2);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder = Arc::new(MockGeocoder::new());
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let outcome = enricher
        .enrich(
            dataset(&[("Z", "9999", "Nowhere", "Atlantis")]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(geocoder.calls().len(), 1);
    assert_eq!(coordinates(&outcome.dataset), vec![None]);
    assert_eq!(outcome.report.not_found, 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder = Arc::new(
        MockGeocoder::new().otherwise(Err(GeocodeError::InvalidRequest("bad url".into()))),
    );
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let outcome = enricher
        .enrich(
            dataset(&[("A", "1000", "CABA", "Buenos Aires")]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(geocoder.calls().len(), 1);
    assert_eq!(outcome.report.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_addresses_are_resolved_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder = Arc::new(MockGeocoder::new().found(
        "1000, CABA, Buenos Aires, Argentina",
        -34.6,
        -58.4,
    ));
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset(&[
        ("A", "1000", "CABA", "Buenos Aires"),
        ("B", "1000", "CABA", "Buenos Aires"),
        ("C", "1000", " CABA ", "Buenos Aires"),
    ]);
    let outcome = enricher
        .enrich(input, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(geocoder.calls().len(), 1);
    assert_eq!(outcome.report.cache_hits, 2);
    assert!(coordinates(&outcome.dataset)
        .iter()
        .all(|c| *c == Some(Coordinate::new(-34.6, -58.4))));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_lookups_and_persists_progress() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let cancel = CancellationToken::new();
    let geocoder = Arc::new(
        MockGeocoder::new()
            .otherwise(Ok(Some(Coordinate::new(-30.0, -60.0))))
            .cancel_after(2, cancel.clone()),
    );
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset(&[
        ("A", "1000", "CABA", "Buenos Aires"),
        ("B", "5000", "Córdoba", "Córdoba"),
        ("C", "5500", "Mendoza", "Mendoza"),
        ("D", "2000", "Rosario", "Santa Fe"),
    ]);
    let outcome = enricher.enrich(input, &cancel).await.unwrap();

    assert_eq!(geocoder.calls().len(), 2);
    assert!(outcome.report.cancelled);
    assert_eq!(outcome.dataset.len(), 4);
    assert_eq!(outcome.dataset.geocoded_count(), 2);

    let reloaded = storage::load_dataset(&config.output_path).unwrap();
    assert_eq!(reloaded.geocoded_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(dir.path());
    let geocoder = Arc::new(MockGeocoder::new());
    let enricher = AddressEnricher::new(geocoder.clone(), &config);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = enricher
        .enrich(dataset(&[("A", "1000", "CABA", "Buenos Aires")]), &cancel)
        .await
        .unwrap();

    assert!(geocoder.calls().is_empty());
    assert!(outcome.report.cancelled);
    assert!(config.output_path.exists());
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_keeps_enrichment() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not_a_directory");
    std::fs::write(&blocker, "file").unwrap();

    let config = Config {
        output_path: blocker.join("clientes_geolocalizados.xlsx"),
        ..create_test_config(dir.path())
    };
    let geocoder = Arc::new(
        MockGeocoder::new().found("1000, CABA, Buenos Aires, Argentina", -34.6, -58.4),
    );
    let enricher = AddressEnricher::new(geocoder, &config);

    let failure = enricher
        .enrich(
            dataset(&[("A", "1000", "CABA", "Buenos Aires")]),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error.root(),
        address_enrichment::errors::AppError::Persistence(_)
    ));
    let outcome = failure.into_outcome();
    assert_eq!(
        outcome.dataset.records()[0].coordinate,
        Some(Coordinate::new(-34.6, -58.4))
    );

    // The caller can retry the write alone
    let retry_path = dir.path().join("retry.xlsx");
    storage::persist_dataset(&outcome.dataset, &retry_path).unwrap();
    assert!(retry_path.exists());
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_stops_hammering_dead_service() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        breaker_threshold: 2,
        ..create_test_config(dir.path())
    };
    let geocoder = Arc::new(
        MockGeocoder::new().otherwise(Err(GeocodeError::Transport("connection refused".into()))),
    );
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset(&[
        ("A", "1000", "CABA", "Buenos Aires"),
        ("B", "5000", "Córdoba", "Córdoba"),
        ("C", "5500", "Mendoza", "Mendoza"),
        ("D", "2000", "Rosario", "Santa Fe"),
        ("E", "4000", "Tucumán", "Tucumán"),
    ]);
    let outcome = enricher
        .enrich(input, &CancellationToken::new())
        .await
        .unwrap();

    // A and B get full retries and trip the breaker; C, D and E get a single attempt each
    let attempts = config.max_attempts as usize;
    let times = geocoder.call_times();
    assert_eq!(times.len(), 2 * attempts + 3);
    let spaced = &times[2 * attempts - 1..];
    assert!(spaced[1] - spaced[0] >= config.breaker_cooldown);
    assert!(spaced[2] - spaced[1] >= config.breaker_cooldown * 2);
    assert!(spaced[3] - spaced[2] >= config.breaker_cooldown * 4);

    assert_eq!(outcome.report.failed, 5);
    assert_eq!(outcome.dataset.len(), 5);
    assert_eq!(outcome.dataset.geocoded_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_records_after_short_outage_are_still_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        breaker_threshold: 2,
        ..create_test_config(dir.path())
    };
    let down = |mock: MockGeocoder, address: &str| {
        (0..3).fold(mock, |mock, _| {
            mock.respond(address, Err(GeocodeError::Status(503)))
        })
    };
    let geocoder = Arc::new(
        down(
            down(MockGeocoder::new(), "1000, CABA, Buenos Aires, Argentina"),
            "5000, Córdoba, Córdoba, Argentina",
        )
        .otherwise(Ok(Some(Coordinate::new(-32.0, -64.0)))),
    );
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let input = dataset(&[
        ("A", "1000", "CABA", "Buenos Aires"),
        ("B", "5000", "Córdoba", "Córdoba"),
        ("C", "5500", "Mendoza", "Mendoza"),
        ("D", "2000", "Rosario", "Santa Fe"),
        ("E", "4000", "Tucumán", "Tucumán"),
    ]);
    let outcome = enricher
        .enrich(input, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.report.failed, 2);
    assert_eq!(outcome.report.resolved, 3);
    assert_eq!(
        coordinates(&outcome.dataset)[2..],
        [Some(Coordinate::new(-32.0, -64.0)); 3]
    );

    // The first lookup after the outage waited out the cooldown, then the breaker closed
    let times = geocoder.call_times();
    assert_eq!(times.len(), 6 + 3);
    assert!(times[6] - times[5] >= config.breaker_cooldown);
    assert!(times[8] - times[7] < config.breaker_cooldown);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_breaker_is_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        breaker_threshold: 1,
        max_attempts: 1,
        ..create_test_config(dir.path())
    };
    let cancel = CancellationToken::new();
    let geocoder = Arc::new(
        MockGeocoder::new().otherwise(Err(GeocodeError::Transport("connection refused".into()))),
    );
    let enricher = AddressEnricher::new(geocoder.clone(), &config);

    let watchdog = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        watchdog.cancel();
    });

    let started = Instant::now();
    let outcome = enricher
        .enrich(
            dataset(&[
                ("A", "1000", "CABA", "Buenos Aires"),
                ("B", "5000", "Córdoba", "Córdoba"),
            ]),
            &cancel,
        )
        .await
        .unwrap();

    // B was waiting for the 10s cooldown when the run was cancelled
    assert_eq!(geocoder.calls().len(), 1);
    assert!(outcome.report.cancelled);
    assert!(started.elapsed() < config.breaker_cooldown);
}
