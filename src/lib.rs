//! Customer Address Enrichment Library
//!
//! Loads a customer/sales dataset, attaches coordinates to records by
//! geocoding their postal addresses (rate-limited, retried, cached), persists
//! the enriched table and serves a filterable read model for the dashboard.
//!
//! # Modules
//!
//! - `circuit_breaker`: Circuit breaker guarding the geocoder.
//! - `config`: Configuration management.
//! - `enrichment`: Address enrichment service.
//! - `errors`: Error handling types.
//! - `geocoding`: Geocoder trait and Nominatim client.
//! - `handlers`: HTTP request handlers.
//! - `models`: Records, coordinates and datasets.
//! - `rate_limit`: Minimum-interval limiter for external calls.
//! - `report`: Filters, aggregates and map markers.
//! - `retry`: Retry/backoff policy.
//! - `storage`: Dataset loading (xlsx/csv) and persistence (xlsx).

pub mod circuit_breaker;
pub mod config;
pub mod enrichment;
pub mod errors;
pub mod geocoding;
pub mod handlers;
pub mod models;
pub mod rate_limit;
pub mod report;
pub mod retry;
pub mod storage;
