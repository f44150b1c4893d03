//! Read model served to the dashboard: filters, aggregates and map markers
//! computed over the enriched dataset.

use crate::errors::AppError;
use crate::models::{Coordinate, Dataset, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const TOP_CLIENTS: usize = 10;
pub const MAP_CENTER: Coordinate = Coordinate {
    latitude: -38.5,
    longitude: -63.6,
};
pub const MAP_ZOOM: u8 = 5;

/// Marker colour bucket derived from a client's sales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SalesTier {
    Green,
    Orange,
    Red,
}

impl SalesTier {
    pub fn from_sales(usd: f64) -> Self {
        if usd > 500_000.0 {
            SalesTier::Red
        } else if usd > 200_000.0 {
            SalesTier::Orange
        } else {
            SalesTier::Green
        }
    }
}

/// Dashboard filter selection. Empty lists mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientFilter {
    pub provinces: Vec<String>,
    pub groups: Vec<String>,
    pub min_sales: Option<f64>,
    pub max_sales: Option<f64>,
}

impl ClientFilter {
    pub fn validate(&self) -> Result<(), AppError> {
        if let (Some(min), Some(max)) = (self.min_sales, self.max_sales) {
            if min > max {
                return Err(AppError::BadRequest(format!(
                    "ventas_min ({}) is greater than ventas_max ({})",
                    min, max
                )));
            }
        }
        Ok(())
    }

    /// The sales range always applies: an absent bound stands for the
    /// dataset's own floor/ceiling, so records without a sales amount never match.
    pub fn matches(&self, record: &Record) -> bool {
        if !self.provinces.is_empty() && !contains(&self.provinces, record.province.as_deref()) {
            return false;
        }
        if !self.groups.is_empty() && !contains(&self.groups, record.group.as_deref()) {
            return false;
        }
        match record.sales {
            Some(sales) => {
                self.min_sales.map_or(true, |min| sales >= min)
                    && self.max_sales.map_or(true, |max| sales <= max)
            }
            None => false,
        }
    }

    pub fn apply<'a>(&self, dataset: &'a Dataset) -> Vec<&'a Record> {
        dataset
            .records()
            .iter()
            .filter(|record| self.matches(record))
            .collect()
    }
}

fn contains(selected: &[String], value: Option<&str>) -> bool {
    value.map_or(false, |v| selected.iter().any(|s| s == v))
}

/// Choices offered by the dashboard's filter widgets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterOptions {
    pub provinces: Vec<String>,
    pub groups: Vec<String>,
    pub sales_min: i64,
    pub sales_max: i64,
}

pub fn filter_options(dataset: &Dataset) -> FilterOptions {
    let provinces: BTreeSet<String> = dataset
        .records()
        .iter()
        .filter_map(|r| r.province.clone())
        .collect();
    let groups: BTreeSet<String> = dataset
        .records()
        .iter()
        .filter_map(|r| r.group.clone())
        .collect();

    let sales = dataset.records().iter().filter_map(|r| r.sales);
    let (min, max) = sales.fold((None, None), |(min, max): (Option<f64>, Option<f64>), s| {
        (
            Some(min.map_or(s, |m| m.min(s))),
            Some(max.map_or(s, |m| m.max(s))),
        )
    });

    FilterOptions {
        provinces: provinces.into_iter().collect(),
        groups: groups.into_iter().collect(),
        sales_min: min.map_or(0, |m| m.floor() as i64),
        sales_max: max.map_or(0, |m| m.ceil() as i64),
    }
}

/// One row of the detail table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRow {
    pub client: String,
    pub province: Option<String>,
    pub locality: Option<String>,
    pub sales: Option<f64>,
    pub group: Option<String>,
}

impl From<&Record> for ClientRow {
    fn from(record: &Record) -> Self {
        Self {
            client: record.client.clone(),
            province: record.province.clone(),
            locality: record.locality.clone(),
            sales: record.sales,
            group: record.group.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvinceSales {
    pub province: String,
    pub sales: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalesSummary {
    pub client_count: usize,
    pub total_sales: f64,
    /// Mean over clients with a sales amount; `None` when there are none.
    pub average_sales: Option<f64>,
    /// Ascending by sales, ready for a horizontal bar chart.
    pub sales_by_province: Vec<ProvinceSales>,
    /// Highest sales first.
    pub top_clients: Vec<ClientRow>,
}

pub fn summarize(records: &[&Record]) -> SalesSummary {
    let mut by_province: BTreeMap<&str, f64> = BTreeMap::new();
    for record in records {
        if let Some(province) = record.province.as_deref() {
            *by_province.entry(province).or_default() += record.sales.unwrap_or(0.0);
        }
    }

    let mut sales_by_province: Vec<ProvinceSales> = by_province
        .into_iter()
        .map(|(province, sales)| ProvinceSales {
            province: province.to_string(),
            sales,
        })
        .collect();
    sales_by_province.sort_by(|a, b| a.sales.total_cmp(&b.sales));

    let mut ranked: Vec<&Record> = records.iter().copied().filter(|r| r.sales.is_some()).collect();
    ranked.sort_by(|a, b| {
        b.sales
            .unwrap_or(0.0)
            .total_cmp(&a.sales.unwrap_or(0.0))
    });

    let total_sales: f64 = ranked.iter().filter_map(|r| r.sales).sum();
    let average_sales = (!ranked.is_empty()).then(|| total_sales / ranked.len() as f64);

    SalesSummary {
        client_count: records.len(),
        total_sales,
        average_sales,
        sales_by_province,
        top_clients: ranked
            .into_iter()
            .take(TOP_CLIENTS)
            .map(ClientRow::from)
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapMarker {
    pub client: String,
    pub latitude: f64,
    pub longitude: f64,
    pub sales: f64,
    pub tier: SalesTier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapView {
    pub center: Coordinate,
    pub zoom: u8,
    pub markers: Vec<MapMarker>,
}

/// Markers for every record with a coordinate; unresolved ones are left off the map.
pub fn map_view(records: &[&Record]) -> MapView {
    let markers = records
        .iter()
        .filter_map(|record| {
            let coordinate = record.coordinate?;
            let sales = record.sales.unwrap_or(0.0);
            Some(MapMarker {
                client: record.client.clone(),
                latitude: coordinate.latitude,
                longitude: coordinate.longitude,
                sales,
                tier: SalesTier::from_sales(sales),
            })
        })
        .collect();

    MapView {
        center: MAP_CENTER,
        zoom: MAP_ZOOM,
        markers,
    }
}
