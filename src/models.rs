use crate::errors::AppError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const COLUMN_CLIENT: &str = "Cliente";
pub const COLUMN_POSTAL_CODE: &str = "Cód. Postal de entrega";
pub const COLUMN_LOCALITY: &str = "Localidad";
pub const COLUMN_PROVINCE: &str = "Provincia";
pub const COLUMN_SALES: &str = "Ventas Netas (USD)";
pub const COLUMN_GROUP: &str = "Grupo económico";
pub const COLUMN_LATITUDE: &str = "Latitud";
pub const COLUMN_LONGITUDE: &str = "Longitud";

/// A resolved latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Builds a coordinate only when both halves are present.
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(lat), Some(lon)) => Some(Self::new(lat, lon)),
            _ => None,
        }
    }
}

/// A single spreadsheet cell as loaded from the input file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    /// Interprets raw text from a CSV field.
    ///
    /// Numeric-looking fields become numbers, except codes with a leading
    /// zero ("0123") which would lose information.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return CellValue::Empty;
        }
        let leading_zero =
            trimmed.len() > 1 && trimmed.starts_with('0') && !trimmed.starts_with("0.");
        if !leading_zero {
            if let Ok(n) = trimmed.parse::<f64>() {
                if n.is_finite() {
                    return CellValue::Number(n);
                }
            }
        }
        CellValue::Text(trimmed.to_string())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(n) => !n.is_finite(),
            CellValue::Bool(_) => false,
        }
    }

    /// Text rendering used for identifiers and address parts.
    ///
    /// Whole numbers render without a fractional part, so a postal code read
    /// back from a spreadsheet as `1000.0` becomes `"1000"`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            CellValue::Number(n) if !n.is_finite() => None,
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(format!("{}", *n as i64))
            }
            CellValue::Number(n) => Some(n.to_string()),
            CellValue::Bool(b) => Some(b.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) if n.is_finite() => Some(*n),
            CellValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }
}

fn whitespace() -> &'static Regex {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex is valid"))
}

fn normalize_part(part: &str) -> String {
    whitespace().replace_all(part.trim(), " ").into_owned()
}

/// Composes the free-text geocoding query for a record.
///
/// Returns `None` when postal code, locality or province is missing or blank;
/// such records are never sent to the geocoder.
pub fn compose_address(
    postal_code: Option<&str>,
    locality: Option<&str>,
    province: Option<&str>,
    country: &str,
) -> Option<String> {
    let parts = [postal_code?, locality?, province?].map(normalize_part);
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(format!(
        "{}, {}, {}, {}",
        parts[0],
        parts[1],
        parts[2],
        normalize_part(country)
    ))
}

/// One customer/sale row.
///
/// The typed fields are derived once at load time; `cells` keeps every
/// original column (except the coordinate columns) verbatim for persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub client: String,
    pub postal_code: Option<String>,
    pub locality: Option<String>,
    pub province: Option<String>,
    pub sales: Option<f64>,
    pub group: Option<String>,
    pub coordinate: Option<Coordinate>,
    #[serde(skip)]
    pub cells: Vec<CellValue>,
}

impl Record {
    pub fn compose_address(&self, country: &str) -> Option<String> {
        compose_address(
            self.postal_code.as_deref(),
            self.locality.as_deref(),
            self.province.as_deref(),
            country,
        )
    }
}

/// Resolved positions of the named columns inside the header.
#[derive(Debug, Clone)]
struct ColumnIndex {
    client: usize,
    postal_code: usize,
    locality: usize,
    province: usize,
    sales: usize,
    group: Option<usize>,
    latitude: Option<usize>,
    longitude: Option<usize>,
}

impl ColumnIndex {
    fn resolve(header: &[String]) -> Result<Self, AppError> {
        let find = |name: &str| header.iter().position(|h| h.trim() == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                AppError::InputFormat(format!("Required column '{}' not found", name))
            })
        };

        Ok(Self {
            client: require(COLUMN_CLIENT)?,
            postal_code: require(COLUMN_POSTAL_CODE)?,
            locality: require(COLUMN_LOCALITY)?,
            province: require(COLUMN_PROVINCE)?,
            sales: require(COLUMN_SALES)?,
            group: find(COLUMN_GROUP),
            latitude: find(COLUMN_LATITUDE),
            longitude: find(COLUMN_LONGITUDE),
        })
    }

    fn is_coordinate(&self, idx: usize) -> bool {
        Some(idx) == self.latitude || Some(idx) == self.longitude
    }
}

/// An ordered table of records sharing one header.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    records: Vec<Record>,
    has_coordinate_columns: bool,
}

impl Dataset {
    /// Builds a dataset from a header and raw rows.
    ///
    /// Fails with `InputFormat` when a required column is missing. Rows whose
    /// cells are all empty are not records: they are dropped, never counted by
    /// `is_fully_geocoded` and never written back. `Latitud`/`Longitud` are
    /// lifted out of the cells into each record's coordinate.
    pub fn from_rows(header: Vec<String>, rows: Vec<Vec<CellValue>>) -> Result<Self, AppError> {
        let index = ColumnIndex::resolve(&header)?;
        let has_coordinate_columns = index.latitude.is_some() && index.longitude.is_some();

        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .filter(|(idx, _)| !index.is_coordinate(*idx))
            .map(|(_, name)| name.trim().to_string())
            .collect();

        let records = rows
            .into_iter()
            .filter(|row| row.iter().any(|cell| !cell.is_empty()))
            .map(|row| {
                let cell = |idx: usize| row.get(idx).cloned().unwrap_or(CellValue::Empty);
                let text = |idx: usize| cell(idx).as_text();
                let number = |idx: Option<usize>| idx.and_then(|i| cell(i).as_f64());

                let cells = (0..header.len())
                    .filter(|idx| !index.is_coordinate(*idx))
                    .map(cell)
                    .collect();

                Record {
                    client: text(index.client).unwrap_or_default(),
                    postal_code: text(index.postal_code),
                    locality: text(index.locality),
                    province: text(index.province),
                    sales: number(Some(index.sales)),
                    group: index.group.and_then(text),
                    coordinate: Coordinate::from_parts(
                        number(index.latitude),
                        number(index.longitude),
                    ),
                    cells,
                }
            })
            .collect();

        Ok(Self {
            columns,
            records,
            has_coordinate_columns,
        })
    }

    /// Original column names, excluding the coordinate columns.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_coordinate_columns(&self) -> bool {
        self.has_coordinate_columns
    }

    /// True when both coordinate columns exist and every row is populated;
    /// such a dataset is never geocoded again.
    pub fn is_fully_geocoded(&self) -> bool {
        self.has_coordinate_columns && self.records.iter().all(|r| r.coordinate.is_some())
    }

    pub fn geocoded_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.coordinate.is_some())
            .count()
    }

    pub(crate) fn mark_coordinate_columns(&mut self) {
        self.has_coordinate_columns = true;
    }
}
