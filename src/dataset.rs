//! In-memory recipient table loaded from CSV.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Column picked when the caller does not name an address column.
pub const DEFAULT_ADDRESS_COLUMN: &str = "Email Address";

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// True for null and for text that is empty after trimming.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::Integer(_) | Self::Float(_) => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::Null
        } else {
            Self::Text(s.to_string())
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        if s.is_empty() {
            Self::Null
        } else {
            Self::Text(s)
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

/// One row. Shares its column list with the owning [`Dataset`].
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Record {
    /// Value of the named field, if the field is part of the schema.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == field)
            .map(|idx| &self.values[idx])
    }

    /// Fields in schema order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// A row whose address field is non-empty.
///
/// Text addresses borrow from the row. Numeric cells are rendered to text and
/// left for the relay session to reject.
#[derive(Debug, Clone)]
pub struct Recipient<'a> {
    pub address: Cow<'a, str>,
    pub record: &'a Record,
}

/// Counts shown to the operator before sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub rows: usize,
    pub eligible: usize,
    pub missing_address: usize,
    pub skipped_rows: usize,
    pub samples: Vec<String>,
}

/// Ordered records with a uniform schema and a designated address column.
#[derive(Debug, Clone)]
pub struct Dataset {
    columns: Arc<[String]>,
    records: Vec<Record>,
    address_field: String,
    skipped_rows: usize,
}

impl Dataset {
    /// Build a dataset from already-parsed rows.
    ///
    /// Every row must have exactly one value per column, column names must be
    /// unique, and `address_field` must be one of them.
    pub fn new(
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        address_field: impl Into<String>,
    ) -> Result<Self> {
        let address_field = address_field.into();
        check_columns(&columns)?;
        if !columns.contains(&address_field) {
            return Err(Error::Config(format!(
                "address column '{address_field}' not found in dataset"
            )));
        }

        let columns: Arc<[String]> = columns.into();
        let mut records = Vec::with_capacity(rows.len());
        for (idx, values) in rows.into_iter().enumerate() {
            if values.len() != columns.len() {
                return Err(Error::Dataset(format!(
                    "row {} has {} values, expected {}",
                    idx + 1,
                    values.len(),
                    columns.len()
                )));
            }
            records.push(Record {
                columns: Arc::clone(&columns),
                values,
            });
        }

        Ok(Self {
            columns,
            records,
            address_field,
            skipped_rows: 0,
        })
    }

    /// Load a CSV file. See [`Dataset::from_csv_reader`].
    pub fn load_csv(path: impl AsRef<Path>, address_field: Option<&str>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_csv_reader(io::BufReader::new(file), address_field)
    }

    /// Parse CSV with a header row.
    ///
    /// Header names are trimmed. Rows with the wrong number of fields or
    /// invalid UTF-8 are skipped and counted. Empty cells become [`Value::Null`].
    pub fn from_csv_reader<R: io::Read>(reader: R, address_field: Option<&str>) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(reader);

        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let address_field = resolve_address_column(&columns, address_field)?;

        let mut rows = Vec::new();
        let mut skipped = 0;
        for (idx, result) in reader.records().enumerate() {
            let line = idx + 2;
            let record = match result {
                Ok(record) => record,
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(e) => {
                    warn!("Skipping malformed row at line {line}: {e}");
                    skipped += 1;
                    continue;
                }
            };
            if record.len() != columns.len() {
                warn!(
                    "Skipping row at line {line}: {} fields, expected {}",
                    record.len(),
                    columns.len()
                );
                skipped += 1;
                continue;
            }
            rows.push(record.iter().map(Value::from).collect());
        }

        let mut dataset = Self::new(columns, rows, address_field)?;
        dataset.skipped_rows = skipped;
        debug!(
            "Loaded {} rows ({} skipped), address column '{}'",
            dataset.records.len(),
            skipped,
            dataset.address_field
        );
        Ok(dataset)
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[must_use]
    pub fn address_field(&self) -> &str {
        &self.address_field
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows dropped by the CSV loader.
    #[must_use]
    pub const fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }

    /// Rows with a non-blank address, in original order. Addresses are trimmed.
    pub fn recipients(&self) -> impl Iterator<Item = Recipient<'_>> {
        let idx = self
            .columns
            .iter()
            .position(|c| *c == self.address_field);
        self.records.iter().filter_map(move |record| {
            let value = &record.values[idx?];
            if value.is_blank() {
                return None;
            }
            let address = match value {
                Value::Text(s) => Cow::Borrowed(s.trim()),
                other => Cow::Owned(other.to_string()),
            };
            Some(Recipient { address, record })
        })
    }

    #[must_use]
    pub fn stats(&self) -> DatasetStats {
        let eligible: Vec<Recipient<'_>> = self.recipients().collect();
        DatasetStats {
            rows: self.records.len(),
            eligible: eligible.len(),
            missing_address: self.records.len() - eligible.len(),
            skipped_rows: self.skipped_rows,
            samples: eligible
                .iter()
                .take(5)
                .map(|r| r.address.to_string())
                .collect(),
        }
    }
}

/// Pick the address column: the requested one, else [`DEFAULT_ADDRESS_COLUMN`]
/// when present, else the first column.
pub fn resolve_address_column(columns: &[String], requested: Option<&str>) -> Result<String> {
    if let Some(name) = requested {
        let name = name.trim();
        return if columns.iter().any(|c| c == name) {
            Ok(name.to_string())
        } else {
            Err(Error::Config(format!(
                "address column '{name}' not found; available: {}",
                columns.join(", ")
            )))
        };
    }

    if columns.iter().any(|c| c == DEFAULT_ADDRESS_COLUMN) {
        return Ok(DEFAULT_ADDRESS_COLUMN.to_string());
    }

    columns
        .first()
        .cloned()
        .ok_or_else(|| Error::Dataset("dataset has no columns".to_string()))
}

fn check_columns(columns: &[String]) -> Result<()> {
    if columns.is_empty() {
        return Err(Error::Dataset("dataset has no columns".to_string()));
    }
    let mut seen = HashSet::new();
    for column in columns {
        if !seen.insert(column.as_str()) {
            return Err(Error::Dataset(format!("duplicate column '{column}'")));
        }
    }
    Ok(())
}
