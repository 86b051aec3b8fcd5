//! # Raw Measurement Loading
//!
//! This module is the only entry point for user-provided measurement tables. It
//! reads the long-format table (one row per patient, timestamp and variable),
//! validates it against a fixed schema and regroups the rows into per-patient
//! records ordered by time.
//!
//! - Strict Schema: column names are not configurable. `ID`, `TIME`, `VARIABLE`,
//!   `VALUE`, `AGE` and `BMI` are required; `DEST` and `DEPARTMENT` are optional
//!   and only needed by the labeling rule that reads them.
//! - User-Centric Errors: failures are assumed to be input errors, and `DataError`
//!   names the offending column or row.

use ahash::AHashMap;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const ID_COLUMN: &str = "ID";
pub const TIME_COLUMN: &str = "TIME";
pub const VARIABLE_COLUMN: &str = "VARIABLE";
pub const VALUE_COLUMN: &str = "VALUE";
pub const AGE_COLUMN: &str = "AGE";
pub const BMI_COLUMN: &str = "BMI";
pub const DESTINATION_COLUMN: &str = "DEST";
pub const DEPARTMENT_COLUMN: &str = "DEPARTMENT";

const REQUIRED_COLUMNS: [&str; 6] = [
    ID_COLUMN,
    TIME_COLUMN,
    VARIABLE_COLUMN,
    VALUE_COLUMN,
    AGE_COLUMN,
    BMI_COLUMN,
];

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// A single measurement of one variable for one patient.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub time: NaiveDateTime,
    pub variable: String,
    pub value: f64,
    /// Ward the measurement was taken on, when the table carries `DEPARTMENT`.
    pub department: Option<String>,
}

/// Everything known about one patient stay.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub id: String,
    pub age: Option<f64>,
    pub bmi: Option<f64>,
    /// Discharge destination, taken from the first row that carries one.
    pub destination: Option<String>,
    /// Sorted by time, ties keep input order.
    pub measurements: Vec<Measurement>,
}

impl PatientRecord {
    pub fn first_time(&self) -> Option<NaiveDateTime> {
        self.measurements.first().map(|m| m.time)
    }

    pub fn last_time(&self) -> Option<NaiveDateTime> {
        self.measurements.last().map(|m| m.time)
    }

    /// Hours between the first and the last measurement.
    pub fn span_hours(&self) -> f64 {
        match (self.first_time(), self.last_time()) {
            (Some(first), Some(last)) => hours_between(first, last),
            _ => 0.0,
        }
    }
}

/// The full set of patient stays, ordered by natural ID order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cohort {
    pub patients: Vec<PatientRecord>,
}

impl Cohort {
    pub fn new(mut patients: Vec<PatientRecord>) -> Self {
        patients.sort_by(|a, b| natord::compare(&a.id, &b.id));
        Self { patients }
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.patients.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn num_measurements(&self) -> usize {
        self.patients.iter().map(|p| p.measurements.len()).sum()
    }

    /// Keeps the patients whose IDs are in `ids`, preserving cohort order.
    pub fn subset(&self, ids: &HashSet<String>) -> Cohort {
        Cohort {
            patients: self
                .patients
                .iter()
                .filter(|p| ids.contains(&p.id))
                .cloned()
                .collect(),
        }
    }

    pub fn has_departments(&self) -> bool {
        self.patients
            .iter()
            .flat_map(|p| p.measurements.iter())
            .any(|m| m.department.is_some())
    }
}

/// Elapsed time in fractional hours.
pub fn hours_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

/// Converts fractional hours into a `Duration` with millisecond resolution.
/// Returns `None` for spans a `Duration` cannot hold.
pub fn hours(value: f64) -> Option<Duration> {
    let millis = (value * 3_600_000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(millis as i64)
}

/// A comprehensive error type for all loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Could not parse timestamp '{value}' at row {row}. Expected e.g. '2021-03-04 13:45:00'.")]
    InvalidTimestamp { value: String, row: usize },
    #[error("The input file contains no usable measurement rows.")]
    Empty,
}

/// Loads a tab-separated measurement table.
pub fn load_measurements(path: &str) -> Result<Cohort, DataError> {
    load_measurements_with_separator(path, b'\t')
}

/// Loads a measurement table using the given field separator.
pub fn load_measurements_with_separator(path: &str, separator: u8) -> Result<Cohort, DataError> {
    log::info!("Loading measurements from '{path}'");
    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(10_000))
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;
    cohort_from_frame(&df)
}

/// Validates an in-memory frame and regroups its rows per patient.
pub fn cohort_from_frame(df: &DataFrame) -> Result<Cohort, DataError> {
    let columns: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for name in REQUIRED_COLUMNS {
        if !columns.contains(name) {
            return Err(DataError::ColumnNotFound(name.to_string()));
        }
    }
    if df.height() == 0 {
        return Err(DataError::Empty);
    }

    let ids = internal::required_strings(df, ID_COLUMN)?;
    let variables = internal::required_strings(df, VARIABLE_COLUMN)?;
    let times = internal::timestamps(df, TIME_COLUMN)?;
    let values = internal::numeric(df, VALUE_COLUMN)?;
    let ages = internal::numeric(df, AGE_COLUMN)?;
    let bmis = internal::numeric(df, BMI_COLUMN)?;
    let destinations = if columns.contains(DESTINATION_COLUMN) {
        internal::optional_strings(df, DESTINATION_COLUMN)?
    } else {
        vec![None; df.height()]
    };
    let departments = if columns.contains(DEPARTMENT_COLUMN) {
        internal::optional_strings(df, DEPARTMENT_COLUMN)?
    } else {
        vec![None; df.height()]
    };

    let mut by_patient: AHashMap<String, PatientRecord> = AHashMap::new();
    let mut dropped = 0usize;
    for row in 0..df.height() {
        let record = by_patient
            .entry(ids[row].clone())
            .or_insert_with(|| PatientRecord {
                id: ids[row].clone(),
                age: ages[row].filter(|v| v.is_finite()),
                bmi: bmis[row].filter(|v| v.is_finite()),
                destination: None,
                measurements: Vec::new(),
            });
        if record.destination.is_none() {
            record.destination = destinations[row].clone();
        }

        match values[row] {
            Some(value) if value.is_finite() => record.measurements.push(Measurement {
                time: times[row],
                variable: variables[row].clone(),
                value,
                department: departments[row].clone(),
            }),
            _ => dropped += 1,
        }
    }

    if dropped > 0 {
        log::warn!("Dropped {dropped} rows with a missing or non-finite '{VALUE_COLUMN}'.");
    }

    let mut patients: Vec<PatientRecord> = by_patient
        .into_values()
        .filter(|p| !p.measurements.is_empty())
        .collect();
    if patients.is_empty() {
        return Err(DataError::Empty);
    }
    for patient in &mut patients {
        patient.measurements.sort_by_key(|m| m.time);
    }

    let cohort = Cohort::new(patients);
    log::info!(
        "Loaded {} measurements for {} patients.",
        cohort.num_measurements(),
        cohort.len()
    );
    Ok(cohort)
}

/// Parses a timestamp in one of the accepted layouts. Bare dates map to midnight.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let trimmed = text.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    // Fractional seconds, e.g. exports that keep microseconds.
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(parsed);
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

mod internal {
    use super::*;

    fn wrong_type(column: &Column, name: &str, expected: &'static str) -> DataError {
        DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: expected,
            found_type: format!("{:?}", column.dtype()),
        }
    }

    pub(super) fn optional_strings(
        df: &DataFrame,
        name: &str,
    ) -> Result<Vec<Option<String>>, DataError> {
        let column = df.column(name)?;
        let casted = column
            .cast(&DataType::String)
            .map_err(|_| wrong_type(column, name, "text"))?;
        Ok(casted
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string).filter(|s| !s.is_empty()))
            .collect())
    }

    pub(super) fn required_strings(df: &DataFrame, name: &str) -> Result<Vec<String>, DataError> {
        optional_strings(df, name)?
            .into_iter()
            .map(|v| v.ok_or_else(|| DataError::MissingValuesFound(name.to_string())))
            .collect()
    }

    /// Numeric column with nulls preserved. Text that cannot be read as a number
    /// turns into nulls under casting, which is reported as a type error.
    pub(super) fn numeric(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let column = df.column(name)?;
        let casted = column
            .cast(&DataType::Float64)
            .map_err(|_| wrong_type(column, name, "f64 (numeric)"))?;
        if casted.null_count() > column.null_count() {
            return Err(wrong_type(column, name, "f64 (numeric)"));
        }
        Ok(casted.f64()?.into_iter().collect())
    }

    /// Text timestamps are parsed with `parse_timestamp`; numeric columns are
    /// read as hours since 1970-01-01.
    pub(super) fn timestamps(df: &DataFrame, name: &str) -> Result<Vec<NaiveDateTime>, DataError> {
        let column = df.column(name)?;
        let is_numeric = matches!(
            column.dtype(),
            DataType::Float64 | DataType::Float32 | DataType::Int64 | DataType::Int32
                | DataType::UInt64 | DataType::UInt32
        );
        if is_numeric {
            let origin = DateTime::UNIX_EPOCH.naive_utc();
            return numeric(df, name)?
                .into_iter()
                .enumerate()
                .map(|(row, v)| match v {
                    Some(h) if h.is_finite() => hours(h)
                        .and_then(|offset| origin.checked_add_signed(offset))
                        .ok_or_else(|| DataError::InvalidTimestamp {
                            value: h.to_string(),
                            row: row + 1,
                        }),
                    _ => Err(DataError::MissingValuesFound(name.to_string())),
                })
                .collect();
        }

        optional_strings(df, name)?
            .into_iter()
            .enumerate()
            .map(|(row, v)| {
                let text = v.ok_or_else(|| DataError::MissingValuesFound(name.to_string()))?;
                parse_timestamp(&text).ok_or(DataError::InvalidTimestamp {
                    value: text,
                    row: row + 1,
                })
            })
            .collect()
    }
}
