//! Error handling for nitrogen scenario processing.
//!
//! Mirrors the three failure classes of the pipeline: schema problems
//! raised while normalizing source datasets, unknown county identifiers
//! collected per row, and malformed query requests from the presentation
//! layer. `NitrogenError` wraps them together with I/O and Polars failures.

use std::path::PathBuf;
use thiserror::Error;

/// Missing or unresolvable field, column, or unit.
///
/// Carried per row inside a [`crate::normalizer::RowRejection`] when only one
/// row is affected, or returned from a load when the problem is structural.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("source '{source_name}' is missing required column '{field}' (accepted names: {accepted})")]
    MissingColumn {
        source_name: String,
        field: String,
        accepted: String,
    },

    #[error("row {row}: required field '{field}' is empty")]
    MissingField { row: usize, field: String },

    #[error("row {row}: no unit given for quantity '{value}'")]
    MissingUnit { row: usize, value: String },

    #[error("row {row}: unknown unit '{unit}'")]
    UnknownUnit { row: usize, unit: String },

    #[error("row {row}: cannot parse quantity '{value}'")]
    InvalidQuantity { row: usize, value: String },

    #[error("row {row}: negative nitrogen quantity {value}")]
    NegativeQuantity { row: usize, value: f64 },

    #[error("row {row}: unknown supply-chain stage '{tag}'")]
    UnknownStage { row: usize, tag: String },

    #[error("dataset for {found} submitted as {expected}")]
    YearMismatch { expected: u16, found: u16 },

    #[error("unsupported scenario year {year}")]
    UnsupportedYear { year: u16 },

    #[error("no source schema named '{source_name}'")]
    UnknownSource { source_name: String },

    #[error(
        "{rejected} of {total} rows rejected ({rate:.1}%), above the tolerated {limit:.1}%"
    )]
    PervasiveRejection {
        rejected: usize,
        total: usize,
        rate: f64,
        limit: f64,
    },
}

/// County identifier that does not resolve against the reference set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("row {row}: unknown county '{county_id}' in field '{field}'")]
pub struct UnknownCountyError {
    pub row: usize,
    pub field: String,
    pub county_id: String,
}

/// Structurally invalid request from the presentation layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidFilterError {
    #[error("unsupported scenario year {year}")]
    UnsupportedYear { year: u16 },

    #[error("unknown stage '{stage}'")]
    UnknownStage { stage: String },

    #[error("unknown grouping dimension '{dimension}'")]
    UnknownDimension { dimension: String },

    #[error("grouping dimension '{dimension}' requested more than once")]
    DuplicateDimension { dimension: String },

    #[error("unknown record kind '{kind}' (expected loss, flow or trade)")]
    UnknownKind { kind: String },

    #[error("unknown production measure '{measure}' (expected harvested_area or inventory)")]
    UnknownMeasure { measure: String },

    #[error("empty county identifier")]
    EmptyCounty,
}

#[derive(Error, Debug)]
pub enum NitrogenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Unknown county: {0}")]
    UnknownCounty(#[from] UnknownCountyError),

    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] InvalidFilterError),

    #[error("Dataset not found at path: {path}")]
    DatasetNotFound { path: PathBuf },

    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("County reference error in {path}: {reason}")]
    CountyReference { path: PathBuf, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Load task for {year} failed: {reason}")]
    LoadTask { year: u16, reason: String },
}

pub type Result<T> = std::result::Result<T, NitrogenError>;
