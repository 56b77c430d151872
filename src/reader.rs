//! Per-year dataset discovery and CSV ingestion.
//!
//! A data root holds one directory per scenario year (`2017/`, `2030/`,
//! `2050/`). Each source schema names a glob pattern resolved inside that
//! directory; matching files are read through Polars with every column kept
//! as text so identifiers such as FIPS codes keep their leading zeros.

use crate::config::PipelineConfig;
use crate::error::{NitrogenError, Result};
use crate::models::{RawDataset, RawTable, ScenarioYear};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Read a CSV file into a raw table, all columns as strings
pub fn read_csv_table(path: &Path, source: &str) -> Result<RawTable> {
    if !path.exists() {
        return Err(NitrogenError::DatasetNotFound {
            path: path.to_path_buf(),
        });
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    let columns: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut cells: Vec<Vec<Option<String>>> = Vec::with_capacity(columns.len());
    for column in df.get_columns() {
        let series = column.as_materialized_series().cast(&DataType::String)?;
        let values = series
            .str()?
            .into_iter()
            .map(|value| value.map(str::to_string))
            .collect();
        cells.push(values);
    }

    let mut table = RawTable::new(source, columns);
    table.path = Some(path.to_path_buf());
    for row in 0..df.height() {
        table.push_row(cells.iter_mut().map(|column| column[row].take()).collect());
    }

    debug!(
        "Read {} rows x {} columns from {}",
        table.len(),
        table.columns.len(),
        path.display()
    );

    Ok(table)
}

/// Files in `dir` matching a source pattern, sorted by path
pub fn find_source_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full_pattern = dir.join(pattern);
    let pattern_str = full_pattern.to_string_lossy();

    let paths = glob::glob(&pattern_str).map_err(|e| NitrogenError::InvalidPattern {
        pattern: pattern_str.to_string(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable path while matching {}: {}", pattern_str, e),
        }
    }
    files.sort();
    Ok(files)
}

/// Read every configured source for one year directory
pub fn read_year_dataset(
    dir: &Path,
    year: ScenarioYear,
    config: &PipelineConfig,
) -> Result<RawDataset> {
    if !dir.is_dir() {
        return Err(NitrogenError::DatasetNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut dataset = RawDataset::new(year);

    for source in &config.sources {
        let files = find_source_files(dir, &source.file_pattern)?;

        if files.is_empty() {
            if source.required {
                return Err(NitrogenError::DatasetNotFound {
                    path: dir.join(&source.file_pattern),
                });
            }
            debug!(
                "Optional source '{}' not present for {} in {}",
                source.name,
                year,
                dir.display()
            );
            continue;
        }

        for file in files {
            dataset.tables.push(read_csv_table(&file, &source.name)?);
        }
    }

    // Production tables are never required
    for source in &config.production_sources {
        for file in find_source_files(dir, &source.file_pattern)? {
            dataset.tables.push(read_csv_table(&file, &source.name)?);
        }
    }

    Ok(dataset)
}

/// Year directories under a data root, restricted to supported years
pub fn discover_year_dirs(
    root: &Path,
    config: &PipelineConfig,
) -> Result<Vec<(ScenarioYear, PathBuf)>> {
    if !root.is_dir() {
        return Err(NitrogenError::DatasetNotFound {
            path: root.to_path_buf(),
        });
    }

    let mut years = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| NitrogenError::Io(e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Ok(number) = name.parse::<u16>() else {
            continue;
        };

        match ScenarioYear::try_from(number) {
            Ok(year) if config.is_supported(year) => {
                years.push((year, entry.path().to_path_buf()));
            }
            _ => debug!("Ignoring unsupported year directory {}", entry.path().display()),
        }
    }

    years.sort_by_key(|(year, _)| *year);
    Ok(years)
}
