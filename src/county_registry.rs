//! County reference set providing O(1) identifier lookups
//!
//! Every normalized record must carry a county identifier that resolves
//! against this set. The registry is loaded once from a CSV file (or built
//! in memory) and shared read-only between year partitions.

use crate::constants::FIPS_WIDTH;
use crate::error::{NitrogenError, Result};
use crate::reader::read_csv_table;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const ID_COLUMNS: &[&str] = &["FIPS", "fips", "county_id", "geoid", "GEOID"];
const NAME_COLUMNS: &[&str] = &["county", "county_name", "name", "NAME"];
const STATE_COLUMNS: &[&str] = &["state", "state_name", "STATE"];

/// One county of the reference set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct County {
    pub id: String,
    pub name: String,
    pub state: Option<String>,
}

impl County {
    pub fn new(id: &str, name: impl Into<String>) -> Self {
        Self {
            id: canonical_county_id(id),
            name: name.into(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

/// Canonical form of a county identifier
///
/// Trims whitespace, drops a float artifact such as `"24003.0"`, and
/// left-pads purely numeric identifiers to the five-digit FIPS width.
pub fn canonical_county_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fraction = match trimmed.split_once('.') {
        Some((whole, fraction))
            if !whole.is_empty()
                && whole.chars().all(|c| c.is_ascii_digit())
                && fraction.chars().all(|c| c == '0') =>
        {
            whole
        }
        _ => trimmed,
    };

    if !without_fraction.is_empty()
        && without_fraction.len() < FIPS_WIDTH
        && without_fraction.chars().all(|c| c.is_ascii_digit())
    {
        format!("{:0>width$}", without_fraction, width = FIPS_WIDTH)
    } else {
        without_fraction.to_string()
    }
}

/// County registry indexed by canonical identifier
#[derive(Debug, Clone, Default)]
pub struct CountyRegistry {
    counties: HashMap<String, County>,
    source_path: Option<PathBuf>,
}

impl CountyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counties(counties: impl IntoIterator<Item = County>) -> Self {
        let mut registry = Self::new();
        for county in counties {
            registry.insert(county);
        }
        registry
    }

    /// Add a county, returning false when the identifier was already present
    pub fn insert(&mut self, county: County) -> bool {
        if self.counties.contains_key(&county.id) {
            return false;
        }
        self.counties.insert(county.id.clone(), county);
        true
    }

    /// Load the reference set from a CSV file with id and name columns
    pub fn load_from_csv(path: &Path) -> Result<Self> {
        let table = read_csv_table(path, "county_reference")?;
        let accepted = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();

        let id_index = table.column_index(&accepted(ID_COLUMNS)).ok_or_else(|| {
            NitrogenError::CountyReference {
                path: path.to_path_buf(),
                reason: format!("no identifier column (expected one of {:?})", ID_COLUMNS),
            }
        })?;
        let name_index = table.column_index(&accepted(NAME_COLUMNS)).ok_or_else(|| {
            NitrogenError::CountyReference {
                path: path.to_path_buf(),
                reason: format!("no name column (expected one of {:?})", NAME_COLUMNS),
            }
        })?;
        let state_index = table.column_index(&accepted(STATE_COLUMNS));

        let mut registry = Self::new();
        let mut duplicates = 0usize;
        for record in &table.records {
            let Some(id) = record.value(id_index) else {
                warn!("County reference row {} has no identifier, skipped", record.row);
                continue;
            };

            let mut county = County::new(id, record.value(name_index).unwrap_or(id));
            if let Some(state) = state_index.and_then(|index| record.value(index)) {
                county = county.with_state(state);
            }

            if !registry.insert(county) {
                duplicates += 1;
            }
        }

        if duplicates > 0 {
            warn!(
                "{} duplicate county identifiers in {} (first occurrence kept)",
                duplicates,
                path.display()
            );
        }

        registry.source_path = Some(path.to_path_buf());
        info!(
            "Loaded {} counties from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Get a county by identifier, canonicalizing the input first
    pub fn get(&self, id: &str) -> Option<&County> {
        self.counties.get(&canonical_county_id(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.get(id).map(|county| county.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.counties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counties.is_empty()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// All identifiers, sorted
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.counties.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Counties whose name contains the pattern, case-insensitive, sorted by id
    pub fn find_by_name(&self, pattern: &str) -> Vec<&County> {
        let pattern = pattern.to_lowercase();
        let mut found: Vec<&County> = self
            .counties
            .values()
            .filter(|county| county.name.to_lowercase().contains(&pattern))
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Counties whose FIPS state prefix matches, sorted by id
    pub fn in_state(&self, state_fips: &str) -> Vec<&County> {
        let mut found: Vec<&County> = self
            .counties
            .values()
            .filter(|county| county.id.starts_with(state_fips))
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }
}
