//! Record enrichment applied after normalization
//!
//! Enrichment is an external, swappable step: the store only knows the
//! [`RecordEnricher`] trait. The stock implementations attach cluster labels
//! produced by an offline clustering run and fill county display names from
//! the reference set.

use crate::constants::{CLUSTER_COLUMNS, COUNTY_ID_COLUMNS};
use crate::county_registry::{CountyRegistry, canonical_county_id};
use crate::error::{NitrogenError, Result};
use crate::models::NormalizedRecord;
use crate::reader::read_csv_table;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A pure transformation of one normalized record
pub trait RecordEnricher: Send + Sync {
    fn enrich(&self, record: NormalizedRecord) -> NormalizedRecord;

    /// Name used in load logs
    fn name(&self) -> &str {
        "enricher"
    }
}

impl<F> RecordEnricher for F
where
    F: Fn(NormalizedRecord) -> NormalizedRecord + Send + Sync,
{
    fn enrich(&self, record: NormalizedRecord) -> NormalizedRecord {
        self(record)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// Run every enricher over every record, in order
pub fn enrich_all(
    records: Vec<NormalizedRecord>,
    enrichers: &[Arc<dyn RecordEnricher>],
) -> Vec<NormalizedRecord> {
    if enrichers.is_empty() {
        return records;
    }

    for enricher in enrichers {
        debug!("Applying {} to {} records", enricher.name(), records.len());
    }

    records
        .into_iter()
        .map(|record| {
            enrichers
                .iter()
                .fold(record, |record, enricher| enricher.enrich(record))
        })
        .collect()
}

/// County to cluster label mapping from an offline clustering run
#[derive(Debug, Clone, Default)]
pub struct ClusterLabelTable {
    labels: HashMap<String, String>,
    /// Replace labels already carried by the source data
    overwrite: bool,
}

impl ClusterLabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, county_id: &str, label: impl Into<String>) -> Self {
        self.labels.insert(canonical_county_id(county_id), label.into());
        self
    }

    pub fn overwriting(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Load labels from a CSV with a county identifier and a cluster column
    pub fn load_from_csv(path: &Path) -> Result<Self> {
        let table = read_csv_table(path, "cluster_labels")?;
        let accepted = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();

        let (Some(id_index), Some(label_index)) = (
            table.column_index(&accepted(COUNTY_ID_COLUMNS)),
            table.column_index(&accepted(CLUSTER_COLUMNS)),
        ) else {
            return Err(NitrogenError::Configuration {
                message: format!(
                    "{} needs a county column ({:?}) and a cluster column ({:?})",
                    path.display(),
                    COUNTY_ID_COLUMNS,
                    CLUSTER_COLUMNS
                ),
            });
        };

        let mut labels = Self::new();
        for record in &table.records {
            if let (Some(id), Some(label)) = (record.value(id_index), record.value(label_index)) {
                labels = labels.with_label(id, label);
            }
        }

        info!("Loaded {} cluster labels from {}", labels.len(), path.display());
        Ok(labels)
    }

    pub fn label_of(&self, county_id: &str) -> Option<&str> {
        self.labels.get(county_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl RecordEnricher for ClusterLabelTable {
    fn enrich(&self, mut record: NormalizedRecord) -> NormalizedRecord {
        if record.cluster_label.is_none() || self.overwrite {
            if let Some(label) = self.label_of(&record.county_id) {
                record.cluster_label = Some(label.to_string());
            }
        }
        record
    }

    fn name(&self) -> &str {
        "cluster labels"
    }
}

/// Fills missing county names from the reference set
pub struct CountyNameEnricher {
    counties: Arc<CountyRegistry>,
}

impl CountyNameEnricher {
    pub fn new(counties: Arc<CountyRegistry>) -> Self {
        Self { counties }
    }
}

impl RecordEnricher for CountyNameEnricher {
    fn enrich(&self, mut record: NormalizedRecord) -> NormalizedRecord {
        if record.county_name.is_none() {
            record.county_name = self.counties.name_of(&record.county_id).map(str::to_string);
        }
        record
    }

    fn name(&self) -> &str {
        "county names"
    }
}
