//! Year-partitioned scenario store
//!
//! Each scenario year owns one partition slot. A load normalizes, enriches
//! and pre-aggregates a dataset off to the side and then swaps the finished
//! partition in with a single pointer replacement, so readers see either the
//! previous partition or the new one, never a mix. Loads of one year are
//! serialized by a per-year mutex; loads of different years run
//! independently. Committed partitions are immutable and shared through
//! `Arc`, so readers never wait on a running load.

use crate::aggregator::{AggregateView, Dimension, aggregate};
use crate::config::PipelineConfig;
use crate::county_registry::{CountyRegistry, canonical_county_id};
use crate::enrichment::{RecordEnricher, enrich_all};
use crate::error::{InvalidFilterError, SchemaError};
use crate::models::{NormalizedRecord, ProductionTotal, RawDataset, RecordKind, ScenarioYear, Stage};
use crate::normalizer::{Normalizer, RowRejection};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of one year partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Empty,
    Loading,
    Ready,
}

/// Record filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub stage: Option<Stage>,
    pub commodity: Option<String>,
    pub county: Option<String>,
    pub cluster: Option<String>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_commodity(mut self, commodity: impl Into<String>) -> Self {
        self.commodity = Some(commodity.into());
        self
    }

    /// Restrict to one county; the identifier is canonicalized
    pub fn with_county(mut self, county: &str) -> Self {
        self.county = Some(canonical_county_id(county));
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, record: &NormalizedRecord) -> bool {
        self.kind.is_none_or(|kind| record.kind() == kind)
            && self.stage.is_none_or(|stage| record.stage == stage)
            && self
                .commodity
                .as_deref()
                .is_none_or(|commodity| record.commodity.as_deref() == Some(commodity))
            && self
                .county
                .as_deref()
                .is_none_or(|county| record.county_id == county)
            && self
                .cluster
                .as_deref()
                .is_none_or(|cluster| record.cluster_label.as_deref() == Some(cluster))
    }
}

/// Committed, immutable data of one scenario year
#[derive(Debug)]
pub struct Partition {
    pub year: ScenarioYear,
    pub records: Vec<NormalizedRecord>,
    /// Per-commodity production figures, empty when the year ships none
    pub production: Vec<ProductionTotal>,
    pub rejected_rows: Vec<RowRejection>,
    pub loaded_at: DateTime<Utc>,
    /// Views by grouping; views only get added, never replaced
    aggregates: RwLock<HashMap<Vec<Dimension>, Arc<AggregateView>>>,
}

impl Partition {
    fn new(
        year: ScenarioYear,
        records: Vec<NormalizedRecord>,
        production: Vec<ProductionTotal>,
        rejected_rows: Vec<RowRejection>,
    ) -> Self {
        Self {
            year,
            records,
            production,
            rejected_rows,
            loaded_at: Utc::now(),
            aggregates: RwLock::new(HashMap::new()),
        }
    }

    pub fn filtered<'a>(&'a self, filter: &'a RecordFilter) -> impl Iterator<Item = &'a NormalizedRecord> + 'a {
        self.records.iter().filter(move |record| filter.matches(record))
    }

    /// Cached aggregate view, computed on first request
    pub fn aggregate(&self, group_by: &[Dimension]) -> Arc<AggregateView> {
        if let Some(view) = read_lock(&self.aggregates).get(group_by) {
            return Arc::clone(view);
        }

        let view = Arc::new(aggregate(self.year, &self.records, group_by));
        let mut cache = write_lock(&self.aggregates);
        // A concurrent reader may have computed the same view; keep the first
        Arc::clone(cache.entry(group_by.to_vec()).or_insert(view))
    }

    pub fn cached_groupings(&self) -> Vec<Vec<Dimension>> {
        let mut groupings: Vec<_> = read_lock(&self.aggregates).keys().cloned().collect();
        groupings.sort();
        groupings
    }
}

/// Summary of a committed load
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub year: ScenarioYear,
    pub rows_read: usize,
    pub records: usize,
    pub production_totals: usize,
    /// Distinct source rows with at least one rejection
    pub rows_rejected: usize,
    /// Every rejection; a wide row can be rejected once per bad cell
    pub rejected_rows: Vec<RowRejection>,
    pub rejection_rate: f64,
    /// Whether a previously committed partition was replaced
    pub replaced: bool,
    pub loaded_at: DateTime<Utc>,
    pub duration_ms: u128,
}

/// Row accounting of a normalized dataset
struct LoadCounts {
    rows_read: usize,
    rows_rejected: usize,
    rejection_rate: f64,
}

struct YearSlot {
    load_lock: Mutex<()>,
    loading: AtomicBool,
    current: RwLock<Option<Arc<Partition>>>,
}

impl YearSlot {
    fn new() -> Self {
        Self {
            load_lock: Mutex::new(()),
            loading: AtomicBool::new(false),
            current: RwLock::new(None),
        }
    }
}

/// Clears the loading flag on every exit path of a load, panics included
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of every year partition
pub struct ScenarioStore {
    config: Arc<PipelineConfig>,
    counties: Arc<CountyRegistry>,
    enrichers: Vec<Arc<dyn RecordEnricher>>,
    slots: HashMap<ScenarioYear, YearSlot>,
}

impl ScenarioStore {
    pub fn new(config: Arc<PipelineConfig>, counties: Arc<CountyRegistry>) -> Self {
        let slots = config
            .supported_years
            .iter()
            .map(|year| (*year, YearSlot::new()))
            .collect();

        Self {
            config,
            counties,
            enrichers: Vec::new(),
            slots,
        }
    }

    /// Add an enrichment step, applied to every record of later loads
    pub fn with_enricher(mut self, enricher: Arc<dyn RecordEnricher>) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn counties(&self) -> &CountyRegistry {
        &self.counties
    }

    /// Normalize a dataset and atomically replace the year's partition
    ///
    /// On any error the previously committed partition, if any, stays in
    /// place and remains queryable.
    pub fn load(&self, year: ScenarioYear, dataset: RawDataset) -> Result<LoadReport, SchemaError> {
        let slot = self.slots.get(&year).ok_or(SchemaError::UnsupportedYear {
            year: year.as_u16(),
        })?;

        let _serialized = lock(&slot.load_lock);
        let _loading = LoadingFlag::raise(&slot.loading);
        let started = Instant::now();

        let result = self.build_partition(year, &dataset);
        let (partition, counts) = match result {
            Ok(built) => built,
            Err(e) => {
                warn!("Load of {} failed, keeping previous partition: {}", year, e);
                return Err(e);
            }
        };

        let report = LoadReport {
            year,
            rows_read: counts.rows_read,
            records: partition.records.len(),
            production_totals: partition.production.len(),
            rows_rejected: counts.rows_rejected,
            rejected_rows: partition.rejected_rows.clone(),
            rejection_rate: counts.rejection_rate,
            replaced: false,
            loaded_at: partition.loaded_at,
            duration_ms: started.elapsed().as_millis(),
        };

        let previous = write_lock(&slot.current).replace(Arc::new(partition));
        let report = LoadReport {
            replaced: previous.is_some(),
            ..report
        };

        info!(
            "Committed {} partition: {} records from {} rows ({} rows rejected) in {}ms",
            year,
            report.records,
            report.rows_read,
            report.rows_rejected,
            report.duration_ms
        );
        Ok(report)
    }

    fn build_partition(
        &self,
        year: ScenarioYear,
        dataset: &RawDataset,
    ) -> Result<(Partition, LoadCounts), SchemaError> {
        if dataset.year != year {
            return Err(SchemaError::YearMismatch {
                expected: year.as_u16(),
                found: dataset.year.as_u16(),
            });
        }

        let outcome = Normalizer::new(&self.config, &self.counties).normalize(dataset)?;
        outcome.check_acceptance(self.config.max_rejection_rate)?;

        let counts = LoadCounts {
            rows_read: outcome.rows_read,
            rows_rejected: outcome.rejected_row_count(),
            rejection_rate: outcome.rejection_rate(),
        };
        let records = enrich_all(outcome.valid_records, &self.enrichers);
        let partition = Partition::new(year, records, outcome.production, outcome.rejected_rows);

        for grouping in &self.config.precomputed_groupings {
            partition.aggregate(grouping);
        }
        debug!(
            "Precomputed {} aggregate views for {}",
            self.config.precomputed_groupings.len(),
            year
        );

        Ok((partition, counts))
    }

    pub fn state(&self, year: ScenarioYear) -> PartitionState {
        let Some(slot) = self.slots.get(&year) else {
            return PartitionState::Empty;
        };

        if slot.loading.load(Ordering::Acquire) {
            PartitionState::Loading
        } else if read_lock(&slot.current).is_some() {
            PartitionState::Ready
        } else {
            PartitionState::Empty
        }
    }

    /// Committed partition of a year, `None` until a load succeeds
    pub fn snapshot(&self, year: ScenarioYear) -> Result<Option<Arc<Partition>>, InvalidFilterError> {
        let slot = self.slots.get(&year).ok_or(InvalidFilterError::UnsupportedYear {
            year: year.as_u16(),
        })?;
        Ok(read_lock(&slot.current).clone())
    }

    /// Years with a committed partition, ascending
    pub fn loaded_years(&self) -> Vec<ScenarioYear> {
        let mut years: Vec<ScenarioYear> = self
            .slots
            .iter()
            .filter(|(_, slot)| read_lock(&slot.current).is_some())
            .map(|(year, _)| *year)
            .collect();
        years.sort();
        years
    }

    /// Records of a year matching the filter, empty before the first load
    pub fn get(
        &self,
        year: ScenarioYear,
        filter: &RecordFilter,
    ) -> Result<Vec<NormalizedRecord>, InvalidFilterError> {
        Ok(self
            .snapshot(year)?
            .map(|partition| partition.filtered(filter).cloned().collect())
            .unwrap_or_default())
    }

    /// Cached aggregate of every record of a year
    pub fn get_aggregate(
        &self,
        year: ScenarioYear,
        group_by: &[Dimension],
    ) -> Result<Arc<AggregateView>, InvalidFilterError> {
        check_grouping(group_by)?;
        Ok(match self.snapshot(year)? {
            Some(partition) => partition.aggregate(group_by),
            None => Arc::new(aggregate(year, std::iter::empty(), group_by)),
        })
    }

    /// Aggregate over filtered records, computed on every call
    pub fn get_filtered_aggregate(
        &self,
        year: ScenarioYear,
        filter: &RecordFilter,
        group_by: &[Dimension],
    ) -> Result<AggregateView, InvalidFilterError> {
        if filter.is_empty() {
            return self.get_aggregate(year, group_by).map(Arc::unwrap_or_clone);
        }

        check_grouping(group_by)?;
        Ok(match self.snapshot(year)? {
            Some(partition) => aggregate(year, partition.filtered(filter), group_by),
            None => aggregate(year, std::iter::empty(), group_by),
        })
    }
}

fn check_grouping(group_by: &[Dimension]) -> Result<(), InvalidFilterError> {
    for (position, dimension) in group_by.iter().enumerate() {
        if group_by[..position].contains(dimension) {
            return Err(InvalidFilterError::DuplicateDimension {
                dimension: dimension.as_str().to_string(),
            });
        }
    }
    Ok(())
}

// Data behind these locks is only ever swapped whole, so a poisoned lock
// still guards a consistent value.

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
