//! Parallel loading of every scenario year found under a data root
//!
//! Each year directory is read and committed to the store on the blocking
//! thread pool; years run concurrently up to `max_concurrent_loads`. A year
//! that fails is reported and leaves its partition untouched, the others
//! still commit.

use crate::config::PipelineConfig;
use crate::constants::COUNTY_REFERENCE_FILE;
use crate::county_registry::CountyRegistry;
use crate::enrichment::{ClusterLabelTable, CountyNameEnricher};
use crate::error::{NitrogenError, Result};
use crate::models::ScenarioYear;
use crate::reader::{discover_year_dirs, read_year_dataset};
use crate::store::{LoadReport, ScenarioStore};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, info, warn};

/// Outcome of loading every year directory of a data root
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub reports: Vec<LoadReport>,
    pub failures: Vec<(ScenarioYear, NitrogenError)>,
    pub elapsed: Duration,
}

impl LoadSummary {
    pub fn loaded_years(&self) -> Vec<ScenarioYear> {
        self.reports.iter().map(|report| report.year).collect()
    }

    pub fn total_records(&self) -> usize {
        self.reports.iter().map(|report| report.records).sum()
    }

    /// Distinct rejected source rows over every loaded year
    pub fn total_rejected(&self) -> usize {
        self.reports.iter().map(|report| report.rows_rejected).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Builds a [`ScenarioStore`] from a data root laid out as `<root>/<year>/*.csv`
pub struct ScenarioLoader {
    root: PathBuf,
    config: Arc<PipelineConfig>,
    cluster_labels: Option<PathBuf>,
    show_progress: bool,
}

impl ScenarioLoader {
    pub fn new(root: impl Into<PathBuf>, config: Arc<PipelineConfig>) -> Self {
        Self {
            root: root.into(),
            config,
            cluster_labels: None,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Attach cluster labels from a CSV of county and cluster columns
    pub fn with_cluster_labels(mut self, path: PathBuf) -> Self {
        self.cluster_labels = Some(path);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// County reference file: configured path (relative to the root) or the default name
    pub fn county_reference_path(&self) -> PathBuf {
        match &self.config.county_reference {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.root.join(path),
            None => self.root.join(COUNTY_REFERENCE_FILE),
        }
    }

    /// Empty store with the county reference set and enrichers in place
    pub fn build_store(&self) -> Result<ScenarioStore> {
        let reference = self.county_reference_path();
        if !reference.is_file() {
            return Err(NitrogenError::CountyReference {
                path: reference,
                reason: "county reference file not found".to_string(),
            });
        }

        let counties = Arc::new(CountyRegistry::load_from_csv(&reference)?);
        let mut store = ScenarioStore::new(Arc::clone(&self.config), Arc::clone(&counties))
            .with_enricher(Arc::new(CountyNameEnricher::new(counties)));

        if let Some(path) = &self.cluster_labels {
            store = store.with_enricher(Arc::new(ClusterLabelTable::load_from_csv(path)?));
        }

        Ok(store)
    }

    /// Build the store and load every year directory into it
    pub async fn open(&self) -> Result<(Arc<ScenarioStore>, LoadSummary)> {
        let store = Arc::new(self.build_store()?);
        let summary = self.load_into(Arc::clone(&store)).await?;
        Ok((store, summary))
    }

    /// Load every supported year directory under the root into `store`
    pub async fn load_into(&self, store: Arc<ScenarioStore>) -> Result<LoadSummary> {
        let start_time = Instant::now();
        let year_dirs = discover_year_dirs(&self.root, &self.config)?;

        if year_dirs.is_empty() {
            warn!("No scenario year directories under {}", self.root.display());
            return Ok(LoadSummary::default());
        }

        let concurrent_limit = self.config.max_concurrent_loads.max(1);
        info!(
            "Loading {} scenario years from {} ({} at a time)",
            year_dirs.len(),
            self.root.display(),
            concurrent_limit
        );

        let progress_bar = self
            .show_progress
            .then(|| create_progress_bar(year_dirs.len() as u64, "Loading scenario years"));

        let results: Vec<(ScenarioYear, Result<LoadReport>)> = stream::iter(year_dirs)
            .map(|(year, dir)| {
                let store = Arc::clone(&store);
                let config = Arc::clone(&self.config);
                let pb = progress_bar.clone();
                async move {
                    let result = task::spawn_blocking(move || load_year_dir(&store, &config, year, &dir))
                        .await
                        .unwrap_or_else(|e| {
                            Err(NitrogenError::LoadTask {
                                year: year.as_u16(),
                                reason: e.to_string(),
                            })
                        });

                    if let Some(pb) = &pb {
                        pb.inc(1);
                        pb.set_message(format!("{} done", year));
                    }
                    (year, result)
                }
            })
            .buffer_unordered(concurrent_limit)
            .collect()
            .await;

        let mut summary = LoadSummary::default();
        for (year, result) in results {
            match result {
                Ok(report) => summary.reports.push(report),
                Err(e) => {
                    warn!("Failed to load {}: {}", year, e);
                    summary.failures.push((year, e));
                }
            }
        }
        summary.reports.sort_by_key(|report| report.year);
        summary.failures.sort_by_key(|(year, _)| *year);
        summary.elapsed = start_time.elapsed();

        if let Some(pb) = &progress_bar {
            pb.finish_with_message(format!(
                "Loaded {} of {} years",
                summary.reports.len(),
                summary.reports.len() + summary.failures.len()
            ));
        }

        info!(
            "Loaded {} years ({} records, {} rows rejected) in {:.2}s",
            summary.reports.len(),
            summary.total_records(),
            summary.total_rejected(),
            summary.elapsed.as_secs_f64()
        );

        Ok(summary)
    }
}

/// Read one year directory and commit it
pub fn load_year_dir(
    store: &ScenarioStore,
    config: &PipelineConfig,
    year: ScenarioYear,
    dir: &Path,
) -> Result<LoadReport> {
    debug!("Reading {} dataset from {}", year, dir.display());
    let dataset = read_year_dataset(dir, year, config)?;
    Ok(store.load(year, dataset)?)
}

fn create_progress_bar(total: u64, operation: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    pb.set_message(operation.to_string());
    pb
}
