//! Read-only query interface for the presentation layer
//!
//! Translates loosely typed requests (numeric years, stage and dimension
//! names, county strings) into store calls. Structurally invalid requests
//! fail with [`InvalidFilterError`]; valid requests that match nothing
//! return empty results.

use crate::aggregator::{
    self, AggregateView, CountyTotal, Dimension, StageSummary, parse_grouping,
};
use crate::error::InvalidFilterError;
use crate::models::{FlowEdge, NormalizedRecord, ProductionMeasure, RecordKind, ScenarioYear, Stage};
use crate::production::{self, ProductionSummary};
use crate::store::{RecordFilter, ScenarioStore};
use crate::trade::{self, TradeBreakdown};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Filter as sent by the presentation layer; blank fields are unset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParams {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub commodity: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    /// `loss`, `flow` or `trade`
    #[serde(default)]
    pub kind: Option<String>,
}

impl FilterParams {
    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_commodity(mut self, commodity: &str) -> Self {
        self.commodity = Some(commodity.to_string());
        self
    }

    pub fn with_county(mut self, county: &str) -> Self {
        self.county = Some(county.to_string());
        self
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    /// Typed filter; fails only on an unknown stage or kind name
    pub fn to_filter(&self) -> Result<RecordFilter, InvalidFilterError> {
        let mut filter = RecordFilter::all();
        if let Some(stage) = parse_stage(self.stage.as_deref())? {
            filter = filter.with_stage(stage);
        }
        if let Some(commodity) = non_blank(self.commodity.as_deref()) {
            filter = filter.with_commodity(commodity);
        }
        if let Some(county) = non_blank(self.county.as_deref()) {
            filter = filter.with_county(county);
        }
        if let Some(cluster) = non_blank(self.cluster.as_deref()) {
            filter = filter.with_cluster(cluster);
        }
        if let Some(kind) = non_blank(self.kind.as_deref()) {
            filter = filter.with_kind(kind.parse::<RecordKind>()?);
        }
        Ok(filter)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_stage(stage: Option<&str>) -> Result<Option<Stage>, InvalidFilterError> {
    non_blank(stage).map(str::parse).transpose()
}

/// Aggregate view of one year inside a scenario comparison
#[derive(Debug, Clone, Serialize)]
pub struct YearComparison {
    pub year: ScenarioYear,
    pub loaded: bool,
    pub view: AggregateView,
}

/// Façade over a shared [`ScenarioStore`]
#[derive(Clone)]
pub struct ScenarioQuery {
    store: Arc<ScenarioStore>,
}

impl ScenarioQuery {
    pub fn new(store: Arc<ScenarioStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ScenarioStore {
        &self.store
    }

    /// Scenario year for a numeric year, if configured
    pub fn year(&self, year: u16) -> Result<ScenarioYear, InvalidFilterError> {
        ScenarioYear::try_from(year)
            .ok()
            .filter(|parsed| self.store.config().is_supported(*parsed))
            .ok_or(InvalidFilterError::UnsupportedYear { year })
    }

    pub fn records(
        &self,
        year: u16,
        params: &FilterParams,
    ) -> Result<Vec<NormalizedRecord>, InvalidFilterError> {
        let year = self.year(year)?;
        self.store.get(year, &params.to_filter()?)
    }

    /// Grouped sums for one year; an empty `group_by` gives the grand total
    pub fn aggregate<S: AsRef<str>>(
        &self,
        year: u16,
        group_by: &[S],
        params: &FilterParams,
    ) -> Result<AggregateView, InvalidFilterError> {
        let year = self.year(year)?;
        let grouping = parse_grouping(group_by)?;
        self.store
            .get_filtered_aggregate(year, &params.to_filter()?, &grouping)
    }

    /// The same grouping for every supported year, ascending
    pub fn compare<S: AsRef<str>>(
        &self,
        group_by: &[S],
        params: &FilterParams,
    ) -> Result<Vec<YearComparison>, InvalidFilterError> {
        let grouping = parse_grouping(group_by)?;
        let filter = params.to_filter()?;
        let loaded = self.store.loaded_years();

        let mut years = self.store.config().supported_years.clone();
        years.sort();
        years.dedup();

        years
            .into_iter()
            .map(|year| {
                Ok(YearComparison {
                    year,
                    loaded: loaded.contains(&year),
                    view: self.store.get_filtered_aggregate(year, &filter, &grouping)?,
                })
            })
            .collect()
    }

    pub fn stage_summary(&self, year: u16) -> Result<StageSummary, InvalidFilterError> {
        let year = self.year(year)?;
        Ok(match self.store.snapshot(year)? {
            Some(partition) => aggregator::stage_summary(year, &partition.records),
            None => aggregator::stage_summary(year, &[]),
        })
    }

    /// Per-county totals, names filled from the reference set when the data has none
    pub fn county_totals(
        &self,
        year: u16,
        params: &FilterParams,
    ) -> Result<Vec<CountyTotal>, InvalidFilterError> {
        let records = self.records(year, params)?;
        let mut totals = aggregator::county_totals(&records);
        for total in &mut totals {
            if total.county_name.is_none() {
                total.county_name = self
                    .store
                    .counties()
                    .name_of(&total.county_id)
                    .map(str::to_string);
            }
        }
        Ok(totals)
    }

    pub fn trade_breakdown(
        &self,
        year: u16,
        county: &str,
        stage: Option<&str>,
    ) -> Result<TradeBreakdown, InvalidFilterError> {
        let year = self.year(year)?;
        let county = non_blank(Some(county)).ok_or(InvalidFilterError::EmptyCounty)?;
        let stage = parse_stage(stage)?;

        Ok(match self.store.snapshot(year)? {
            Some(partition) => trade::trade_breakdown(&partition.records, county, stage),
            None => trade::trade_breakdown(std::iter::empty(), county, stage),
        })
    }

    /// Flow edges touching the filter's county (either end), or all edges
    pub fn flow_edges(
        &self,
        year: u16,
        params: &FilterParams,
    ) -> Result<Vec<FlowEdge>, InvalidFilterError> {
        let year = self.year(year)?;
        let filter = params.to_filter()?;
        let Some(partition) = self.store.snapshot(year)? else {
            return Ok(Vec::new());
        };

        // County matches either end of an edge, not the record's own county
        let without_county = RecordFilter {
            county: None,
            ..filter.clone()
        };
        let edges = partition
            .records
            .iter()
            .filter(|record| without_county.matches(record))
            .filter_map(NormalizedRecord::flow_edge)
            .filter(|edge| {
                filter.county.as_deref().is_none_or(|county| {
                    trade::classify(edge, county).is_some()
                })
            })
            .collect();
        Ok(edges)
    }

    /// Harvested area or inventory per commodity; empty when the year has no production table
    pub fn production_totals(
        &self,
        year: u16,
        measure: &str,
    ) -> Result<ProductionSummary, InvalidFilterError> {
        let year = self.year(year)?;
        let measure: ProductionMeasure = measure.parse()?;
        Ok(match self.store.snapshot(year)? {
            Some(partition) => production::production_summary(year, &partition.production, measure),
            None => production::production_summary(year, &[], measure),
        })
    }

    /// Dimensions a caller may group by
    pub fn dimensions(&self) -> &'static [Dimension] {
        &Dimension::ALL
    }
}
