//! Schema normalization for per-year nitrogen datasets.
//!
//! Applies the schema table from [`PipelineConfig`] to raw source tables and
//! produces canonical [`NormalizedRecord`]s. Structural problems (unknown
//! source, missing required column, unsupported year) fail the whole
//! dataset. Row problems (bad quantity, unknown unit or stage, unknown
//! county) are collected as [`RowRejection`]s next to the valid records so
//! one bad row never aborts a load. Production tables are read with their
//! own, simpler schema into [`ProductionTotal`]s.

use crate::config::{PipelineConfig, ProductionSource, SourceLayout, SourceSchema};
use crate::county_registry::{CountyRegistry, canonical_county_id};
use crate::error::{SchemaError, UnknownCountyError};
use crate::models::{
    NormalizedRecord, ProductionTotal, RawDataset, RawRecord, RawTable, ScenarioYear, Stage,
    TradeDirection,
};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, info};

static QUANTITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*([A-Za-z][A-Za-z .]*)?$")
        .expect("quantity pattern is a valid regex")
});

/// Split a quantity cell such as `"10 lbs"` into value and optional unit
///
/// Thousands separators are ignored; the unit, when present, is returned
/// trimmed and untouched so the unit table decides whether it is known.
pub fn parse_quantity(text: &str) -> Option<(f64, Option<String>)> {
    let compact = text.trim().replace(',', "");
    let captures = QUANTITY_PATTERN.captures(&compact)?;
    let value = captures.get(1)?.as_str().parse::<f64>().ok()?;
    let unit = captures
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .filter(|unit| !unit.is_empty());
    Some((value, unit))
}

/// Why a row was not turned into records
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    Schema(#[serde(serialize_with = "display")] SchemaError),
    UnknownCounty(#[serde(serialize_with = "display")] UnknownCountyError),
}

fn display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Schema(e) => write!(f, "{}", e),
            RejectionReason::UnknownCounty(e) => write!(f, "{}", e),
        }
    }
}

/// A rejected source row with its reason
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowRejection {
    pub source: String,
    pub row: usize,
    pub reason: RejectionReason,
}

/// Result of normalizing one dataset: valid records plus rejected rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizationOutcome {
    pub valid_records: Vec<NormalizedRecord>,
    pub rejected_rows: Vec<RowRejection>,
    pub production: Vec<ProductionTotal>,
    pub rows_read: usize,
}

impl NormalizationOutcome {
    /// Number of distinct source rows with at least one rejection
    pub fn rejected_row_count(&self) -> usize {
        self.rejected_rows
            .iter()
            .map(|rejection| (rejection.source.as_str(), rejection.row))
            .collect::<HashSet<_>>()
            .len()
    }

    /// Share of source rows rejected, 0.0 for an empty dataset
    pub fn rejection_rate(&self) -> f64 {
        if self.rows_read == 0 {
            0.0
        } else {
            self.rejected_row_count() as f64 / self.rows_read as f64
        }
    }

    pub fn unknown_county_count(&self) -> usize {
        self.rejected_rows
            .iter()
            .filter(|r| matches!(r.reason, RejectionReason::UnknownCounty(_)))
            .count()
    }

    /// Fail when rejections are pervasive: above `max_rate`, or nothing valid left
    pub fn check_acceptance(&self, max_rate: f64) -> Result<(), SchemaError> {
        let rejected = self.rejected_row_count();
        if rejected == 0 {
            return Ok(());
        }

        let rate = self.rejection_rate();
        if rate > max_rate || self.valid_records.is_empty() {
            return Err(SchemaError::PervasiveRejection {
                rejected,
                total: self.rows_read,
                rate: rate * 100.0,
                limit: max_rate * 100.0,
            });
        }
        Ok(())
    }
}

/// Column indices resolved once per table
struct ResolvedColumns {
    county: Option<usize>,
    county_name: Option<usize>,
    commodity: Option<usize>,
    cluster: Option<usize>,
    layout: ResolvedLayout,
}

enum ResolvedLayout {
    Wide(Vec<ResolvedMeasure>),
    Long {
        stage: usize,
        quantity: usize,
        unit: Option<usize>,
        origin: Option<usize>,
        dest: Option<usize>,
        default_unit: Option<String>,
    },
}

struct ResolvedMeasure {
    index: usize,
    stage: Stage,
    unit: Option<String>,
    trade: Option<TradeDirection>,
}

/// Schema normalizer bound to a configuration and a county reference set
pub struct Normalizer<'a> {
    config: &'a PipelineConfig,
    counties: &'a CountyRegistry,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a PipelineConfig, counties: &'a CountyRegistry) -> Self {
        Self { config, counties }
    }

    /// Normalize every table of a dataset for its declared year
    pub fn normalize(&self, dataset: &RawDataset) -> Result<NormalizationOutcome, SchemaError> {
        let year = dataset.year;
        if !self.config.is_supported(year) {
            return Err(SchemaError::UnsupportedYear {
                year: year.as_u16(),
            });
        }

        let mut outcome = NormalizationOutcome {
            rows_read: dataset.row_count(),
            ..Default::default()
        };

        for table in &dataset.tables {
            if let Some(source) = self.config.production_source(&table.source) {
                let (totals, rejections) = normalize_production_table(year, source, table)?;
                outcome.production.extend(totals);
                outcome.rejected_rows.extend(rejections);
                continue;
            }

            let (records, rejections) = self.normalize_table(year, table)?;
            outcome.valid_records.extend(records);
            outcome.rejected_rows.extend(rejections);
        }

        info!(
            "Normalized {} dataset: {} rows -> {} records, {} production totals, {} rows rejected ({} unknown counties)",
            year,
            outcome.rows_read,
            outcome.valid_records.len(),
            outcome.production.len(),
            outcome.rejected_row_count(),
            outcome.unknown_county_count()
        );

        Ok(outcome)
    }

    /// Normalize a single source table
    pub fn normalize_table(
        &self,
        year: ScenarioYear,
        table: &RawTable,
    ) -> Result<(Vec<NormalizedRecord>, Vec<RowRejection>), SchemaError> {
        let schema = self
            .config
            .source(&table.source)
            .ok_or_else(|| SchemaError::UnknownSource {
                source_name: table.source.clone(),
            })?;
        let columns = resolve_columns(schema, table)?;

        let mut records = Vec::new();
        let mut rejections = Vec::new();

        for raw in &table.records {
            let result = match &columns.layout {
                ResolvedLayout::Wide(measures) => {
                    self.normalize_wide_row(year, raw, &columns, measures, &mut records)
                }
                ResolvedLayout::Long {
                    stage,
                    quantity,
                    unit,
                    origin,
                    dest,
                    default_unit,
                } => self
                    .normalize_long_row(
                        year,
                        raw,
                        &columns,
                        LongColumns {
                            stage: *stage,
                            quantity: *quantity,
                            unit: *unit,
                            origin: *origin,
                            dest: *dest,
                            default_unit: default_unit.as_deref(),
                        },
                    )
                    .map(|record| records.push(record)),
            };

            if let Err(reasons) = result {
                for reason in reasons {
                    debug!("Rejected {} row {}: {}", table.source, raw.row, reason);
                    rejections.push(RowRejection {
                        source: table.source.clone(),
                        row: raw.row,
                        reason,
                    });
                }
            }
        }

        debug!(
            "Source '{}' ({} rows): {} records, {} rejections",
            table.source,
            table.len(),
            records.len(),
            rejections.len()
        );

        Ok((records, rejections))
    }

    /// Melt one wide row into a record per non-empty measure cell
    fn normalize_wide_row(
        &self,
        year: ScenarioYear,
        raw: &RawRecord,
        columns: &ResolvedColumns,
        measures: &[ResolvedMeasure],
        records: &mut Vec<NormalizedRecord>,
    ) -> Result<(), Vec<RejectionReason>> {
        let county_id = self
            .county_cell(raw, columns.county, "county")
            .map_err(|reason| vec![reason])?;

        let mut reasons = Vec::new();
        for measure in measures {
            let Some(text) = raw.value(measure.index) else {
                continue;
            };

            match self.to_kilograms(raw.row, text, None, measure.unit.as_deref()) {
                Ok(nitrogen_kg) => {
                    let mut record = self.build_record(year, raw, columns, &county_id, measure.stage, nitrogen_kg);
                    record.trade = measure.trade;
                    records.push(record);
                }
                Err(e) => reasons.push(RejectionReason::Schema(e)),
            }
        }

        if reasons.is_empty() { Ok(()) } else { Err(reasons) }
    }

    fn normalize_long_row(
        &self,
        year: ScenarioYear,
        raw: &RawRecord,
        columns: &ResolvedColumns,
        long: LongColumns<'_>,
    ) -> Result<NormalizedRecord, Vec<RejectionReason>> {
        let row = raw.row;
        let mut reasons = Vec::new();

        let stage = match raw.value(long.stage) {
            None => Err(SchemaError::MissingField {
                row,
                field: "stage".to_string(),
            }),
            Some(tag) => self
                .config
                .stages
                .resolve(tag)
                .ok_or_else(|| SchemaError::UnknownStage {
                    row,
                    tag: tag.to_string(),
                }),
        };

        let unit = long.unit.and_then(|index| raw.value(index));
        let nitrogen_kg = match raw.value(long.quantity) {
            None => Err(SchemaError::MissingField {
                row,
                field: "quantity".to_string(),
            }),
            Some(text) => self.to_kilograms(row, text, unit, long.default_unit),
        };

        let stage = stage.map_err(|e| reasons.push(RejectionReason::Schema(e))).ok();
        let nitrogen_kg = nitrogen_kg
            .map_err(|e| reasons.push(RejectionReason::Schema(e)))
            .ok();

        let flow = match (long.origin, long.dest) {
            (Some(origin), Some(dest)) => {
                let origin = self.county_cell(raw, Some(origin), "origin");
                let dest = self.county_cell(raw, Some(dest), "dest");
                match (origin, dest) {
                    (Ok(origin), Ok(dest)) => Some((origin, dest)),
                    (origin, dest) => {
                        reasons.extend(origin.err());
                        reasons.extend(dest.err());
                        None
                    }
                }
            }
            _ => None,
        };

        // Flow rows without their own county column belong to the origin county
        let has_county_cell = columns.county.and_then(|index| raw.value(index)).is_some();
        let county_id = if has_county_cell || long.origin.is_none() {
            match self.county_cell(raw, columns.county, "county") {
                Ok(county_id) => Some(county_id),
                Err(reason) => {
                    reasons.push(reason);
                    None
                }
            }
        } else {
            // origin and dest problems are already reported above
            flow.as_ref().map(|(origin, _)| origin.clone())
        };

        match (stage, nitrogen_kg, county_id) {
            (Some(stage), Some(nitrogen_kg), Some(county_id)) if reasons.is_empty() => {
                let mut record = self.build_record(year, raw, columns, &county_id, stage, nitrogen_kg);
                if let Some((origin, dest)) = flow {
                    record = record.with_flow(origin, dest);
                }
                Ok(record)
            }
            _ => Err(reasons),
        }
    }

    /// Canonical, registry-checked county identifier from a cell
    fn county_cell(
        &self,
        raw: &RawRecord,
        index: Option<usize>,
        field: &str,
    ) -> Result<String, RejectionReason> {
        let value = index.and_then(|i| raw.value(i)).ok_or_else(|| {
            RejectionReason::Schema(SchemaError::MissingField {
                row: raw.row,
                field: field.to_string(),
            })
        })?;

        let county_id = canonical_county_id(value);
        if self.counties.contains(&county_id) {
            Ok(county_id)
        } else {
            Err(RejectionReason::UnknownCounty(UnknownCountyError {
                row: raw.row,
                field: field.to_string(),
                county_id,
            }))
        }
    }

    /// Parse a quantity and convert it to kilograms through the unit table
    ///
    /// Unit precedence: unit embedded in the cell, then the row's unit
    /// column, then the schema default.
    fn to_kilograms(
        &self,
        row: usize,
        text: &str,
        row_unit: Option<&str>,
        default_unit: Option<&str>,
    ) -> Result<f64, SchemaError> {
        let (value, embedded_unit) =
            parse_quantity(text).ok_or_else(|| SchemaError::InvalidQuantity {
                row,
                value: text.to_string(),
            })?;

        if !value.is_finite() {
            return Err(SchemaError::InvalidQuantity {
                row,
                value: text.to_string(),
            });
        }

        let unit = embedded_unit
            .as_deref()
            .or(row_unit)
            .or(default_unit)
            .ok_or_else(|| SchemaError::MissingUnit {
                row,
                value: text.to_string(),
            })?;

        let kg = self
            .config
            .units
            .to_kg(value, unit)
            .ok_or_else(|| SchemaError::UnknownUnit {
                row,
                unit: unit.to_string(),
            })?;

        // A finite value can still overflow once scaled by its unit
        if !kg.is_finite() {
            return Err(SchemaError::InvalidQuantity {
                row,
                value: text.to_string(),
            });
        }

        if kg < 0.0 {
            return Err(SchemaError::NegativeQuantity { row, value });
        }

        // Collapse -0.0 so sums and comparisons stay clean
        Ok(kg + 0.0)
    }

    fn build_record(
        &self,
        year: ScenarioYear,
        raw: &RawRecord,
        columns: &ResolvedColumns,
        county_id: &str,
        stage: Stage,
        nitrogen_kg: f64,
    ) -> NormalizedRecord {
        let county_name = columns
            .county_name
            .and_then(|index| raw.value(index))
            .map(str::to_string)
            .or_else(|| self.counties.name_of(county_id).map(str::to_string));

        let mut record = NormalizedRecord::new(year, county_id, stage, nitrogen_kg);
        record.county_name = county_name;
        record.commodity = columns
            .commodity
            .and_then(|index| raw.value(index))
            .map(str::to_string);
        record.cluster_label = columns
            .cluster
            .and_then(|index| raw.value(index))
            .map(str::to_string);
        record
    }
}

#[derive(Clone, Copy)]
struct LongColumns<'a> {
    stage: usize,
    quantity: usize,
    unit: Option<usize>,
    origin: Option<usize>,
    dest: Option<usize>,
    default_unit: Option<&'a str>,
}

fn resolve_columns(schema: &SourceSchema, table: &RawTable) -> Result<ResolvedColumns, SchemaError> {
    let require = |accepted: &[String], field: &str| {
        table
            .column_index(accepted)
            .ok_or_else(|| SchemaError::MissingColumn {
                source_name: schema.name.clone(),
                field: field.to_string(),
                accepted: accepted.join(", "),
            })
    };

    let (layout, county_required) = match &schema.layout {
        SourceLayout::Wide { measures } => {
            let mut resolved = Vec::with_capacity(measures.len());
            for measure in measures {
                let index = match table.column_index(&measure.columns) {
                    Some(index) => index,
                    None if measure.optional => continue,
                    None => require(&measure.columns, &measure.field_name())?,
                };
                resolved.push(ResolvedMeasure {
                    index,
                    stage: measure.stage,
                    unit: measure.unit.clone(),
                    trade: measure.trade,
                });
            }
            (ResolvedLayout::Wide(resolved), true)
        }
        SourceLayout::Long {
            stage_columns,
            quantity_columns,
            unit_columns,
            origin_columns,
            dest_columns,
            default_unit,
        } => {
            let has_flow = !origin_columns.is_empty();
            let layout = ResolvedLayout::Long {
                stage: require(stage_columns, "stage")?,
                quantity: require(quantity_columns, "quantity")?,
                unit: table.column_index(unit_columns),
                origin: if has_flow { Some(require(origin_columns, "origin")?) } else { None },
                dest: if has_flow { Some(require(dest_columns, "dest")?) } else { None },
                default_unit: default_unit.clone(),
            };
            (layout, !has_flow)
        }
    };

    let county = if county_required {
        Some(require(&schema.county_columns, "county")?)
    } else {
        table.column_index(&schema.county_columns)
    };

    // The display name must come from a different column than the identifier
    let county_name = schema
        .county_name_columns
        .iter()
        .filter_map(|name| table.column_index(std::slice::from_ref(name)))
        .find(|index| Some(*index) != county);

    Ok(ResolvedColumns {
        county,
        county_name,
        commodity: table.column_index(&schema.commodity_columns),
        cluster: table.column_index(&schema.cluster_columns),
        layout,
    })
}

/// Read a per-commodity production table
///
/// Empty value cells are skipped. Values must be plain non-negative
/// numbers; a unit next to the value must be the measure's own unit.
pub fn normalize_production_table(
    year: ScenarioYear,
    source: &ProductionSource,
    table: &RawTable,
) -> Result<(Vec<ProductionTotal>, Vec<RowRejection>), SchemaError> {
    let missing = |accepted: &[String], field: &str| SchemaError::MissingColumn {
        source_name: source.name.clone(),
        field: field.to_string(),
        accepted: accepted.join(", "),
    };
    let commodity_index = table
        .column_index(&source.commodity_columns)
        .ok_or_else(|| missing(&source.commodity_columns, "commodity"))?;
    let value_index = table
        .column_index(&source.value_columns)
        .ok_or_else(|| missing(&source.value_columns, source.measure.as_str()))?;

    let mut totals = Vec::new();
    let mut rejections = Vec::new();

    for raw in &table.records {
        let Some(text) = raw.value(value_index) else {
            continue;
        };

        let parsed = production_value(raw.row, text, source).and_then(|value| {
            let commodity = raw.value(commodity_index).ok_or_else(|| SchemaError::MissingField {
                row: raw.row,
                field: "commodity".to_string(),
            })?;
            Ok(ProductionTotal {
                year,
                commodity: commodity.to_string(),
                measure: source.measure,
                value,
            })
        });

        match parsed {
            Ok(total) => totals.push(total),
            Err(e) => {
                debug!("Rejected {} row {}: {}", source.name, raw.row, e);
                rejections.push(RowRejection {
                    source: source.name.clone(),
                    row: raw.row,
                    reason: RejectionReason::Schema(e),
                });
            }
        }
    }

    debug!(
        "Production source '{}' ({} rows): {} totals, {} rejections",
        source.name,
        table.len(),
        totals.len(),
        rejections.len()
    );

    Ok((totals, rejections))
}

fn production_value(row: usize, text: &str, source: &ProductionSource) -> Result<f64, SchemaError> {
    let (value, unit) = parse_quantity(text)
        .filter(|(value, _)| value.is_finite())
        .ok_or_else(|| SchemaError::InvalidQuantity {
            row,
            value: text.to_string(),
        })?;

    if let Some(unit) = unit.filter(|unit| !source.measure.accepts_unit(unit)) {
        return Err(SchemaError::UnknownUnit { row, unit });
    }
    if value < 0.0 {
        return Err(SchemaError::NegativeQuantity { row, value });
    }
    Ok(value + 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeasureColumn;
    use crate::county_registry::County;
    use crate::models::ProductionMeasure;

    fn registry() -> CountyRegistry {
        CountyRegistry::from_counties([
            County::new("24003", "Anne Arundel"),
            County::new("24005", "Baltimore County"),
            County::new("42001", "Adams"),
        ])
    }

    fn long_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_source(SourceSchema::long("observations", "obs*.csv", "stage", "nitrogen"))
    }

    fn long_table(rows: &[Vec<&str>]) -> RawTable {
        RawTable::from_rows("observations", &["county", "stage", "nitrogen"], rows)
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("10 lbs"), Some((10.0, Some("lbs".to_string()))));
        assert_eq!(parse_quantity("12.5"), Some((12.5, None)));
        assert_eq!(parse_quantity(" 1,234.5kg "), Some((1234.5, Some("kg".to_string()))));
        assert_eq!(parse_quantity("1e3 metric tons"), Some((1000.0, Some("metric tons".to_string()))));
        assert_eq!(parse_quantity("-3 kg"), Some((-3.0, Some("kg".to_string()))));
        assert_eq!(parse_quantity("lots"), None);
        assert_eq!(parse_quantity("10 kg 5"), None);
    }

    #[test]
    fn test_long_row_with_embedded_pounds() {
        let config = long_config();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let dataset = RawDataset::new(ScenarioYear::Y2017)
            .with_table(long_table(&[vec!["24003", "crop_production", "10 lbs"]]));

        let outcome = normalizer.normalize(&dataset).unwrap();
        assert!(outcome.rejected_rows.is_empty());
        assert_eq!(outcome.valid_records.len(), 1);

        let record = &outcome.valid_records[0];
        assert_eq!(record.county_id, "24003");
        assert_eq!(record.county_name.as_deref(), Some("Anne Arundel"));
        assert_eq!(record.stage, Stage::CropProduction);
        assert_eq!(record.year, ScenarioYear::Y2017);
        assert!((record.nitrogen_kg - 4.536).abs() < 1e-3);
    }

    #[test]
    fn test_unknown_unit_is_a_schema_rejection() {
        let config = long_config();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let dataset = RawDataset::new(ScenarioYear::Y2017).with_table(long_table(&[
            vec!["24003", "crop_production", "10 lbs"],
            vec!["24003", "feed_waste", "3 stone"],
        ]));

        let outcome = normalizer.normalize(&dataset).unwrap();
        assert_eq!(outcome.valid_records.len(), 1);
        assert_eq!(outcome.rejected_rows.len(), 1);
        assert_eq!(outcome.rejected_rows[0].row, 2);
        assert_eq!(
            outcome.rejected_rows[0].reason,
            RejectionReason::Schema(SchemaError::UnknownUnit {
                row: 2,
                unit: "stone".to_string()
            })
        );
    }

    #[test]
    fn test_long_row_without_any_unit() {
        let config = long_config();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let dataset = RawDataset::new(ScenarioYear::Y2030)
            .with_table(long_table(&[vec!["24003", "food_waste", "12"]]));

        let outcome = normalizer.normalize(&dataset).unwrap();
        assert!(matches!(
            outcome.rejected_rows[0].reason,
            RejectionReason::Schema(SchemaError::MissingUnit { row: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_counties_are_collected_not_fatal() {
        let config = long_config();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let dataset = RawDataset::new(ScenarioYear::Y2050).with_table(long_table(&[
            vec!["99999", "crop_production", "1 kg"],
            vec!["24005", "crop_production", "2 kg"],
            vec!["88888", "human_waste", "3 kg"],
        ]));

        let outcome = normalizer.normalize(&dataset).unwrap();
        assert_eq!(outcome.valid_records.len(), 1);
        assert_eq!(outcome.unknown_county_count(), 2);
        assert_eq!(
            outcome.rejected_rows[0].reason,
            RejectionReason::UnknownCounty(UnknownCountyError {
                row: 1,
                field: "county".to_string(),
                county_id: "99999".to_string(),
            })
        );
        assert!((outcome.rejection_rate() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_stage_negative_and_garbage_rejections() {
        let config = long_config();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let dataset = RawDataset::new(ScenarioYear::Y2017).with_table(long_table(&[
            vec!["24003", "composting", "1 kg"],
            vec!["24003", "food_waste", "-4 kg"],
            vec!["24003", "food_waste", "plenty"],
            vec!["24003", "", "1 kg"],
        ]));

        let outcome = normalizer.normalize(&dataset).unwrap();
        assert!(outcome.valid_records.is_empty());
        let reasons: Vec<_> = outcome.rejected_rows.iter().map(|r| r.reason.clone()).collect();
        assert!(matches!(reasons[0], RejectionReason::Schema(SchemaError::UnknownStage { .. })));
        assert!(matches!(reasons[1], RejectionReason::Schema(SchemaError::NegativeQuantity { .. })));
        assert!(matches!(reasons[2], RejectionReason::Schema(SchemaError::InvalidQuantity { .. })));
        assert!(matches!(reasons[3], RejectionReason::Schema(SchemaError::MissingField { .. })));
    }

    #[test]
    fn test_quantity_overflowing_after_conversion_is_rejected() {
        let config = long_config();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let dataset = RawDataset::new(ScenarioYear::Y2017).with_table(long_table(&[
            vec!["24003", "crop_production", "1e308 kt"],
            vec!["24003", "feed_waste", "1 kg"],
        ]));

        let outcome = normalizer.normalize(&dataset).unwrap();
        assert_eq!(outcome.valid_records.len(), 1);
        assert!(outcome.valid_records.iter().all(|r| r.nitrogen_kg.is_finite()));
        assert_eq!(outcome.valid_records[0].stage, Stage::FeedWaste);
        assert_eq!(
            outcome.rejected_rows[0].reason,
            RejectionReason::Schema(SchemaError::InvalidQuantity {
                row: 1,
                value: "1e308 kt".to_string()
            })
        );
    }

    #[test]
    fn test_wide_rows_are_melted() {
        let config = PipelineConfig::default();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let table = RawTable::from_rows(
            "crop_processing",
            &["FIPS", "county", "commodity", "nitrogen_loss1", "nitrogen_loss2"],
            &[
                vec!["24003", "Anne Arundel", "corn", "100", "25.5"],
                vec!["24005.0", "Baltimore", "soybeans", "40", "NA"],
            ],
        );

        let (records, rejections) = normalizer.normalize_table(ScenarioYear::Y2017, &table).unwrap();
        assert!(rejections.is_empty());
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].stage, Stage::CropProduction);
        assert_eq!(records[0].commodity.as_deref(), Some("corn"));
        assert_eq!(records[1].stage, Stage::CropProcessing);
        assert_eq!(records[1].nitrogen_kg, 25.5);
        assert_eq!(records[2].county_id, "24005");
        assert_eq!(records[2].county_name.as_deref(), Some("Baltimore"));
    }

    #[test]
    fn test_wide_trade_columns_become_trade_records() {
        let config = PipelineConfig::default();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let table = RawTable::from_rows(
            "animal_stage",
            &[
                "FIPS",
                "commodity",
                "nitrogen_loss3",
                "nitrogen_loss4",
                "nitrogen_loss5",
                "nitrogen_loss6",
                "nitrogen_loss7",
                "import_meat_nitrogen",
                "export_meat_nitrogen",
                "selfloop_meat_nitrogen",
            ],
            &[vec!["24003", "beef", "1", "2", "3", "4", "5", "70", "20", "NA"]],
        );

        let (records, rejections) = normalizer.normalize_table(ScenarioYear::Y2050, &table).unwrap();
        assert!(rejections.is_empty());
        assert_eq!(records.len(), 7);
        assert_eq!(records.iter().filter(|r| r.is_loss()).count(), 5);

        let trade: Vec<&NormalizedRecord> = records.iter().filter(|r| r.trade.is_some()).collect();
        assert_eq!(trade.len(), 2);
        assert_eq!(trade[0].trade, Some(TradeDirection::Import));
        assert_eq!(trade[0].stage, Stage::FoodProcessing);
        assert_eq!(trade[0].nitrogen_kg, 70.0);
        assert_eq!(trade[1].trade, Some(TradeDirection::Export));
        assert_eq!(trade[1].county_id, "24003");
    }

    #[test]
    fn test_missing_required_trade_column_is_structural() {
        let mut measure = MeasureColumn::trade(Stage::CropProcessing, TradeDirection::Export, "crop_nitrogen");
        measure.optional = false;
        let mut schema = SourceSchema::wide("crops", "crops*.csv", &[Stage::CropProduction]);
        if let SourceLayout::Wide { measures } = &mut schema.layout {
            measures.push(measure);
        }
        let config = PipelineConfig::default().with_source(schema);
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let table = RawTable::from_rows("crops", &["FIPS", "nitrogen_loss1"], &[vec!["24003", "1"]]);

        match normalizer.normalize_table(ScenarioYear::Y2017, &table) {
            Err(SchemaError::MissingColumn { field, .. }) => assert_eq!(field, "crop_processing export"),
            other => panic!("Expected MissingColumn, got {:?}", other),
        }
    }

    #[test]
    fn test_production_tables_are_read_per_commodity() {
        let config = PipelineConfig::default();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let area = RawTable::from_rows(
            "harvested_area",
            &["Commodity", "Total Harvested Area (Acre)"],
            &[
                vec!["corn", "1,200.5"],
                vec!["soybeans", "800 acres"],
                vec!["wheat", "NA"],
                vec!["barley", "12 head"],
                vec!["", "3"],
            ],
        );
        let crops = RawTable::from_rows(
            "crop_processing",
            &["FIPS", "commodity", "nitrogen_loss1", "nitrogen_loss2"],
            &[vec!["24003", "corn", "10", "1"]],
        );
        let dataset = RawDataset::new(ScenarioYear::Y2030).with_table(area).with_table(crops);

        let outcome = normalizer.normalize(&dataset).unwrap();
        assert_eq!(outcome.rows_read, 6);
        assert_eq!(outcome.valid_records.len(), 2);
        assert_eq!(outcome.production.len(), 2);
        assert_eq!(outcome.production[0].commodity, "corn");
        assert_eq!(outcome.production[0].value, 1200.5);
        assert_eq!(outcome.production[1].measure, ProductionMeasure::HarvestedArea);

        let reasons: Vec<_> = outcome.rejected_rows.iter().map(|r| r.reason.clone()).collect();
        assert!(matches!(reasons[0], RejectionReason::Schema(SchemaError::UnknownUnit { row: 4, .. })));
        assert!(matches!(reasons[1], RejectionReason::Schema(SchemaError::MissingField { row: 5, .. })));
    }

    #[test]
    fn test_production_table_without_value_column_is_structural() {
        let config = PipelineConfig::default();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let dataset = RawDataset::new(ScenarioYear::Y2017).with_table(RawTable::from_rows(
            "inventory",
            &["Commodity", "Total Harvested Area (Acre)"],
            &[vec!["beef", "10"]],
        ));

        match normalizer.normalize(&dataset) {
            Err(SchemaError::MissingColumn { source_name, field, .. }) => {
                assert_eq!(source_name, "inventory");
                assert_eq!(field, "inventory");
            }
            other => panic!("Expected MissingColumn, got {:?}", other),
        }
    }

    #[test]
    fn test_wide_row_with_unknown_county_rejected_once() {
        let config = PipelineConfig::default();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let table = RawTable::from_rows(
            "crop_processing",
            &["FIPS", "commodity", "nitrogen_loss1", "nitrogen_loss2"],
            &[vec!["51001", "corn", "1", "2"]],
        );

        let (records, rejections) = normalizer.normalize_table(ScenarioYear::Y2017, &table).unwrap();
        assert!(records.is_empty());
        assert_eq!(rejections.len(), 1);
    }

    #[test]
    fn test_missing_required_column_is_structural() {
        let config = PipelineConfig::default();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let table = RawTable::from_rows(
            "crop_processing",
            &["FIPS", "commodity", "nitrogen_loss1"],
            &[vec!["24003", "corn", "1"]],
        );

        let result = normalizer.normalize_table(ScenarioYear::Y2017, &table);
        match result {
            Err(SchemaError::MissingColumn { field, .. }) => assert_eq!(field, "crop_processing"),
            other => panic!("Expected MissingColumn, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_source_and_unsupported_year() {
        let config = PipelineConfig::default().with_supported_years(vec![ScenarioYear::Y2017]);
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);

        let stray = RawDataset::new(ScenarioYear::Y2017)
            .with_table(RawTable::from_rows("mystery", &["a"], &[]));
        assert!(matches!(
            normalizer.normalize(&stray),
            Err(SchemaError::UnknownSource { .. })
        ));

        let projected = RawDataset::new(ScenarioYear::Y2050);
        assert_eq!(
            normalizer.normalize(&projected),
            Err(SchemaError::UnsupportedYear { year: 2050 })
        );
    }

    #[test]
    fn test_flow_rows_take_origin_as_county() {
        let config = PipelineConfig::default();
        let counties = registry();
        let normalizer = Normalizer::new(&config, &counties);
        let table = RawTable::from_rows(
            "flows",
            &["origin", "destination", "stage", "commodity", "nitrogen_kg"],
            &[
                vec!["24003", "24005", "crop_processing", "corn", "50"],
                vec!["24003", "77777", "crop_processing", "corn", "5"],
            ],
        );

        let (records, rejections) = normalizer.normalize_table(ScenarioYear::Y2030, &table).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].county_id, "24003");
        assert_eq!(records[0].dest_county.as_deref(), Some("24005"));
        assert!(records[0].is_flow());

        assert_eq!(rejections.len(), 1);
        assert!(matches!(
            &rejections[0].reason,
            RejectionReason::UnknownCounty(e) if e.field == "dest"
        ));
    }

    #[test]
    fn test_acceptance_threshold() {
        let mut outcome = NormalizationOutcome {
            rows_read: 4,
            ..Default::default()
        };
        outcome
            .valid_records
            .push(NormalizedRecord::new(ScenarioYear::Y2017, "24003", Stage::FoodWaste, 1.0));
        outcome.rejected_rows.push(RowRejection {
            source: "s".to_string(),
            row: 2,
            reason: RejectionReason::Schema(SchemaError::MissingField {
                row: 2,
                field: "stage".to_string(),
            }),
        });

        assert!(outcome.check_acceptance(0.5).is_ok());
        assert!(matches!(
            outcome.check_acceptance(0.1),
            Err(SchemaError::PervasiveRejection { rejected: 1, total: 4, .. })
        ));

        outcome.valid_records.clear();
        assert!(outcome.check_acceptance(1.0).is_err());
    }
}
