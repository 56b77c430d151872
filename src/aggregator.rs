//! Flow aggregation over normalized records.
//!
//! Groups records of one scenario year by a tuple of dimensions and sums
//! `nitrogen_kg`. Groups only exist for key combinations present in the
//! input, so absent rows mean zero. Within a group values are accumulated in
//! input order, which keeps repeated runs over the same input bit-identical;
//! rows are emitted sorted by key. Grouping runs over a `BTreeMap` rather
//! than a Polars group-by, whose parallel sums have no fixed order.

use crate::constants::KG_PER_KILOTONNE;
use crate::error::{InvalidFilterError, Result};
use crate::models::{NormalizedRecord, ScenarioYear, Stage};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// A dimension records can be grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Stage,
    Commodity,
    County,
    Origin,
    Destination,
    Cluster,
    /// Loss, flow or trade
    Kind,
    /// Trade direction; empty for losses and flow edges
    Direction,
}

impl Dimension {
    pub const ALL: [Dimension; 8] = [
        Dimension::Stage,
        Dimension::Commodity,
        Dimension::County,
        Dimension::Origin,
        Dimension::Destination,
        Dimension::Cluster,
        Dimension::Kind,
        Dimension::Direction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Stage => "stage",
            Dimension::Commodity => "commodity",
            Dimension::County => "county",
            Dimension::Origin => "origin",
            Dimension::Destination => "destination",
            Dimension::Cluster => "cluster",
            Dimension::Kind => "kind",
            Dimension::Direction => "direction",
        }
    }

    fn key_of(self, record: &NormalizedRecord) -> KeyValue {
        match self {
            Dimension::Stage => KeyValue::Stage(record.stage),
            Dimension::Commodity => KeyValue::Label(record.commodity.clone()),
            Dimension::County => KeyValue::Label(Some(record.county_id.clone())),
            Dimension::Origin => KeyValue::Label(record.origin_county.clone()),
            Dimension::Destination => KeyValue::Label(record.dest_county.clone()),
            Dimension::Cluster => KeyValue::Label(record.cluster_label.clone()),
            Dimension::Kind => KeyValue::label(record.kind().as_str()),
            Dimension::Direction => KeyValue::Label(record.trade.map(|d| d.as_str().to_string())),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = InvalidFilterError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        match wanted.as_str() {
            "dest" => return Ok(Dimension::Destination),
            "cluster_label" => return Ok(Dimension::Cluster),
            "trade" | "trade_direction" => return Ok(Dimension::Direction),
            _ => {}
        }
        Dimension::ALL
            .into_iter()
            .find(|dimension| dimension.as_str() == wanted)
            .ok_or_else(|| InvalidFilterError::UnknownDimension {
                dimension: s.to_string(),
            })
    }
}

/// Parse dimension names into a grouping, rejecting unknown or repeated names
pub fn parse_grouping<S: AsRef<str>>(
    names: &[S],
) -> std::result::Result<Vec<Dimension>, InvalidFilterError> {
    let mut grouping = Vec::with_capacity(names.len());
    for name in names {
        let dimension: Dimension = name.as_ref().parse()?;
        if grouping.contains(&dimension) {
            return Err(InvalidFilterError::DuplicateDimension {
                dimension: dimension.as_str().to_string(),
            });
        }
        grouping.push(dimension);
    }
    Ok(grouping)
}

/// One component of a group key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum KeyValue {
    Stage(Stage),
    Label(Option<String>),
}

impl KeyValue {
    pub fn label(value: &str) -> Self {
        KeyValue::Label(Some(value.to_string()))
    }

    /// Text form, `None` for a missing label
    pub fn as_text(&self) -> Option<&str> {
        match self {
            KeyValue::Stage(stage) => Some(stage.as_str()),
            KeyValue::Label(label) => label.as_deref(),
        }
    }
}

/// Summed nitrogen for one group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub key: Vec<KeyValue>,
    pub nitrogen_kg: f64,
    pub record_count: usize,
}

/// Immutable result of grouping one year's records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateView {
    pub year: ScenarioYear,
    pub group_by: Vec<Dimension>,
    pub rows: Vec<AggregateRow>,
    /// Input-order sum of every aggregated record
    pub total_kg: f64,
    pub record_count: usize,
}

impl AggregateView {
    /// Row for an exact key, in grouping order
    pub fn get(&self, key: &[KeyValue]) -> Option<&AggregateRow> {
        self.rows
            .binary_search_by(|row| row.key.as_slice().cmp(key))
            .ok()
            .map(|index| &self.rows[index])
    }

    /// Summed nitrogen for a key, zero when the group is absent
    pub fn value(&self, key: &[KeyValue]) -> f64 {
        self.get(key).map(|row| row.nitrogen_kg).unwrap_or(0.0)
    }

    /// Sum of the group rows in row order
    pub fn rows_total(&self) -> f64 {
        self.rows.iter().map(|row| row.nitrogen_kg).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Columnar form: one string column per dimension plus the sums
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let mut columns = Vec::with_capacity(self.group_by.len() + 3);
        columns.push(Column::new(
            "year".into(),
            vec![self.year.as_u16() as u32; self.rows.len()],
        ));

        for (position, dimension) in self.group_by.iter().enumerate() {
            let values: Vec<Option<&str>> = self
                .rows
                .iter()
                .map(|row| row.key.get(position).and_then(KeyValue::as_text))
                .collect();
            columns.push(Column::new(dimension.as_str().into(), values));
        }

        let sums: Vec<f64> = self.rows.iter().map(|row| row.nitrogen_kg).collect();
        let counts: Vec<u64> = self.rows.iter().map(|row| row.record_count as u64).collect();
        columns.push(Column::new("nitrogen_kg".into(), sums));
        columns.push(Column::new("record_count".into(), counts));

        DataFrame::new(columns)
    }

    /// Write the view as CSV with a header row
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut df = self.to_dataframe()?;
        let mut file = File::create(path)?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
        debug!("Wrote {} aggregate rows to {}", df.height(), path.display());
        Ok(())
    }

    /// Write the view as Snappy-compressed Parquet
    pub fn write_parquet(&self, path: &Path) -> Result<()> {
        let mut df = self.to_dataframe()?;
        let file = File::create(path)?;
        ParquetWriter::new(file)
            .with_compression(ParquetCompression::Snappy)
            .finish(&mut df)?;
        debug!("Wrote {} aggregate rows to {}", df.height(), path.display());
        Ok(())
    }
}

/// Group records by the given dimensions and sum their nitrogen
pub fn aggregate<'r, I>(year: ScenarioYear, records: I, group_by: &[Dimension]) -> AggregateView
where
    I: IntoIterator<Item = &'r NormalizedRecord>,
{
    let mut groups: BTreeMap<Vec<KeyValue>, (f64, usize)> = BTreeMap::new();
    let mut total_kg = 0.0;
    let mut record_count = 0;

    for record in records {
        let key: Vec<KeyValue> = group_by.iter().map(|d| d.key_of(record)).collect();
        let group = groups.entry(key).or_insert((0.0, 0));
        group.0 += record.nitrogen_kg;
        group.1 += 1;
        total_kg += record.nitrogen_kg;
        record_count += 1;
    }

    AggregateView {
        year,
        group_by: group_by.to_vec(),
        rows: groups
            .into_iter()
            .map(|(key, (nitrogen_kg, record_count))| AggregateRow {
                key,
                nitrogen_kg,
                record_count,
            })
            .collect(),
        total_kg,
        record_count,
    }
}

/// Loss total for one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageLoss {
    pub stage: Stage,
    pub label: &'static str,
    pub nitrogen_kg: f64,
}

impl StageLoss {
    pub fn kilotonnes(&self) -> f64 {
        self.nitrogen_kg / KG_PER_KILOTONNE
    }
}

/// Nitrogen loss per supply-chain stage for one year
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub year: ScenarioYear,
    pub stages: Vec<StageLoss>,
    pub total_kg: f64,
}

impl StageSummary {
    pub fn total_kilotonnes(&self) -> f64 {
        self.total_kg / KG_PER_KILOTONNE
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageLoss> {
        self.stages.iter().find(|loss| loss.stage == stage)
    }
}

/// Loss per stage in supply-chain order; flows and trade totals are not losses
pub fn stage_summary(year: ScenarioYear, records: &[NormalizedRecord]) -> StageSummary {
    let view = aggregate(
        year,
        records.iter().filter(|record| record.is_loss()),
        &[Dimension::Stage],
    );

    let stages = view
        .rows
        .iter()
        .filter_map(|row| match row.key.first() {
            Some(KeyValue::Stage(stage)) => Some(StageLoss {
                stage: *stage,
                label: stage.label(),
                nitrogen_kg: row.nitrogen_kg,
            }),
            _ => None,
        })
        .collect();

    StageSummary {
        year,
        stages,
        total_kg: view.total_kg,
    }
}

/// Total loss of one county across all stages
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountyTotal {
    pub county_id: String,
    pub county_name: Option<String>,
    pub nitrogen_kg: f64,
}

/// Loss per county, sorted by identifier
///
/// The display name is the first non-empty name seen for the county.
pub fn county_totals(records: &[NormalizedRecord]) -> Vec<CountyTotal> {
    let mut totals: BTreeMap<&str, CountyTotal> = BTreeMap::new();

    for record in records.iter().filter(|record| record.is_loss()) {
        let total = totals
            .entry(record.county_id.as_str())
            .or_insert_with(|| CountyTotal {
                county_id: record.county_id.clone(),
                county_name: None,
                nitrogen_kg: 0.0,
            });
        total.nitrogen_kg += record.nitrogen_kg;
        if total.county_name.is_none() {
            total.county_name = record.county_name.clone();
        }
    }

    totals.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeDirection;

    fn record(county: &str, stage: Stage, commodity: &str, kg: f64) -> NormalizedRecord {
        NormalizedRecord::new(ScenarioYear::Y2017, county, stage, kg).with_commodity(commodity)
    }

    fn sample() -> Vec<NormalizedRecord> {
        vec![
            record("24003", Stage::CropProduction, "corn", 100.0),
            record("24005", Stage::CropProduction, "corn", 50.0),
            record("24003", Stage::CropProcessing, "soybeans", 25.0),
            record("24003", Stage::FeedWaste, "beef", 10.0),
            record("24005", Stage::CropProduction, "soybeans", 5.0),
        ]
    }

    #[test]
    fn test_group_by_stage() {
        let view = aggregate(ScenarioYear::Y2017, &sample(), &[Dimension::Stage]);
        assert_eq!(view.rows.len(), 3);
        assert_eq!(view.value(&[KeyValue::Stage(Stage::CropProduction)]), 155.0);
        assert_eq!(view.value(&[KeyValue::Stage(Stage::FeedWaste)]), 10.0);
        assert_eq!(view.value(&[KeyValue::Stage(Stage::HumanWaste)]), 0.0);
        assert!(view.get(&[KeyValue::Stage(Stage::HumanWaste)]).is_none());
        assert_eq!(view.total_kg, 190.0);
        assert_eq!(view.record_count, 5);
    }

    #[test]
    fn test_group_by_pair_is_sorted_and_sparse() {
        let view = aggregate(
            ScenarioYear::Y2017,
            &sample(),
            &[Dimension::County, Dimension::Commodity],
        );
        let keys: Vec<Vec<Option<&str>>> = view
            .rows
            .iter()
            .map(|row| row.key.iter().map(KeyValue::as_text).collect())
            .collect();
        assert_eq!(
            keys,
            vec![
                vec![Some("24003"), Some("beef")],
                vec![Some("24003"), Some("corn")],
                vec![Some("24003"), Some("soybeans")],
                vec![Some("24005"), Some("corn")],
                vec![Some("24005"), Some("soybeans")],
            ]
        );
        assert_eq!(view.get(&[KeyValue::label("24005"), KeyValue::label("corn")]).unwrap().record_count, 1);
    }

    #[test]
    fn test_empty_grouping_gives_grand_total() {
        let view = aggregate(ScenarioYear::Y2017, &sample(), &[]);
        assert_eq!(view.rows.len(), 1);
        assert!(view.rows[0].key.is_empty());
        assert_eq!(view.rows[0].nitrogen_kg, 190.0);
    }

    #[test]
    fn test_empty_input_has_no_rows() {
        let records: Vec<NormalizedRecord> = Vec::new();
        let view = aggregate(ScenarioYear::Y2030, &records, &[Dimension::Stage]);
        assert!(view.is_empty());
        assert_eq!(view.total_kg, 0.0);
    }

    #[test]
    fn test_repeated_runs_are_bit_identical() {
        let records: Vec<NormalizedRecord> = (0..500)
            .map(|i| record("24003", Stage::FoodWaste, "milk", 0.1 * (i as f64) + 1e-7))
            .collect();
        let first = aggregate(ScenarioYear::Y2050, &records, &[Dimension::Commodity]);
        let second = aggregate(ScenarioYear::Y2050, &records, &[Dimension::Commodity]);
        assert_eq!(first.rows[0].nitrogen_kg.to_bits(), second.rows[0].nitrogen_kg.to_bits());
    }

    #[test]
    fn test_permutation_matches_within_tolerance() {
        let records = sample();
        let mut reversed = records.clone();
        reversed.reverse();

        let a = aggregate(ScenarioYear::Y2017, &records, &[Dimension::Commodity]);
        let b = aggregate(ScenarioYear::Y2017, &reversed, &[Dimension::Commodity]);
        assert_eq!(a.rows.len(), b.rows.len());
        for (left, right) in a.rows.iter().zip(&b.rows) {
            assert_eq!(left.key, right.key);
            assert!((left.nitrogen_kg - right.nitrogen_kg).abs() < 1e-9);
        }
        assert!((a.rows_total() - a.total_kg).abs() < 1e-9);
    }

    #[test]
    fn test_parse_grouping() {
        assert_eq!(
            parse_grouping(&["stage", "Commodity"]).unwrap(),
            vec![Dimension::Stage, Dimension::Commodity]
        );
        assert_eq!(parse_grouping(&["dest"]).unwrap(), vec![Dimension::Destination]);
        assert!(matches!(
            parse_grouping(&["stage", "stage"]),
            Err(InvalidFilterError::DuplicateDimension { .. })
        ));
        assert!(matches!(
            parse_grouping(&["weather"]),
            Err(InvalidFilterError::UnknownDimension { .. })
        ));
    }

    #[test]
    fn test_stage_summary_skips_flows() {
        let mut records = sample();
        records.push(
            record("24003", Stage::CropProcessing, "corn", 1_000.0).with_flow("24003", "24005"),
        );

        let summary = stage_summary(ScenarioYear::Y2017, &records);
        let stages: Vec<Stage> = summary.stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            stages,
            vec![Stage::CropProduction, Stage::CropProcessing, Stage::FeedWaste]
        );
        assert_eq!(summary.stage(Stage::CropProcessing).unwrap().nitrogen_kg, 25.0);
        assert_eq!(summary.total_kg, 190.0);
        assert_eq!(summary.stages[0].label, "N input not taken by crop");
        assert!((summary.total_kilotonnes() - 0.00019).abs() < 1e-12);
    }

    #[test]
    fn test_trade_totals_group_by_direction_not_summed_as_loss() {
        let mut records = sample();
        records.push(record("24003", Stage::FoodProcessing, "beef", 40.0).with_trade(TradeDirection::Import));
        records.push(record("24003", Stage::FoodProcessing, "beef", 15.0).with_trade(TradeDirection::Export));

        let summary = stage_summary(ScenarioYear::Y2017, &records);
        assert!(summary.stage(Stage::FoodProcessing).is_none());
        assert_eq!(summary.total_kg, 190.0);
        assert_eq!(county_totals(&records)[0].nitrogen_kg, 135.0);

        let view = aggregate(ScenarioYear::Y2017, &records, &[Dimension::Kind, Dimension::Direction]);
        assert_eq!(view.value(&[KeyValue::label("loss"), KeyValue::Label(None)]), 190.0);
        assert_eq!(view.value(&[KeyValue::label("trade"), KeyValue::label("import")]), 40.0);
        assert_eq!(view.value(&[KeyValue::label("trade"), KeyValue::label("export")]), 15.0);
        assert_eq!(parse_grouping(&["trade"]).unwrap(), vec![Dimension::Direction]);
    }

    #[test]
    fn test_county_totals_use_first_name() {
        let mut records = sample();
        records[0].county_name = None;
        records[2].county_name = Some("Anne Arundel".to_string());
        records[3].county_name = Some("Ignored".to_string());

        let totals = county_totals(&records);
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].county_id, "24003");
        assert_eq!(totals[0].county_name.as_deref(), Some("Anne Arundel"));
        assert_eq!(totals[0].nitrogen_kg, 135.0);
        assert_eq!(totals[1].nitrogen_kg, 55.0);
    }

    #[test]
    fn test_write_csv_and_parquet() {
        let dir = tempfile::TempDir::new().unwrap();
        let view = aggregate(ScenarioYear::Y2017, &sample(), &[Dimension::Commodity]);

        let csv = dir.path().join("view.csv");
        view.write_csv(&csv).unwrap();
        let text = std::fs::read_to_string(&csv).unwrap();
        assert!(text.starts_with("year,commodity,nitrogen_kg,record_count"));
        assert_eq!(text.lines().count(), 4);

        let parquet = dir.path().join("view.parquet");
        view.write_parquet(&parquet).unwrap();
        assert!(std::fs::metadata(&parquet).unwrap().len() > 0);
    }

    #[test]
    fn test_to_dataframe_shape() {
        let view = aggregate(
            ScenarioYear::Y2017,
            &sample(),
            &[Dimension::Stage, Dimension::County],
        );
        let df = view.to_dataframe().unwrap();
        assert_eq!(df.height(), view.rows.len());
        let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["year", "stage", "county", "nitrogen_kg", "record_count"]);
    }
}
