//! Core data structures for nitrogen scenario processing.
//!
//! Defines scenario years, supply-chain stages, the raw tabular input shape,
//! the canonical normalized record, flow edges between counties, and the
//! per-commodity production totals shipped next to the loss tables.

use crate::constants::NULL_MARKERS;
use crate::error::{InvalidFilterError, SchemaError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Modeled scenario horizon
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u16", into = "u16")]
pub enum ScenarioYear {
    Y2017,
    Y2030,
    Y2050,
}

impl ScenarioYear {
    pub const ALL: [ScenarioYear; 3] = [ScenarioYear::Y2017, ScenarioYear::Y2030, ScenarioYear::Y2050];

    pub fn as_u16(self) -> u16 {
        match self {
            ScenarioYear::Y2017 => 2017,
            ScenarioYear::Y2030 => 2030,
            ScenarioYear::Y2050 => 2050,
        }
    }

    /// 2017 is observed data, later horizons are model projections
    pub fn is_projection(self) -> bool {
        self != ScenarioYear::Y2017
    }
}

impl TryFrom<u16> for ScenarioYear {
    type Error = SchemaError;

    fn try_from(year: u16) -> Result<Self, Self::Error> {
        match year {
            2017 => Ok(ScenarioYear::Y2017),
            2030 => Ok(ScenarioYear::Y2030),
            2050 => Ok(ScenarioYear::Y2050),
            _ => Err(SchemaError::UnsupportedYear { year }),
        }
    }
}

impl From<ScenarioYear> for u16 {
    fn from(year: ScenarioYear) -> Self {
        year.as_u16()
    }
}

impl fmt::Display for ScenarioYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Supply-chain phase at which nitrogen loss is measured
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CropProduction,
    CropProcessing,
    FeedWaste,
    LivestockProcessing,
    FoodProcessing,
    FoodWaste,
    HumanWaste,
}

impl Stage {
    /// Stages in supply-chain order
    pub const ALL: [Stage; 7] = [
        Stage::CropProduction,
        Stage::CropProcessing,
        Stage::FeedWaste,
        Stage::LivestockProcessing,
        Stage::FoodProcessing,
        Stage::FoodWaste,
        Stage::HumanWaste,
    ];

    /// Canonical snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::CropProduction => "crop_production",
            Stage::CropProcessing => "crop_processing",
            Stage::FeedWaste => "feed_waste",
            Stage::LivestockProcessing => "livestock_processing",
            Stage::FoodProcessing => "food_processing",
            Stage::FoodWaste => "food_waste",
            Stage::HumanWaste => "human_waste",
        }
    }

    /// Human-readable description used in loss tables
    pub fn label(self) -> &'static str {
        match self {
            Stage::CropProduction => "N input not taken by crop",
            Stage::CropProcessing => "Crop processing N loss",
            Stage::FeedWaste => "Feed waste & manure loss",
            Stage::LivestockProcessing => "Slaughtering/milking/laying N loss",
            Stage::FoodProcessing => "Food processing N loss",
            Stage::FoodWaste => "Food N waste",
            Stage::HumanWaste => "Human N waste",
        }
    }

    /// Position in the supply chain, starting at 1
    pub fn number(self) -> usize {
        match self {
            Stage::CropProduction => 1,
            Stage::CropProcessing => 2,
            Stage::FeedWaste => 3,
            Stage::LivestockProcessing => 4,
            Stage::FoodProcessing => 5,
            Stage::FoodWaste => 6,
            Stage::HumanWaste => 7,
        }
    }

    /// Column name used by the original loss tables (`nitrogen_loss1` ..)
    pub fn legacy_column(self) -> String {
        format!("nitrogen_loss{}", self.number())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = InvalidFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| InvalidFilterError::UnknownStage {
                stage: s.to_string(),
            })
    }
}

/// One row of a source table, consumed during normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based data row number within its table
    pub row: usize,
    pub values: Vec<Option<String>>,
}

impl RawRecord {
    /// Trimmed cell value, `None` for missing cells and null markers
    pub fn value(&self, index: usize) -> Option<&str> {
        let raw = self.values.get(index)?.as_deref()?.trim();
        if NULL_MARKERS.contains(&raw) {
            None
        } else {
            Some(raw)
        }
    }
}

/// A source table as read from disk, before any schema is applied
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// Name of the source schema this table is read with
    pub source: String,
    pub path: Option<PathBuf>,
    pub columns: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl RawTable {
    pub fn new(source: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            source: source.into(),
            path: None,
            columns,
            records: Vec::new(),
        }
    }

    /// Build a table from string rows, numbering rows from 1
    pub fn from_rows(source: impl Into<String>, columns: &[&str], rows: &[Vec<&str>]) -> Self {
        let mut table = Self::new(source, columns.iter().map(|c| c.to_string()).collect());
        for row in rows {
            table.push_row(row.iter().map(|v| Some(v.to_string())).collect());
        }
        table
    }

    pub fn push_row(&mut self, values: Vec<Option<String>>) {
        let row = self.records.len() + 1;
        self.records.push(RawRecord { row, values });
    }

    /// Index of the first accepted header name present in this table
    pub fn column_index(&self, accepted: &[String]) -> Option<usize> {
        accepted.iter().find_map(|name| {
            self.columns
                .iter()
                .position(|column| column.trim() == name.as_str())
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// All source tables submitted for one scenario year
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataset {
    pub year: ScenarioYear,
    pub tables: Vec<RawTable>,
}

impl RawDataset {
    pub fn new(year: ScenarioYear) -> Self {
        Self {
            year,
            tables: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: RawTable) -> Self {
        self.tables.push(table);
        self
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(RawTable::len).sum()
    }
}

/// Canonical nitrogen record shared by every scenario year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub year: ScenarioYear,
    pub county_id: String,
    pub county_name: Option<String>,
    pub stage: Stage,
    pub commodity: Option<String>,
    /// Nitrogen mass in kilograms, never negative
    pub nitrogen_kg: f64,
    pub origin_county: Option<String>,
    pub dest_county: Option<String>,
    /// Label assigned by the offline clustering step, if any
    pub cluster_label: Option<String>,
    /// Set on county trade totals (imports, exports, within-county use)
    #[serde(default)]
    pub trade: Option<TradeDirection>,
}

impl NormalizedRecord {
    pub fn new(year: ScenarioYear, county_id: impl Into<String>, stage: Stage, nitrogen_kg: f64) -> Self {
        Self {
            year,
            county_id: county_id.into(),
            county_name: None,
            stage,
            commodity: None,
            nitrogen_kg,
            origin_county: None,
            dest_county: None,
            cluster_label: None,
            trade: None,
        }
    }

    pub fn with_commodity(mut self, commodity: impl Into<String>) -> Self {
        self.commodity = Some(commodity.into());
        self
    }

    pub fn with_flow(mut self, origin: impl Into<String>, dest: impl Into<String>) -> Self {
        self.origin_county = Some(origin.into());
        self.dest_county = Some(dest.into());
        self
    }

    pub fn with_trade(mut self, direction: TradeDirection) -> Self {
        self.trade = Some(direction);
        self
    }

    /// True when the record describes a county-to-county transfer
    pub fn is_flow(&self) -> bool {
        self.origin_county.is_some() && self.dest_county.is_some()
    }

    pub fn kind(&self) -> RecordKind {
        if self.trade.is_some() {
            RecordKind::Trade
        } else if self.is_flow() {
            RecordKind::Flow
        } else {
            RecordKind::Loss
        }
    }

    /// Only loss records count towards stage and county loss totals
    pub fn is_loss(&self) -> bool {
        self.kind() == RecordKind::Loss
    }

    pub fn flow_edge(&self) -> Option<FlowEdge> {
        match (&self.origin_county, &self.dest_county) {
            (Some(origin), Some(dest)) => Some(FlowEdge {
                origin: origin.clone(),
                dest: dest.clone(),
                stage: self.stage,
                commodity: self.commodity.clone(),
                nitrogen_kg: self.nitrogen_kg,
            }),
            _ => None,
        }
    }
}

/// What a normalized record measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Nitrogen lost at a supply-chain stage
    Loss,
    /// County-to-county transfer edge
    Flow,
    /// County trade total in one direction
    Trade,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Loss, RecordKind::Flow, RecordKind::Trade];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Loss => "loss",
            RecordKind::Flow => "flow",
            RecordKind::Trade => "trade",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = InvalidFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| InvalidFilterError::UnknownKind {
                kind: s.to_string(),
            })
    }
}

/// Nitrogen movement between two counties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub origin: String,
    pub dest: String,
    pub stage: Stage,
    pub commodity: Option<String>,
    pub nitrogen_kg: f64,
}

impl FlowEdge {
    pub fn new(origin: impl Into<String>, dest: impl Into<String>, stage: Stage, nitrogen_kg: f64) -> Self {
        Self {
            origin: origin.into(),
            dest: dest.into(),
            stage,
            commodity: None,
            nitrogen_kg,
        }
    }
}

/// Direction of a flow edge relative to a reference county
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    Import,
    Export,
    WithinCounty,
}

impl TradeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeDirection::Import => "import",
            TradeDirection::Export => "export",
            TradeDirection::WithinCounty => "within_county",
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Production measure reported per commodity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionMeasure {
    /// Crop area harvested, in acres
    HarvestedArea,
    /// Livestock inventory, in head
    Inventory,
}

impl ProductionMeasure {
    pub const ALL: [ProductionMeasure; 2] = [ProductionMeasure::HarvestedArea, ProductionMeasure::Inventory];

    pub fn as_str(self) -> &'static str {
        match self {
            ProductionMeasure::HarvestedArea => "harvested_area",
            ProductionMeasure::Inventory => "inventory",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            ProductionMeasure::HarvestedArea => "acres",
            ProductionMeasure::Inventory => "head",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProductionMeasure::HarvestedArea => "Total harvested area",
            ProductionMeasure::Inventory => "Total inventory",
        }
    }

    /// Whether a unit written next to a value means this measure's unit
    pub fn accepts_unit(self, unit: &str) -> bool {
        let unit = unit.trim().trim_end_matches('.').to_ascii_lowercase();
        match self {
            ProductionMeasure::HarvestedArea => matches!(unit.as_str(), "acre" | "acres" | "ac"),
            ProductionMeasure::Inventory => matches!(unit.as_str(), "head" | "heads"),
        }
    }
}

impl fmt::Display for ProductionMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductionMeasure {
    type Err = InvalidFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        match wanted.as_str() {
            "area" | "harvested_area" => Ok(ProductionMeasure::HarvestedArea),
            "inventory" | "head" => Ok(ProductionMeasure::Inventory),
            _ => Err(InvalidFilterError::UnknownMeasure {
                measure: s.to_string(),
            }),
        }
    }
}

/// One commodity's production figure for a scenario year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionTotal {
    pub year: ScenarioYear,
    pub commodity: String,
    pub measure: ProductionMeasure,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_conversion() {
        assert_eq!(ScenarioYear::try_from(2030).unwrap(), ScenarioYear::Y2030);
        assert_eq!(
            ScenarioYear::try_from(2040),
            Err(SchemaError::UnsupportedYear { year: 2040 })
        );
        assert_eq!(u16::from(ScenarioYear::Y2050), 2050);
        assert!(!ScenarioYear::Y2017.is_projection());
    }

    #[test]
    fn test_stage_parsing() {
        assert_eq!("feed_waste".parse::<Stage>().unwrap(), Stage::FeedWaste);
        assert_eq!(" Human_Waste ".parse::<Stage>().unwrap(), Stage::HumanWaste);
        assert!("manure".parse::<Stage>().is_err());
        assert_eq!(Stage::FoodWaste.legacy_column(), "nitrogen_loss6");
    }

    #[test]
    fn test_raw_record_null_markers() {
        let table = RawTable::from_rows("t", &["a", "b", "c"], &[vec![" 12 ", "NA", ""]]);
        let record = &table.records[0];
        assert_eq!(record.row, 1);
        assert_eq!(record.value(0), Some("12"));
        assert_eq!(record.value(1), None);
        assert_eq!(record.value(2), None);
        assert_eq!(record.value(9), None);
    }

    #[test]
    fn test_column_index_uses_first_accepted_name() {
        let table = RawTable::from_rows("t", &["county", "FIPS"], &[]);
        let accepted = vec!["FIPS".to_string(), "county".to_string()];
        assert_eq!(table.column_index(&accepted), Some(1));
        assert_eq!(table.column_index(&["geoid".to_string()]), None);
    }

    #[test]
    fn test_flow_edge_requires_both_endpoints() {
        let record = NormalizedRecord::new(ScenarioYear::Y2017, "24003", Stage::FoodWaste, 5.0);
        assert!(record.flow_edge().is_none());

        let flow = record.with_flow("24003", "24005").with_commodity("corn");
        let edge = flow.flow_edge().unwrap();
        assert_eq!(edge.origin, "24003");
        assert_eq!(edge.dest, "24005");
        assert_eq!(edge.commodity.as_deref(), Some("corn"));
        assert_eq!(edge.stage, Stage::FoodWaste);
    }

    #[test]
    fn test_record_kind() {
        let loss = NormalizedRecord::new(ScenarioYear::Y2030, "24003", Stage::FeedWaste, 1.0);
        assert_eq!(loss.kind(), RecordKind::Loss);
        assert!(loss.is_loss());

        let flow = loss.clone().with_flow("24003", "24005");
        assert_eq!(flow.kind(), RecordKind::Flow);

        let trade = loss.with_trade(TradeDirection::Import);
        assert_eq!(trade.kind(), RecordKind::Trade);
        assert!(!trade.is_loss());
        assert!(trade.flow_edge().is_none());

        assert_eq!(" Trade".parse::<RecordKind>().unwrap(), RecordKind::Trade);
        assert!(matches!(
            "edge".parse::<RecordKind>(),
            Err(InvalidFilterError::UnknownKind { .. })
        ));
    }

    #[test]
    fn test_production_measure_parsing_and_units() {
        assert_eq!("area".parse::<ProductionMeasure>().unwrap(), ProductionMeasure::HarvestedArea);
        assert_eq!("Inventory".parse::<ProductionMeasure>().unwrap(), ProductionMeasure::Inventory);
        assert!("yield".parse::<ProductionMeasure>().is_err());

        assert!(ProductionMeasure::HarvestedArea.accepts_unit("Acres"));
        assert!(!ProductionMeasure::HarvestedArea.accepts_unit("head"));
        assert!(ProductionMeasure::Inventory.accepts_unit("head"));
    }

    #[test]
    fn test_record_without_trade_field_deserializes() {
        let json = r#"{"year":2017,"county_id":"24003","county_name":null,"stage":"food_waste",
            "commodity":null,"nitrogen_kg":2.0,"origin_county":null,"dest_county":null,"cluster_label":null}"#;
        let record: NormalizedRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.trade, None);
        assert_eq!(record.stage, Stage::FoodWaste);
    }

    #[test]
    fn test_year_serde_round_trip_through_number() {
        let json = serde_json::to_string(&ScenarioYear::Y2030).unwrap();
        assert_eq!(json, "2030");
        assert!(serde_json::from_str::<ScenarioYear>("1999").is_err());
    }
}
