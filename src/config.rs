//! Configuration management and validation.
//!
//! Provides the pipeline configuration: supported scenario years, the unit
//! conversion table, the stage taxonomy, the per-source schema table that
//! maps heterogeneous dataset headers onto the canonical record, and the
//! optional per-commodity production tables.

use crate::aggregator::Dimension;
use crate::constants::{
    ANIMAL_STAGE_FILE, ANIMAL_TRADE_MEASURE, CLUSTER_COLUMNS, COMMODITY_COLUMNS,
    COUNTY_ID_COLUMNS, COUNTY_NAME_COLUMNS, CROP_PROCESSING_FILE, CROP_TRADE_MEASURE,
    DEFAULT_MAX_REJECTION_RATE, DEFAULT_UNIT_FACTORS, FLOW_FILE, HARVESTED_AREA_COLUMNS,
    HARVESTED_AREA_FILE, INVENTORY_COLUMNS, INVENTORY_FILE, MEAT_TRADE_MEASURE,
    WITHIN_COUNTY_PREFIXES,
};
use crate::error::{NitrogenError, Result};
use crate::models::{ProductionMeasure, ScenarioYear, Stage, TradeDirection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Conversion factors from source units to kilograms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitTable {
    pub factors: BTreeMap<String, f64>,
}

impl UnitTable {
    pub fn empty() -> Self {
        Self {
            factors: BTreeMap::new(),
        }
    }

    /// Add or replace a unit
    pub fn with_unit(mut self, unit: &str, factor_to_kg: f64) -> Self {
        self.factors.insert(unit_key(unit), factor_to_kg);
        self
    }

    /// Factor to kilograms for a unit name, case and spacing insensitive
    pub fn factor(&self, unit: &str) -> Option<f64> {
        self.factors.get(&unit_key(unit)).copied()
    }

    pub fn to_kg(&self, value: f64, unit: &str) -> Option<f64> {
        self.factor(unit).map(|factor| value * factor)
    }
}

impl Default for UnitTable {
    fn default() -> Self {
        DEFAULT_UNIT_FACTORS
            .iter()
            .fold(Self::empty(), |table, (unit, factor)| {
                table.with_unit(unit, *factor)
            })
    }
}

fn unit_key(unit: &str) -> String {
    unit.trim()
        .trim_end_matches('.')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Mapping from source stage tags to the canonical stage enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTaxonomy {
    pub aliases: BTreeMap<String, Stage>,
}

impl StageTaxonomy {
    pub fn empty() -> Self {
        Self {
            aliases: BTreeMap::new(),
        }
    }

    pub fn with_alias(mut self, tag: &str, stage: Stage) -> Self {
        self.aliases.insert(stage_key(tag), stage);
        self
    }

    pub fn resolve(&self, tag: &str) -> Option<Stage> {
        self.aliases.get(&stage_key(tag)).copied()
    }
}

impl Default for StageTaxonomy {
    /// Canonical names, legacy `nitrogen_lossN` columns, and display labels
    fn default() -> Self {
        Stage::ALL.into_iter().fold(Self::empty(), |taxonomy, stage| {
            taxonomy
                .with_alias(stage.as_str(), stage)
                .with_alias(&stage.legacy_column(), stage)
                .with_alias(stage.label(), stage)
        })
    }
}

fn stage_key(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// A measure column of a wide source: one column per stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureColumn {
    /// Accepted header names, first present wins
    pub columns: Vec<String>,
    pub stage: Stage,
    /// Unit applied when the cell carries none
    pub unit: Option<String>,
    /// Cells hold a county trade total in this direction instead of a loss
    #[serde(default)]
    pub trade: Option<TradeDirection>,
    /// A missing optional column is skipped instead of failing the dataset
    #[serde(default)]
    pub optional: bool,
}

impl MeasureColumn {
    pub fn loss(stage: Stage) -> Self {
        Self {
            columns: vec![stage.legacy_column(), stage.as_str().to_string()],
            stage,
            unit: Some("kg".to_string()),
            trade: None,
            optional: false,
        }
    }

    /// Optional trade column such as `import_meat_nitrogen`
    pub fn trade(stage: Stage, direction: TradeDirection, measure: &str) -> Self {
        let columns = match direction {
            TradeDirection::Import => vec![format!("import_{}", measure)],
            TradeDirection::Export => vec![format!("export_{}", measure)],
            TradeDirection::WithinCounty => WITHIN_COUNTY_PREFIXES
                .iter()
                .map(|prefix| format!("{}_{}", prefix, measure))
                .collect(),
        };

        Self {
            columns,
            stage,
            unit: Some("kg".to_string()),
            trade: Some(direction),
            optional: true,
        }
    }

    /// Field name reported when a required column is missing
    pub fn field_name(&self) -> String {
        match self.trade {
            Some(direction) => format!("{} {}", self.stage.as_str(), direction.as_str()),
            None => self.stage.as_str().to_string(),
        }
    }
}

/// How stage and quantity are laid out in a source table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLayout {
    /// One row per county (and commodity) with one column per stage
    Wide { measures: Vec<MeasureColumn> },
    /// One row per observation with a stage tag and a quantity
    Long {
        stage_columns: Vec<String>,
        quantity_columns: Vec<String>,
        #[serde(default)]
        unit_columns: Vec<String>,
        #[serde(default)]
        origin_columns: Vec<String>,
        #[serde(default)]
        dest_columns: Vec<String>,
        #[serde(default)]
        default_unit: Option<String>,
    },
}

/// Schema table entry describing one source dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSchema {
    pub name: String,
    /// Glob pattern of the file inside a year directory
    pub file_pattern: String,
    /// Whether a year directory must contain this source
    pub required: bool,
    pub county_columns: Vec<String>,
    #[serde(default)]
    pub county_name_columns: Vec<String>,
    #[serde(default)]
    pub commodity_columns: Vec<String>,
    #[serde(default)]
    pub cluster_columns: Vec<String>,
    pub layout: SourceLayout,
}

impl SourceSchema {
    /// Long-format source with the default county, commodity, and cluster headers
    pub fn long(name: &str, file_pattern: &str, stage_column: &str, quantity_column: &str) -> Self {
        Self {
            name: name.to_string(),
            file_pattern: file_pattern.to_string(),
            required: false,
            county_columns: strings(COUNTY_ID_COLUMNS),
            county_name_columns: strings(COUNTY_NAME_COLUMNS),
            commodity_columns: strings(COMMODITY_COLUMNS),
            cluster_columns: strings(CLUSTER_COLUMNS),
            layout: SourceLayout::Long {
                stage_columns: vec![stage_column.to_string()],
                quantity_columns: vec![quantity_column.to_string()],
                unit_columns: vec!["unit".to_string()],
                origin_columns: Vec::new(),
                dest_columns: Vec::new(),
                default_unit: None,
            },
        }
    }

    /// Wide-format source measured in kilograms, one legacy loss column per stage
    pub fn wide(name: &str, file_pattern: &str, stages: &[Stage]) -> Self {
        let measures = stages.iter().copied().map(MeasureColumn::loss).collect();

        Self {
            name: name.to_string(),
            file_pattern: file_pattern.to_string(),
            required: true,
            county_columns: strings(COUNTY_ID_COLUMNS),
            county_name_columns: strings(COUNTY_NAME_COLUMNS),
            commodity_columns: strings(COMMODITY_COLUMNS),
            cluster_columns: strings(CLUSTER_COLUMNS),
            layout: SourceLayout::Wide { measures },
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Declare origin and destination columns, turning rows into flow edges
    pub fn with_flow_columns(mut self, origin: &[&str], dest: &[&str]) -> Self {
        if let SourceLayout::Long {
            origin_columns,
            dest_columns,
            ..
        } = &mut self.layout
        {
            *origin_columns = strings(origin);
            *dest_columns = strings(dest);
        }
        self
    }

    /// Add optional import, export and within-county columns for `measure`
    ///
    /// Trade cells are attributed to `stage` and kept apart from losses.
    pub fn with_trade_columns(mut self, stage: Stage, measure: &str) -> Self {
        if let SourceLayout::Wide { measures } = &mut self.layout {
            for direction in [TradeDirection::Import, TradeDirection::Export, TradeDirection::WithinCounty] {
                measures.push(MeasureColumn::trade(stage, direction, measure));
            }
        }
        self
    }

    pub fn with_default_unit(mut self, unit: &str) -> Self {
        match &mut self.layout {
            SourceLayout::Long { default_unit, .. } => *default_unit = Some(unit.to_string()),
            SourceLayout::Wide { measures } => {
                for measure in measures {
                    measure.unit = Some(unit.to_string());
                }
            }
        }
        self
    }
}

/// Per-commodity production table, one value column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionSource {
    pub name: String,
    pub file_pattern: String,
    pub measure: ProductionMeasure,
    pub commodity_columns: Vec<String>,
    pub value_columns: Vec<String>,
}

impl ProductionSource {
    pub fn new(name: &str, file_pattern: &str, measure: ProductionMeasure, value_columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            file_pattern: file_pattern.to_string(),
            measure,
            commodity_columns: strings(COMMODITY_COLUMNS),
            value_columns: strings(value_columns),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Global configuration for the scenario pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub supported_years: Vec<ScenarioYear>,

    pub units: UnitTable,

    pub stages: StageTaxonomy,

    /// Schema table, one entry per source dataset
    pub sources: Vec<SourceSchema>,

    /// Optional per-commodity production tables
    #[serde(default)]
    pub production_sources: Vec<ProductionSource>,

    /// Groupings materialized when a year is loaded
    pub precomputed_groupings: Vec<Vec<Dimension>>,

    /// Share of rejected rows (0.0 to 1.0) above which a load fails
    pub max_rejection_rate: f64,

    /// CSV file holding the county reference set
    pub county_reference: Option<PathBuf>,

    /// Maximum number of year partitions loaded at once
    pub max_concurrent_loads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let sources = vec![
            SourceSchema::wide(
                "crop_processing",
                CROP_PROCESSING_FILE,
                &[Stage::CropProduction, Stage::CropProcessing],
            )
            .with_trade_columns(Stage::CropProcessing, CROP_TRADE_MEASURE),
            SourceSchema::wide(
                "animal_stage",
                ANIMAL_STAGE_FILE,
                &[
                    Stage::FeedWaste,
                    Stage::LivestockProcessing,
                    Stage::FoodProcessing,
                    Stage::FoodWaste,
                    Stage::HumanWaste,
                ],
            )
            // Live animals trade into slaughter, animal products into food processing
            .with_trade_columns(Stage::LivestockProcessing, ANIMAL_TRADE_MEASURE)
            .with_trade_columns(Stage::FoodProcessing, MEAT_TRADE_MEASURE),
            SourceSchema::long("flows", FLOW_FILE, "stage", "nitrogen_kg")
                .with_flow_columns(
                    &["origin", "origin_fips", "from_county"],
                    &["destination", "dest", "dest_fips", "to_county"],
                )
                .with_default_unit("kg"),
        ];

        let production_sources = vec![
            ProductionSource::new(
                "harvested_area",
                HARVESTED_AREA_FILE,
                ProductionMeasure::HarvestedArea,
                HARVESTED_AREA_COLUMNS,
            ),
            ProductionSource::new(
                "inventory",
                INVENTORY_FILE,
                ProductionMeasure::Inventory,
                INVENTORY_COLUMNS,
            ),
        ];

        Self {
            supported_years: ScenarioYear::ALL.to_vec(),
            units: UnitTable::default(),
            stages: StageTaxonomy::default(),
            sources,
            production_sources,
            precomputed_groupings: vec![
                vec![Dimension::Stage],
                vec![Dimension::County],
                vec![Dimension::Commodity],
                vec![Dimension::Stage, Dimension::Commodity],
                vec![Dimension::County, Dimension::Stage],
            ],
            max_rejection_rate: DEFAULT_MAX_REJECTION_RATE,
            county_reference: None,
            max_concurrent_loads: num_cpus::get().min(ScenarioYear::ALL.len()).max(1),
        }
    }
}

impl PipelineConfig {
    /// Read a configuration previously written with [`Self::to_json_pretty`]
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        debug!("Loaded pipeline configuration from {}", path.display());
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Restrict the supported scenario years
    pub fn with_supported_years(mut self, years: Vec<ScenarioYear>) -> Self {
        self.supported_years = years;
        self
    }

    pub fn with_unit(mut self, unit: &str, factor_to_kg: f64) -> Self {
        self.units = self.units.with_unit(unit, factor_to_kg);
        self
    }

    pub fn with_stage_alias(mut self, tag: &str, stage: Stage) -> Self {
        self.stages = self.stages.with_alias(tag, stage);
        self
    }

    /// Replace the schema table
    pub fn with_sources(mut self, sources: Vec<SourceSchema>) -> Self {
        self.sources = sources;
        self
    }

    /// Add a source, replacing any source with the same name
    pub fn with_source(mut self, source: SourceSchema) -> Self {
        self.sources.retain(|existing| existing.name != source.name);
        self.sources.push(source);
        self
    }

    /// Add a production table, replacing any with the same name
    pub fn with_production_source(mut self, source: ProductionSource) -> Self {
        self.production_sources.retain(|existing| existing.name != source.name);
        self.production_sources.push(source);
        self
    }

    pub fn with_precomputed_groupings(mut self, groupings: Vec<Vec<Dimension>>) -> Self {
        self.precomputed_groupings = groupings;
        self
    }

    pub fn with_max_rejection_rate(mut self, rate: f64) -> Self {
        self.max_rejection_rate = rate;
        self
    }

    pub fn with_county_reference(mut self, path: PathBuf) -> Self {
        self.county_reference = Some(path);
        self
    }

    pub fn with_max_concurrent_loads(mut self, loads: usize) -> Self {
        self.max_concurrent_loads = loads;
        self
    }

    pub fn is_supported(&self, year: ScenarioYear) -> bool {
        self.supported_years.contains(&year)
    }

    /// Get a source schema by name
    pub fn source(&self, name: &str) -> Option<&SourceSchema> {
        self.sources.iter().find(|source| source.name == name)
    }

    pub fn production_source(&self, name: &str) -> Option<&ProductionSource> {
        self.production_sources.iter().find(|source| source.name == name)
    }

    /// Check internal consistency of the configuration
    pub fn validate(&self) -> Result<()> {
        if self.supported_years.is_empty() {
            return Err(configuration("no supported years configured"));
        }

        if !(0.0..=1.0).contains(&self.max_rejection_rate) {
            return Err(configuration(format!(
                "max_rejection_rate must be within 0.0..=1.0, got {}",
                self.max_rejection_rate
            )));
        }

        if self.max_concurrent_loads == 0 {
            return Err(configuration("max_concurrent_loads must be at least 1"));
        }

        if let Some((unit, factor)) = self
            .units
            .factors
            .iter()
            .find(|(_, factor)| !factor.is_finite() || **factor <= 0.0)
        {
            return Err(configuration(format!(
                "unit '{}' has invalid factor {}",
                unit, factor
            )));
        }

        if self.sources.is_empty() {
            return Err(configuration("schema table has no sources"));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(configuration(format!(
                    "source '{}' is declared twice",
                    source.name
                )));
            }
            validate_source(source)?;
        }

        for source in &self.production_sources {
            if !names.insert(source.name.as_str()) {
                return Err(configuration(format!(
                    "source '{}' is declared twice",
                    source.name
                )));
            }
            if source.commodity_columns.is_empty() || source.value_columns.is_empty() {
                return Err(configuration(format!(
                    "production source '{}' needs commodity and value columns",
                    source.name
                )));
            }
        }

        Ok(())
    }
}

fn validate_source(source: &SourceSchema) -> Result<()> {
    match &source.layout {
        SourceLayout::Wide { measures } => {
            if source.county_columns.is_empty() {
                return Err(configuration(format!(
                    "source '{}' declares no county columns",
                    source.name
                )));
            }
            if measures.is_empty() || measures.iter().any(|m| m.columns.is_empty()) {
                return Err(configuration(format!(
                    "source '{}' has an empty measure column list",
                    source.name
                )));
            }
            if measures.iter().all(|m| m.optional) {
                return Err(configuration(format!(
                    "source '{}' has only optional measure columns",
                    source.name
                )));
            }
        }
        SourceLayout::Long {
            stage_columns,
            quantity_columns,
            origin_columns,
            dest_columns,
            ..
        } => {
            if stage_columns.is_empty() || quantity_columns.is_empty() {
                return Err(configuration(format!(
                    "source '{}' needs stage and quantity columns",
                    source.name
                )));
            }
            if origin_columns.is_empty() != dest_columns.is_empty() {
                return Err(configuration(format!(
                    "source '{}' declares only one side of its flow columns",
                    source.name
                )));
            }
            if source.county_columns.is_empty() && origin_columns.is_empty() {
                return Err(configuration(format!(
                    "source '{}' declares no county columns",
                    source.name
                )));
            }
        }
    }
    Ok(())
}

fn configuration(message: impl Into<String>) -> NitrogenError {
    NitrogenError::Configuration {
        message: message.into(),
    }
}
