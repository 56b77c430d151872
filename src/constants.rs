//! Application constants for the nitrogen scenario pipeline
//!
//! Default values and mappings used to build the default configuration.
//! Every table here is only a starting point: `PipelineConfig` carries the
//! values actually used, and can be replaced from a JSON file.

// =============================================================================
// Unit Conversion
// =============================================================================

/// Kilograms per avoirdupois pound
pub const KG_PER_POUND: f64 = 0.453_592_37;

/// Kilograms per US short ton
pub const KG_PER_SHORT_TON: f64 = 907.184_74;

/// Conversion factors to kilograms, keyed by lowercase unit name
pub const DEFAULT_UNIT_FACTORS: &[(&str, f64)] = &[
    ("kg", 1.0),
    ("kgs", 1.0),
    ("kilogram", 1.0),
    ("kilograms", 1.0),
    ("kg n", 1.0),
    ("g", 0.001),
    ("gram", 0.001),
    ("grams", 0.001),
    ("lb", KG_PER_POUND),
    ("lbs", KG_PER_POUND),
    ("pound", KG_PER_POUND),
    ("pounds", KG_PER_POUND),
    ("t", 1_000.0),
    ("tonne", 1_000.0),
    ("tonnes", 1_000.0),
    ("metric ton", 1_000.0),
    ("metric tons", 1_000.0),
    ("ton", KG_PER_SHORT_TON),
    ("tons", KG_PER_SHORT_TON),
    ("short ton", KG_PER_SHORT_TON),
    ("short tons", KG_PER_SHORT_TON),
    ("kt", 1_000_000.0),
    ("kilotonne", 1_000_000.0),
    ("kilotonnes", 1_000_000.0),
];

/// Divisor turning kilograms into kilotonnes for summary tables
pub const KG_PER_KILOTONNE: f64 = 1_000_000.0;

// =============================================================================
// Source Files
// =============================================================================

/// Crop-side nitrogen losses (stages 1 and 2), one row per county and commodity
pub const CROP_PROCESSING_FILE: &str = "crop_processing_nitrogen*.csv";

/// Animal-side nitrogen losses (stages 3 to 7), one row per county and commodity
pub const ANIMAL_STAGE_FILE: &str = "animal_stage_nitrogen*.csv";

/// Optional long-format county-to-county flow table
pub const FLOW_FILE: &str = "nitrogen_flows*.csv";

/// Optional harvested area per crop commodity
pub const HARVESTED_AREA_FILE: &str = "harvested_area_by_commodity*.csv";

/// Optional livestock inventory per animal commodity
pub const INVENTORY_FILE: &str = "inventory_by_commodity*.csv";

/// Default county reference file name inside the data root
pub const COUNTY_REFERENCE_FILE: &str = "counties.csv";

/// Directory name under the user data dir used when no data root is given
pub const DATA_DIR_NAME: &str = "nitrogen-scenarios";

// =============================================================================
// Column Names
// =============================================================================

/// Accepted header names for the county identifier
pub const COUNTY_ID_COLUMNS: &[&str] = &["FIPS", "fips", "county_id", "geoid", "county"];

/// Accepted header names for the county display name
pub const COUNTY_NAME_COLUMNS: &[&str] = &["county", "county_name", "name"];

/// Accepted header names for the commodity tag
pub const COMMODITY_COLUMNS: &[&str] = &["commodity", "Commodity", "waste_category"];

/// Accepted header names for the cluster label produced by offline modeling
pub const CLUSTER_COLUMNS: &[&str] = &["cluster", "cluster_label", "kmeans_cluster"];

/// Accepted header names for harvested area values
pub const HARVESTED_AREA_COLUMNS: &[&str] = &["Total Harvested Area (Acre)", "harvested_area", "harvested_area_acres"];

/// Accepted header names for livestock inventory values
pub const INVENTORY_COLUMNS: &[&str] = &["Total Inventory (head)", "inventory", "inventory_head"];

/// Prefixes of the within-county trade columns; older files say `selfloop`
pub const WITHIN_COUNTY_PREFIXES: &[&str] = &["within_county", "selfloop"];

/// Trade measure suffix of crops leaving processing
pub const CROP_TRADE_MEASURE: &str = "crop_processing_nitrogen";

/// Trade measure suffix of live animals
pub const ANIMAL_TRADE_MEASURE: &str = "animal_nitrogen";

/// Trade measure suffix of meat and other animal products
pub const MEAT_TRADE_MEASURE: &str = "meat_nitrogen";

/// Values treated as an empty cell
pub const NULL_MARKERS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL", "-"];

/// Width of a county FIPS code (two state digits plus three county digits)
pub const FIPS_WIDTH: usize = 5;

// =============================================================================
// Loading
// =============================================================================

/// Default share of rejected rows above which a whole load fails
pub const DEFAULT_MAX_REJECTION_RATE: f64 = 0.5;
