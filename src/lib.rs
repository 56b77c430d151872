//! Nitrogen Scenarios Library
//!
//! Loads county-level nitrogen loss datasets for the 2017, 2030 and 2050
//! scenarios and serves comparisons between them.
//!
//! This library provides tools for:
//! - Normalizing heterogeneous per-year CSV datasets into one canonical record
//! - Converting source units to kilograms through a configurable unit table
//! - Validating county identifiers against a fixed reference set
//! - Aggregating nitrogen by stage, commodity, county and flow endpoints
//! - Classifying county-to-county flows as imports, exports or local
//! - Summing harvested area and livestock inventory per commodity
//! - Year-partitioned storage with atomic reloads and concurrent readers

pub mod aggregator;
pub mod cli;
pub mod config;
pub mod constants;
pub mod county_registry;
pub mod enrichment;
pub mod error;
pub mod loader;
pub mod models;
pub mod normalizer;
pub mod production;
pub mod query;
pub mod reader;
pub mod store;
pub mod trade;

pub use aggregator::{AggregateView, Dimension};
pub use config::PipelineConfig;
pub use county_registry::CountyRegistry;
pub use error::{InvalidFilterError, NitrogenError, Result, SchemaError, UnknownCountyError};
pub use loader::ScenarioLoader;
pub use models::{
    FlowEdge, NormalizedRecord, ProductionMeasure, ProductionTotal, RawDataset, RecordKind,
    ScenarioYear, Stage, TradeDirection,
};
pub use query::{FilterParams, ScenarioQuery};
pub use store::{PartitionState, RecordFilter, ScenarioStore};
