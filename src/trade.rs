//! Trade of one county: reported import/export/within-county totals plus
//! flow edges classified relative to that county.

use crate::county_registry::canonical_county_id;
use crate::models::{FlowEdge, NormalizedRecord, Stage, TradeDirection};
use serde::Serialize;
use std::collections::BTreeMap;

/// Direction of an edge as seen from `reference`
///
/// Returns `None` when the edge neither starts nor ends at the reference
/// county; such edges take no part in that county's trade.
pub fn classify(edge: &FlowEdge, reference: &str) -> Option<TradeDirection> {
    let reference = canonical_county_id(reference);
    let from_reference = canonical_county_id(&edge.origin) == reference;
    let to_reference = canonical_county_id(&edge.dest) == reference;

    match (from_reference, to_reference) {
        (true, true) => Some(TradeDirection::WithinCounty),
        (true, false) => Some(TradeDirection::Export),
        (false, true) => Some(TradeDirection::Import),
        (false, false) => None,
    }
}

/// Traded nitrogen of one commodity
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommodityTrade {
    pub commodity: Option<String>,
    pub import_kg: f64,
    pub export_kg: f64,
    pub within_county_kg: f64,
}

impl CommodityTrade {
    fn add(&mut self, direction: TradeDirection, nitrogen_kg: f64) {
        match direction {
            TradeDirection::Import => self.import_kg += nitrogen_kg,
            TradeDirection::Export => self.export_kg += nitrogen_kg,
            TradeDirection::WithinCounty => self.within_county_kg += nitrogen_kg,
        }
    }

    /// Imports minus exports
    pub fn net_import_kg(&self) -> f64 {
        self.import_kg - self.export_kg
    }
}

/// Per-commodity trade of one county
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeBreakdown {
    pub county_id: String,
    pub stage: Option<Stage>,
    /// Sorted by commodity, edges without a commodity first
    pub commodities: Vec<CommodityTrade>,
}

impl TradeBreakdown {
    pub fn is_empty(&self) -> bool {
        self.commodities.is_empty()
    }

    pub fn commodity(&self, name: &str) -> Option<&CommodityTrade> {
        self.commodities
            .iter()
            .find(|trade| trade.commodity.as_deref() == Some(name))
    }

    pub fn total(&self, direction: TradeDirection) -> f64 {
        self.commodities
            .iter()
            .map(|trade| match direction {
                TradeDirection::Import => trade.import_kg,
                TradeDirection::Export => trade.export_kg,
                TradeDirection::WithinCounty => trade.within_county_kg,
            })
            .sum()
    }
}

/// Sum the trade of `county` per commodity
///
/// Trade records of the county count in their own direction; flow edges
/// count when classified against the county. Losses are ignored.
pub fn trade_breakdown<'r, I>(records: I, county: &str, stage: Option<Stage>) -> TradeBreakdown
where
    I: IntoIterator<Item = &'r NormalizedRecord>,
{
    let county_id = canonical_county_id(county);
    let mut commodities: BTreeMap<Option<String>, CommodityTrade> = BTreeMap::new();

    for record in records {
        if stage.is_some_and(|stage| record.stage != stage) {
            continue;
        }
        let direction = match (record.trade, record.flow_edge()) {
            (Some(direction), _) if canonical_county_id(&record.county_id) == county_id => direction,
            (None, Some(edge)) => match classify(&edge, &county_id) {
                Some(direction) => direction,
                None => continue,
            },
            _ => continue,
        };
        commodities
            .entry(record.commodity.clone())
            .or_insert_with(|| CommodityTrade {
                commodity: record.commodity.clone(),
                ..CommodityTrade::default()
            })
            .add(direction, record.nitrogen_kg);
    }

    TradeBreakdown {
        county_id,
        stage,
        commodities: commodities.into_values().collect(),
    }
}
