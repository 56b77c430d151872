//! Production totals per commodity (harvested area, livestock inventory).
//!
//! Figures are summed per commodity in input order, like nitrogen
//! aggregates, and rows come out sorted by commodity name.

use crate::constants::{HARVESTED_AREA_COLUMNS, INVENTORY_COLUMNS};
use crate::models::{ProductionMeasure, ProductionTotal, ScenarioYear};
use polars::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommodityProduction {
    pub commodity: String,
    pub value: f64,
    /// Fraction of the measure's total, 0 when the total is 0
    pub share: f64,
}

/// One measure's production per commodity for a scenario year
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionSummary {
    pub year: ScenarioYear,
    pub measure: ProductionMeasure,
    pub commodities: Vec<CommodityProduction>,
    pub total: f64,
}

impl ProductionSummary {
    pub fn is_empty(&self) -> bool {
        self.commodities.is_empty()
    }

    pub fn commodity(&self, name: &str) -> Option<&CommodityProduction> {
        self.commodities.iter().find(|row| row.commodity == name)
    }

    /// Two-column table headed the way the source files head their values
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let header = match self.measure {
            ProductionMeasure::HarvestedArea => HARVESTED_AREA_COLUMNS[0],
            ProductionMeasure::Inventory => INVENTORY_COLUMNS[0],
        };
        let names: Vec<&str> = self.commodities.iter().map(|row| row.commodity.as_str()).collect();
        let values: Vec<f64> = self.commodities.iter().map(|row| row.value).collect();
        DataFrame::new(vec![
            Column::new("Commodity".into(), names),
            Column::new(header.into(), values),
        ])
    }

    pub fn write_csv(&self, path: &Path) -> crate::Result<()> {
        let mut df = self.to_dataframe()?;
        let mut file = File::create(path)?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
        debug!("Wrote {} {} rows to {}", df.height(), self.measure, path.display());
        Ok(())
    }
}

/// Sum `totals` of one measure per commodity
pub fn production_summary(
    year: ScenarioYear,
    totals: &[ProductionTotal],
    measure: ProductionMeasure,
) -> ProductionSummary {
    let mut sums: BTreeMap<&str, f64> = BTreeMap::new();
    for total in totals.iter().filter(|total| total.measure == measure && total.year == year) {
        *sums.entry(total.commodity.as_str()).or_insert(0.0) += total.value;
    }

    let total: f64 = sums.values().sum();
    let commodities = sums
        .into_iter()
        .map(|(commodity, value)| CommodityProduction {
            commodity: commodity.to_string(),
            value,
            share: if total > 0.0 { value / total } else { 0.0 },
        })
        .collect();

    ProductionSummary {
        year,
        measure,
        commodities,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn total(commodity: &str, measure: ProductionMeasure, value: f64) -> ProductionTotal {
        ProductionTotal {
            year: ScenarioYear::Y2017,
            commodity: commodity.to_string(),
            measure,
            value,
        }
    }

    fn sample() -> Vec<ProductionTotal> {
        vec![
            total("corn", ProductionMeasure::HarvestedArea, 300.0),
            total("wheat", ProductionMeasure::HarvestedArea, 100.0),
            total("corn", ProductionMeasure::HarvestedArea, 100.0),
            total("cattle", ProductionMeasure::Inventory, 40.0),
        ]
    }

    #[test]
    fn test_sums_per_commodity_with_shares() {
        let summary = production_summary(ScenarioYear::Y2017, &sample(), ProductionMeasure::HarvestedArea);
        assert_eq!(summary.total, 500.0);
        assert_eq!(summary.commodities.len(), 2);
        assert_eq!(summary.commodities[0].commodity, "corn");

        let corn = summary.commodity("corn").unwrap();
        assert_eq!(corn.value, 400.0);
        assert_eq!(corn.share, 0.8);
        assert!(summary.commodity("cattle").is_none());
    }

    #[test]
    fn test_empty_and_zero_totals() {
        let empty = production_summary(ScenarioYear::Y2030, &sample(), ProductionMeasure::Inventory);
        assert!(empty.is_empty());
        assert_eq!(empty.total, 0.0);

        let zero = vec![total("goats", ProductionMeasure::Inventory, 0.0)];
        let summary = production_summary(ScenarioYear::Y2017, &zero, ProductionMeasure::Inventory);
        assert_eq!(summary.commodity("goats").unwrap().share, 0.0);
    }

    #[test]
    fn test_write_csv_uses_source_headers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory_by_commodity.csv");
        production_summary(ScenarioYear::Y2017, &sample(), ProductionMeasure::Inventory)
            .write_csv(&path)
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("Commodity,Total Inventory (head)"));
        assert!(lines.next().unwrap().starts_with("cattle,40"));
        assert_eq!(lines.next(), None);
    }
}
