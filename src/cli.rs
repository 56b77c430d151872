//! Command-line interface components.

use crate::constants::DATA_DIR_NAME;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser, Debug, Clone)]
#[command(name = "nitrogen-scenarios")]
#[command(about = "Compare county nitrogen losses across the 2017, 2030 and 2050 scenarios")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Data root holding one directory per scenario year and counties.csv
    #[arg(short, long, global = true, value_name = "PATH")]
    pub data_root: Option<PathBuf>,

    /// Pipeline configuration as JSON (see the `config` command)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// CSV of county cluster labels to attach to every record
    #[arg(long, global = true, value_name = "FILE")]
    pub clusters: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Nitrogen loss per supply-chain stage, one table per scenario year
    Summary(SummaryArgs),
    /// Grouped nitrogen sums for one year
    Aggregate(AggregateArgs),
    /// Imports, exports and within-county flows of one county by commodity
    Trade(TradeArgs),
    /// Harvested area or livestock inventory per commodity
    Production(ProductionArgs),
    /// Write a grouped view to CSV or Parquet
    Export(ExportArgs),
    /// Load every year and report rejected rows without querying
    Validate(ValidateArgs),
    /// Print the default pipeline configuration as JSON
    Config,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SummaryArgs {
    /// Scenario years to show (default: every loaded year)
    #[arg(short, long, value_delimiter = ',')]
    pub years: Vec<u16>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug, Clone)]
pub struct FilterArgs {
    /// Only this supply-chain stage (e.g. feed_waste)
    #[arg(long)]
    pub stage: Option<String>,

    #[arg(long)]
    pub commodity: Option<String>,

    /// County FIPS code
    #[arg(long)]
    pub county: Option<String>,

    #[arg(long)]
    pub cluster: Option<String>,

    /// Record kind: loss, flow or trade
    #[arg(long)]
    pub kind: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct AggregateArgs {
    #[arg(short, long)]
    pub year: u16,

    /// Comma-separated dimensions: stage, commodity, county, origin, destination, cluster, kind, direction
    #[arg(short, long, value_delimiter = ',', default_value = "stage")]
    pub group_by: Vec<String>,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Show the grouping for every scenario year side by side
    #[arg(long)]
    pub compare: bool,

    /// Maximum rows to print
    #[arg(long, default_value_t = 50)]
    pub limit: usize,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TradeArgs {
    #[arg(short, long)]
    pub year: u16,

    /// Reference county FIPS code
    #[arg(long)]
    pub county: String,

    #[arg(long)]
    pub stage: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ProductionArgs {
    #[arg(short, long)]
    pub year: u16,

    /// harvested_area or inventory
    #[arg(short, long, default_value = "harvested_area")]
    pub measure: String,

    /// Also write the per-commodity totals to this CSV file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExportArgs {
    #[arg(short, long)]
    pub year: u16,

    #[arg(short, long, value_delimiter = ',', default_value = "county,stage")]
    pub group_by: Vec<String>,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Output file; the extension picks the format unless --export-format is given
    #[arg(short, long)]
    pub output: PathBuf,

    #[arg(long, value_enum)]
    pub export_format: Option<ExportFormat>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Rejected rows to list per year
    #[arg(long, default_value_t = 10)]
    pub show_rejections: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Parquet,
}

impl ExportArgs {
    /// Explicit format, else from the output extension, else CSV
    pub fn resolved_format(&self) -> ExportFormat {
        if let Some(format) = self.export_format {
            return format;
        }
        match self.output.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("parquet") => ExportFormat::Parquet,
            _ => ExportFormat::Csv,
        }
    }
}

impl Args {
    /// Data root from the flag, else `<user data dir>/nitrogen-scenarios`
    pub fn resolve_data_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.data_root {
            return Ok(root.clone());
        }

        let data_dir = dirs::data_dir().context("Could not determine user data directory")?;
        let root = data_dir.join(DATA_DIR_NAME);
        if !root.exists() {
            anyhow::bail!(
                "No data root given and {} does not exist. Pass --data-root <PATH>.",
                root.display()
            );
        }
        Ok(root)
    }

    pub fn log_level(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }
}

/// Year directory discovery for reporting
pub mod data_discovery {
    use anyhow::{Context, Result};
    use std::path::Path;

    /// Number of CSV files and their total size under a year directory
    pub fn describe_year_dir(dir: &Path) -> Result<String> {
        let mut total_files = 0;
        let mut total_size = 0u64;

        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry.context("Failed to walk directory")?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "csv")
            {
                total_files += 1;
                if let Ok(metadata) = entry.metadata() {
                    total_size += metadata.len();
                }
            }
        }

        Ok(format!("{} files, ~{}", total_files, format_size(total_size)))
    }

    pub fn format_size(bytes: u64) -> String {
        if bytes > 1_000_000_000 {
            format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
        } else if bytes > 1_000_000 {
            format!("{:.1} MB", bytes as f64 / 1_000_000.0)
        } else if bytes > 1_000 {
            format!("{:.1} KB", bytes as f64 / 1_000.0)
        } else {
            format!("{} bytes", bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aggregate_command() {
        let args = Args::try_parse_from([
            "nitrogen-scenarios",
            "--data-root",
            "/data",
            "aggregate",
            "--year",
            "2030",
            "--group-by",
            "county,commodity",
            "--stage",
            "feed_waste",
        ])
        .unwrap();

        assert_eq!(args.data_root, Some(PathBuf::from("/data")));
        match args.command {
            Commands::Aggregate(aggregate) => {
                assert_eq!(aggregate.year, 2030);
                assert_eq!(aggregate.group_by, vec!["county", "commodity"]);
                assert_eq!(aggregate.filter.stage.as_deref(), Some("feed_waste"));
                assert_eq!(aggregate.format, OutputFormat::Table);
            }
            other => panic!("Expected aggregate, got {:?}", other),
        }
    }

    #[test]
    fn test_export_format_from_extension() {
        let args = Args::try_parse_from([
            "nitrogen-scenarios",
            "export",
            "--year",
            "2017",
            "--output",
            "out/losses.PARQUET",
        ])
        .unwrap();

        let Commands::Export(export) = args.command else {
            panic!("Expected export");
        };
        assert_eq!(export.resolved_format(), ExportFormat::Parquet);
        assert_eq!(export.group_by, vec!["county", "stage"]);

        let csv = ExportArgs {
            output: PathBuf::from("losses.txt"),
            ..export
        };
        assert_eq!(csv.resolved_format(), ExportFormat::Csv);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["nitrogen-scenarios", "summary", "-y", "2017,2050", "-v"]).unwrap();
        assert!(args.verbose);
        assert_eq!(args.log_level(), "debug");
        let Commands::Summary(summary) = args.command else {
            panic!("Expected summary");
        };
        assert_eq!(summary.years, vec![2017, 2050]);
    }

    #[test]
    fn test_parse_production_and_kind_filter() {
        let args = Args::try_parse_from([
            "nitrogen-scenarios",
            "production",
            "--year",
            "2050",
            "-m",
            "inventory",
        ])
        .unwrap();
        let Commands::Production(production) = args.command else {
            panic!("Expected production");
        };
        assert_eq!(production.year, 2050);
        assert_eq!(production.measure, "inventory");
        assert!(production.output.is_none());

        let args = Args::try_parse_from([
            "nitrogen-scenarios",
            "aggregate",
            "-y",
            "2017",
            "-g",
            "commodity,direction",
            "--kind",
            "trade",
        ])
        .unwrap();
        let Commands::Aggregate(aggregate) = args.command else {
            panic!("Expected aggregate");
        };
        assert_eq!(aggregate.filter.kind.as_deref(), Some("trade"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(data_discovery::format_size(512), "512 bytes");
        assert_eq!(data_discovery::format_size(2_500_000), "2.5 MB");
    }
}
