//! Command implementations for the nitrogen-scenarios CLI
//!
//! Each command loads the data root into a fresh store, runs its queries
//! through [`ScenarioQuery`], and prints colored tables or JSON.

use crate::aggregator::{AggregateView, KeyValue, StageSummary};
use crate::cli::data_discovery::describe_year_dir;
use crate::cli::{
    AggregateArgs, Args, Commands, ExportArgs, ExportFormat, FilterArgs, OutputFormat,
    ProductionArgs, SummaryArgs, TradeArgs, ValidateArgs,
};
use crate::config::PipelineConfig;
use crate::constants::KG_PER_KILOTONNE;
use crate::loader::{LoadSummary, ScenarioLoader};
use crate::production::ProductionSummary;
use crate::query::{FilterParams, ScenarioQuery};
use crate::reader::discover_year_dirs;
use crate::trade::TradeBreakdown;
use anyhow::{Context, Result};
use colored::*;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Run the parsed command
pub async fn run(args: Args) -> Result<()> {
    setup_logging(&args);
    debug!("Command line arguments: {:?}", args);

    let config = load_configuration(&args)?;

    if let Commands::Config = args.command {
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }

    let (query, summary) = open_query(&args, config).await?;

    match &args.command {
        Commands::Summary(summary_args) => run_summary(&query, summary_args),
        Commands::Aggregate(aggregate_args) => run_aggregate(&query, aggregate_args),
        Commands::Trade(trade_args) => run_trade(&query, trade_args),
        Commands::Production(production_args) => run_production(&query, production_args),
        Commands::Export(export_args) => run_export(&query, export_args),
        Commands::Validate(validate_args) => run_validate(&args, &query, &summary, validate_args),
        Commands::Config => Ok(()),
    }
}

/// Resolves when `signal` fires
///
/// If the signal handler cannot be installed the command keeps running
/// without interrupt support: this future then never resolves.
pub async fn interrupted<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        eprintln!(
            "{} CTRL+C handler unavailable, continuing without it: {}",
            "Warning:".bright_yellow().bold(),
            e
        );
        std::future::pending::<()>().await;
    }
}

/// Set up structured logging on stderr
fn setup_logging(args: &Args) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nitrogen_scenarios={}", args.log_level())));

    // A second initialization (e.g. from tests) is not an error worth failing on
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_timer(fmt::time::uptime())
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn load_configuration(args: &Args) -> Result<PipelineConfig> {
    match &args.config {
        Some(path) => {
            info!("Using config file: {}", path.display());
            PipelineConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))
        }
        None => Ok(PipelineConfig::default()),
    }
}

async fn open_query(args: &Args, config: PipelineConfig) -> Result<(ScenarioQuery, LoadSummary)> {
    let root = args.resolve_data_root()?;
    let mut loader = ScenarioLoader::new(&root, Arc::new(config)).with_progress(!args.quiet);
    if let Some(clusters) = &args.clusters {
        loader = loader.with_cluster_labels(clusters.clone());
    }

    let (store, summary) = loader
        .open()
        .await
        .with_context(|| format!("Failed to load scenario data from {}", root.display()))?;

    for (year, error) in &summary.failures {
        eprintln!(
            "{} {} could not be loaded: {}",
            "Warning:".bright_yellow().bold(),
            year,
            error
        );
    }

    Ok((ScenarioQuery::new(store), summary))
}

fn filter_params(filter: &FilterArgs) -> FilterParams {
    FilterParams {
        stage: filter.stage.clone(),
        commodity: filter.commodity.clone(),
        county: filter.county.clone(),
        cluster: filter.cluster.clone(),
        kind: filter.kind.clone(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_summary(query: &ScenarioQuery, args: &SummaryArgs) -> Result<()> {
    let years: Vec<u16> = if args.years.is_empty() {
        query
            .store()
            .loaded_years()
            .into_iter()
            .map(|year| year.as_u16())
            .collect()
    } else {
        args.years.clone()
    };

    let summaries = years
        .iter()
        .map(|year| query.stage_summary(*year))
        .collect::<Result<Vec<StageSummary>, _>>()?;

    match args.format {
        OutputFormat::Json => print_json(&summaries),
        OutputFormat::Table => {
            for summary in &summaries {
                print_stage_summary(summary);
            }
            Ok(())
        }
    }
}

fn print_stage_summary(summary: &StageSummary) {
    println!();
    println!(
        "{}",
        format!("Nitrogen loss by stage, {}", summary.year)
            .bright_green()
            .bold()
    );
    if summary.stages.is_empty() {
        println!("  {}", "no data loaded".bright_black());
        return;
    }

    for (index, loss) in summary.stages.iter().enumerate() {
        println!(
            "  {}. {:<38} {:>12.2} kt",
            (index + 1).to_string().bright_yellow(),
            loss.label.bright_cyan(),
            loss.kilotonnes()
        );
    }
    println!(
        "     {:<38} {:>12.2} kt",
        "Total".bold(),
        summary.total_kilotonnes()
    );
}

fn run_aggregate(query: &ScenarioQuery, args: &AggregateArgs) -> Result<()> {
    let params = filter_params(&args.filter);

    if args.compare {
        let comparison = query.compare(&args.group_by, &params)?;
        return match args.format {
            OutputFormat::Json => print_json(&comparison),
            OutputFormat::Table => {
                for year in &comparison {
                    if year.loaded {
                        print_view(&year.view, args.limit);
                    } else {
                        println!("\n{} {}", year.year.to_string().bold(), "not loaded".bright_black());
                    }
                }
                Ok(())
            }
        };
    }

    let view = query.aggregate(args.year, &args.group_by, &params)?;
    match args.format {
        OutputFormat::Json => print_json(&view),
        OutputFormat::Table => {
            print_view(&view, args.limit);
            Ok(())
        }
    }
}

fn print_view(view: &AggregateView, limit: usize) {
    let dimensions: Vec<&str> = view.group_by.iter().map(|d| d.as_str()).collect();
    println!();
    println!(
        "{} {} {}",
        view.year.to_string().bright_green().bold(),
        "grouped by".bright_green(),
        if dimensions.is_empty() {
            "(total)".to_string()
        } else {
            dimensions.join(", ")
        }
        .bright_cyan()
    );

    if view.is_empty() {
        println!("  {}", "no matching records".bright_black());
        return;
    }

    for row in view.rows.iter().take(limit) {
        let key: Vec<&str> = row
            .key
            .iter()
            .map(|part| KeyValue::as_text(part).unwrap_or("-"))
            .collect();
        println!(
            "  {:<48} {:>16.1} kg {:>8}",
            key.join(" / "),
            row.nitrogen_kg,
            format!("({})", row.record_count).bright_black()
        );
    }
    if view.rows.len() > limit {
        println!(
            "  {}",
            format!("... {} more rows", view.rows.len() - limit).bright_black()
        );
    }
    println!(
        "  {:<48} {:>16.1} kg ({:.3} kt)",
        "Total".bold(),
        view.total_kg,
        view.total_kg / KG_PER_KILOTONNE
    );
}

fn run_trade(query: &ScenarioQuery, args: &TradeArgs) -> Result<()> {
    let breakdown = query.trade_breakdown(args.year, &args.county, args.stage.as_deref())?;
    match args.format {
        OutputFormat::Json => print_json(&breakdown),
        OutputFormat::Table => {
            print_trade(query, args.year, &breakdown);
            Ok(())
        }
    }
}

fn print_trade(query: &ScenarioQuery, year: u16, breakdown: &TradeBreakdown) {
    let name = query
        .store()
        .counties()
        .name_of(&breakdown.county_id)
        .unwrap_or("unknown county");
    println!();
    println!(
        "{} {} ({}), {}",
        "Nitrogen trade of".bright_green().bold(),
        name.bright_cyan(),
        breakdown.county_id,
        year
    );

    if breakdown.is_empty() {
        println!("  {}", "no trade recorded for this county".bright_black());
        return;
    }

    println!(
        "  {:<24} {:>14} {:>14} {:>14}",
        "commodity".bold(),
        "import kt".bold(),
        "export kt".bold(),
        "within kt".bold()
    );
    for trade in &breakdown.commodities {
        println!(
            "  {:<24} {:>14.4} {:>14.4} {:>14.4}",
            trade.commodity.as_deref().unwrap_or("-"),
            trade.import_kg / KG_PER_KILOTONNE,
            trade.export_kg / KG_PER_KILOTONNE,
            trade.within_county_kg / KG_PER_KILOTONNE
        );
    }
}

fn run_production(query: &ScenarioQuery, args: &ProductionArgs) -> Result<()> {
    let summary = query.production_totals(args.year, &args.measure)?;

    if let Some(output) = &args.output {
        summary
            .write_csv(output)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        info!("Wrote {} commodities to {}", summary.commodities.len(), output.display());
    }

    match args.format {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Table => {
            print_production(&summary);
            Ok(())
        }
    }
}

fn print_production(summary: &ProductionSummary) {
    println!();
    println!(
        "{}",
        format!("{} by commodity, {}", summary.measure.label(), summary.year)
            .bright_green()
            .bold()
    );
    if summary.is_empty() {
        println!("  {}", "no production table loaded".bright_black());
        return;
    }

    let unit = summary.measure.unit();
    for row in &summary.commodities {
        println!(
            "  {:<28} {:>16.1} {:<6} {:>6.1}%",
            row.commodity.bright_cyan(),
            row.value,
            unit,
            row.share * 100.0
        );
    }
    println!("  {:<28} {:>16.1} {}", "Total".bold(), summary.total, unit);
}

fn run_export(query: &ScenarioQuery, args: &ExportArgs) -> Result<()> {
    let view = query.aggregate(args.year, &args.group_by, &filter_params(&args.filter))?;

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    match args.resolved_format() {
        ExportFormat::Csv => view.write_csv(&args.output)?,
        ExportFormat::Parquet => view.write_parquet(&args.output)?,
    }

    println!(
        "{} {} rows to {}",
        "Exported".bright_green().bold(),
        view.rows.len(),
        args.output.display().to_string().bright_cyan()
    );
    Ok(())
}

fn run_validate(
    args: &Args,
    query: &ScenarioQuery,
    summary: &LoadSummary,
    validate_args: &ValidateArgs,
) -> Result<()> {
    let root = args.resolve_data_root()?;
    let store = query.store();

    println!("{}", "Scenario data validation".bright_green().bold());
    println!(
        "  {} {} counties",
        "Reference set:".bright_cyan(),
        store.counties().len()
    );

    for (year, dir) in discover_year_dirs(&root, store.config())? {
        println!(
            "  {} {} {}",
            year.to_string().bold(),
            dir.display(),
            format!("({})", describe_year_dir(&dir)?).bright_black()
        );
    }

    for report in &summary.reports {
        println!();
        println!(
            "{} {} records and {} production totals from {} rows, {} rows rejected ({:.1}%, {} rejections)",
            report.year.to_string().bright_green().bold(),
            report.records,
            report.production_totals,
            report.rows_read,
            report.rows_rejected,
            report.rejection_rate * 100.0,
            report.rejected_rows.len()
        );
        for rejection in report.rejected_rows.iter().take(validate_args.show_rejections) {
            println!(
                "    {} {} row {}: {}",
                "-".bright_yellow(),
                rejection.source,
                rejection.row,
                rejection.reason
            );
        }
        if report.rejected_rows.len() > validate_args.show_rejections {
            println!(
                "    {}",
                format!(
                    "... {} more",
                    report.rejected_rows.len() - validate_args.show_rejections
                )
                .bright_black()
            );
        }
    }

    for (year, error) in &summary.failures {
        println!();
        println!("{} {}", year.to_string().bright_red().bold(), error);
    }

    if !summary.is_complete() {
        anyhow::bail!("{} scenario years failed to load", summary.failures.len());
    }

    println!();
    println!(
        "{} {} years, {} records in {:.2}s",
        "Valid:".bright_green().bold(),
        summary.reports.len(),
        summary.total_records(),
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}
