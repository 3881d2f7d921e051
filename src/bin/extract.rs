//! extract: the extraction CLI
//!
//! Lists formats, shows how queries resolve, renders step SQL and runs
//! extractions against a database.
//!
//! # Usage
//!
//! ```bash
//! # Show the SQL of the RDB station sheet
//! extract render RDB 1.3 HH
//!
//! # Run a COST extraction for one program and year
//! extract run COST 1.4 --trip-filter trips.json --database-url postgres://localhost/sumaris
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use extraction::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "extract")]
#[command(version)]
#[command(about = "Fishery data extraction engine", long_about = None)]
#[command(after_help = "EXAMPLES:
    extract formats
    extract resolve RJB 1.0 createStationTable
    extract render COST 1.4 HH --trip-filter trips.json
    extract where --columns id:INTEGER,sex:VARCHAR --filter filter.json
    extract run RDB 1.3 --preview TR --output json")]
struct Cli {
    /// Configuration file (default: ./extract.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database connection URL
    #[arg(long, global = true, env = "EXTRACT_DATABASE_URL")]
    database_url: Option<String>,

    /// Verbose output (debug logs, rendered SQL)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List the known formats
    Formats,
    /// Show which template a query name resolves to
    Resolve {
        format: String,
        version: String,
        query: String,
    },
    /// Render the SQL of one sheet without executing it
    Render {
        format: String,
        version: String,
        sheet: String,
        /// JSON trip filter
        #[arg(long)]
        trip_filter: Option<PathBuf>,
    },
    /// Render the WHERE clause of a filter for a table
    Where {
        /// Table columns, as name:TYPE pairs
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,
        /// JSON extraction filter
        #[arg(long)]
        filter: PathBuf,
        #[arg(long)]
        sheet: Option<String>,
        /// Table alias prefixed to column names
        #[arg(long)]
        alias: Option<String>,
    },
    /// Run an extraction
    Run {
        format: String,
        version: String,
        /// JSON extraction filter
        #[arg(long)]
        filter: Option<PathBuf>,
        /// JSON trip filter
        #[arg(long)]
        trip_filter: Option<PathBuf>,
        /// Stop as soon as this sheet is available
        #[arg(long)]
        preview: Option<String>,
        /// Keep the extraction tables
        #[arg(long)]
        keep_tables: bool,
        /// Rows shown per sheet
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = ExtractConfig::load(cli.config.as_deref())?;
    let registry = config.registry()?;
    registry
        .validate_templates(&config.loader())
        .context("Invalid templates")?;

    match cli.command {
        Commands::Formats => list_formats(&registry),
        Commands::Resolve {
            format,
            version,
            query,
        } => resolve(&registry, &FormatKey::new(format, version), &query)?,
        Commands::Render {
            format,
            version,
            sheet,
            trip_filter,
        } => {
            let mut planner = Planner::new(&registry, config.loader());
            if let Some(path) = trip_filter {
                planner = planner.with_trip_filter(read_json(&path)?);
            }
            let ctx = ExtractionContext::new(0);
            let compiled = planner.render_step(&ctx, &FormatKey::new(format, version), &sheet)?;
            println!("{}", "Generated SQL:".green().bold());
            println!("{}", compiled.sql.trim().white());
            if !compiled.hidden_columns.is_empty() {
                println!();
                println!("{} {}", "Hidden columns:".cyan(), compiled.hidden_columns.join(", "));
            }
            if compiled.has_distinct {
                println!("{}", "DISTINCT sheet".cyan());
            }
        }
        Commands::Where {
            columns,
            filter,
            sheet,
            alias,
        } => {
            let columns: Vec<ColumnMetadata> = columns.iter().map(|c| parse_column(c)).collect();
            let filter: ExtractionFilter = read_json(&filter)?;
            let clause = extraction::transpiler::where_clause(
                &columns,
                &filter,
                sheet.as_deref(),
                alias.as_deref(),
            )?;
            if clause.is_empty() {
                println!("{}", "(no applicable criteria)".dimmed());
            } else {
                println!("{}", clause.trim_start().white());
            }
        }
        Commands::Run {
            format,
            version,
            filter,
            trip_filter,
            preview,
            keep_tables,
            limit,
            output,
        } => {
            let url = cli
                .database_url
                .unwrap_or_else(|| config.database_url.clone());
            let mut filter: ExtractionFilter = match filter {
                Some(path) => read_json(&path)?,
                None => ExtractionFilter::new(),
            };
            if let Some(sheet) = preview {
                filter = filter.preview(sheet);
            }
            let trip_filter: TripFilter = match trip_filter {
                Some(path) => read_json(&path)?,
                None => TripFilter::default(),
            };
            let job = RunJob {
                url,
                max_connections: config.max_connections,
                format: FormatKey::new(format, version),
                filter,
                trip_filter,
                keep_tables: keep_tables || config.keep_tables,
                limit,
                output,
            };
            job.execute(&registry, config.loader()).await?;
        }
    }
    Ok(())
}

fn list_formats(registry: &FormatRegistry) {
    println!("{}", "Extraction formats".cyan().bold());
    println!();
    for key in registry.keys() {
        let Ok(format) = registry.format(key) else {
            continue;
        };
        let parent = format
            .chain
            .get(1)
            .map(|p| format!(" (extends {})", p))
            .unwrap_or_default();
        println!(
            "  {:16} {:6} {}{}",
            key.name.white().bold(),
            key.version.yellow(),
            format.sheet_names().join(",").cyan(),
            parent.dimmed()
        );
        if let Some(description) = &format.description {
            println!("  {:23} {}", "", description.dimmed());
        }
    }
}

fn resolve(registry: &FormatRegistry, key: &FormatKey, query: &str) -> Result<()> {
    let format = registry.format(key)?;
    let resolved = format.query(query)?;
    println!("{} {}", "Template:".green().bold(), resolved.path.white());
    println!("{} {}", "Declared by:".dimmed(), resolved.declared_by);
    let chain: Vec<String> = format.chain.iter().map(ToString::to_string).collect();
    println!("{} {}", "Chain:".dimmed(), chain.join(" → "));
    Ok(())
}

/// One `run` invocation. Acts as the cleanup collaborator: the tables of
/// the run are dropped afterwards, whatever the outcome, unless kept.
struct RunJob {
    url: String,
    max_connections: u32,
    format: FormatKey,
    filter: ExtractionFilter,
    trip_filter: TripFilter,
    keep_tables: bool,
    limit: usize,
    output: OutputFormat,
}

impl RunJob {
    async fn execute<L: TemplateLoader>(self, registry: &FormatRegistry, loader: L) -> Result<()> {
        let store = SqlStore::connect(&self.url, self.max_connections).await?;
        info!("Connected ({:?})", store.dialect());

        let cancel = CancelFlag::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current step");
                on_interrupt.cancel();
            }
        });

        let pipeline = Pipeline::new(&store, registry, loader)
            .with_trip_filter(self.trip_filter.clone())
            .with_cancel_flag(cancel);
        let mut ctx = ExtractionContext::now();
        let outcome = pipeline.run(&mut ctx, &self.filter, &self.format).await;

        let printed = match &outcome {
            Ok(()) => self.print(&store, &ctx).await,
            Err(_) => Ok(()),
        };

        if self.keep_tables {
            println!(
                "{} Kept tables: {}",
                "✓".green(),
                ctx.table_names().join(", ").cyan()
            );
        } else {
            for table in ctx.table_names().to_vec() {
                match store.drop_table(&table).await {
                    Ok(()) => ctx.forget_table(&table),
                    Err(e) => warn!("Could not drop {}: {}", table, e),
                }
            }
        }

        outcome?;
        printed
    }

    async fn print(&self, store: &SqlStore, ctx: &ExtractionContext) -> Result<()> {
        let mut rows = HashMap::new();
        for sheet in ctx.sheets() {
            rows.insert(sheet.sheet_name.clone(), store.read_sheet(sheet, self.limit).await?);
        }

        match self.output {
            OutputFormat::Json => {
                let document = serde_json::json!({ "context": ctx, "rows": rows });
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
            OutputFormat::Table => {
                print_steps(ctx);
                for sheet in ctx.sheets() {
                    println!();
                    println!(
                        "{} {} ({} rows)",
                        sheet.sheet_name.cyan().bold(),
                        sheet.table_name.dimmed(),
                        sheet.row_count
                    );
                    let empty = Vec::new();
                    let sheet_rows = rows.get(&sheet.sheet_name).unwrap_or(&empty);
                    print_rows(&sheet.visible_columns, sheet_rows);
                }
            }
        }
        Ok(())
    }
}

fn print_steps(ctx: &ExtractionContext) {
    println!(
        "{:6} {:12} {:>9} {:>9} {:>8}",
        "Sheet".white().bold(),
        "State".white().bold(),
        "Inserted".white().bold(),
        "Removed".white().bold(),
        "ms".white().bold()
    );
    println!("{}", "─".repeat(48).dimmed());
    for step in ctx.steps() {
        let state = match &step.state {
            StepState::Registered => "registered".green(),
            StepState::Skipped(reason) => format!("skipped ({})", reason).yellow(),
        };
        println!(
            "{:6} {:12} {:>9} {:>9} {:>8}",
            step.sheet_name, state, step.inserted, step.removed, step.elapsed_ms
        );
    }
}

fn print_rows(columns: &[String], rows: &[HashMap<String, serde_json::Value>]) {
    if rows.is_empty() {
        println!("{}", "(no rows)".dimmed());
        return;
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, col) in columns.iter().enumerate() {
            let len = row.get(col).map(val_to_string).unwrap_or_default().len();
            widths[i] = widths[i].max(len);
        }
    }

    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:width$}", c, width = *w))
        .collect();
    println!("{}", header.join(" │ ").white().bold());

    let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    println!("{}", sep.join("─┼─").dimmed());

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| {
                let val = row.get(c).map(val_to_string).unwrap_or_default();
                format!("{:width$}", val, width = *w)
            })
            .collect();
        println!("{}", cells.join(" │ "));
    }
}

fn val_to_string(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => val.to_string(),
    }
}

/// `name:TYPE`, or a bare name for a text column.
fn parse_column(spec: &str) -> ColumnMetadata {
    match spec.split_once(':') {
        Some((name, ty)) => ColumnMetadata::new(name.trim(), SqlType::from_name(ty)),
        None => ColumnMetadata::new(spec.trim(), SqlType::Text),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    if text.trim().is_empty() {
        bail!("{} is empty", path.display());
    }
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}
