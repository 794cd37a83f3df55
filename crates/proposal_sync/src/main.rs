use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use proposal_sync_core::config::{DEFAULT_CONFIG_FILENAME, SyncConfig, load_config};
use proposal_sync_core::sync::{SyncOptions, inspect_upstream, sync_proposals};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "proposal-sync",
    version,
    about = "Sync the proposal dataset with the upstream stage table"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved configuration")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Rebuild the dataset from the upstream table")]
    Sync(SyncArgs),
    #[command(about = "Print the rows of the upstream table without resolving them")]
    Inspect,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, value_name = "PATH", help = "Dataset file to rewrite")]
    output: Option<PathBuf>,
    #[arg(long, help = "Show the resulting diff instead of writing")]
    dry_run: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    let result = match cli.command {
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::Inspect) => run_inspect(&runtime),
        None => print_help(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let config = resolve_config(runtime)?;
    let mut options = SyncOptions::from_config(&config);
    if let Some(output) = args.output {
        options.output_path = output;
    }
    options.dry_run = args.dry_run;

    let report = sync_proposals(&options, &config)?;

    println!("proposal sync");
    println!("output_path: {}", normalize_path(&report.output_path));
    println!("table_rows: {}", report.table_rows);
    println!("records: {}", report.records);
    println!("changed: {}", format_flag(report.changed));
    println!("written: {}", format_flag(report.written));
    println!("request_count: {}", report.request_count);
    if report.duplicate_ids.is_empty() {
        println!("duplicates: <none>");
    } else {
        for id in &report.duplicate_ids {
            println!("duplicates.id: {id}");
        }
    }
    if let Some(diff) = &report.diff {
        if diff.is_empty() {
            println!("diff: <none>");
        } else {
            println!("\n{diff}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", config.diagnostics());
    }
    Ok(())
}

fn run_inspect(runtime: &RuntimeOptions) -> Result<()> {
    let config = resolve_config(runtime)?;
    let rows = inspect_upstream(&config)?;

    println!("upstream inspect");
    println!("rows.count: {}", rows.len());
    for row in &rows {
        println!(
            "row: {} | {} | {}",
            row.label.as_deref().unwrap_or("<no label>"),
            row.title,
            if row.last_presented.is_empty() {
                "<never>"
            } else {
                row.last_presented.as_str()
            }
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", config.diagnostics());
    }
    Ok(())
}

fn print_help() -> Result<()> {
    let mut command = Cli::command();
    command.print_help()?;
    println!();
    Ok(())
}

fn resolve_config(runtime: &RuntimeOptions) -> Result<SyncConfig> {
    dotenvy::dotenv().ok();
    let path = runtime
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    load_config(&path)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
