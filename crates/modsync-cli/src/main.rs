//! modsync - keep local modpacks in sync with a remote repository
//!
//! Scans the repository with a pool of connections, compares it against the local
//! game directory, removes files the packs no longer ship and downloads the rest
//! in parallel chunks.

mod display;
mod json_output;
mod progress;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use modsync_config::{Config, ConfigLoader};
use modsync_engine::CancelScopeStack;
use modsync_network::MirrorClientFactory;
use modsync_sync::{pluralize, DownloadProgress, SyncEngine, SyncOptions, SyncOutcome, SyncSettings};
use modsync_types::PathMapping;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// modsync - keep local modpacks in sync with a remote repository
#[derive(Parser)]
#[command(
    name = "modsync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Keep local modpacks in sync with a remote repository",
    long_about = "modsync scans a remote file repository, compares it with your local game directory,\n\
                  deletes files the packs no longer ship and downloads what is missing or changed."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Quiet mode - minimal output
    #[arg(short, long)]
    quiet: bool,

    /// Verbose mode - detailed output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the local packs in line with the repository
    Sync {
        /// Show what would be done without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Keep local files the repository does not have
        #[arg(long)]
        no_delete: bool,
        /// Delete without asking, however many files there are
        #[arg(short, long)]
        yes: bool,
        /// Maximum number of parallel connections
        #[arg(long)]
        connections: Option<usize>,
        /// Download only the files listed in this YAML file instead of scanning
        #[arg(long, value_name = "FILE")]
        skip_scan: Option<PathBuf>,
    },
    /// Scan the repository and report what it holds
    Scan {
        /// Maximum number of parallel connections
        #[arg(long)]
        connections: Option<usize>,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Where to write it; defaults to the user configuration directory
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print where the configuration is read from
    Path,
}

/// Explicit file list used instead of a scan
#[derive(Debug, Deserialize)]
struct ExplicitFileList {
    /// Entries of the form `remote/relative/path | local/relative/path`
    files: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) if matches!(cli.command, Commands::Config { .. }) => {
            display::display_warning(&format!("{error:#}; showing defaults"));
            Config::default()
        }
        Err(error) => return Err(error),
    };
    let _log_guard = init_logging(&cli, &config)?;

    info!("modsync v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Sync {
            dry_run,
            no_delete,
            yes,
            connections,
            skip_scan,
        } => {
            let options = SyncOptions::new().dry_run(dry_run).no_delete(no_delete);
            sync_command(config, options, yes, connections, skip_scan, cli.quiet, cli.json).await
        }
        Commands::Scan { connections } => {
            scan_command(config, connections, cli.quiet, cli.json).await
        }
        Commands::Config { action } => {
            config_command(action, &config, cli.config.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => ConfigLoader::load_default().context("Failed to load configuration"),
    }
}

fn init_logging(cli: &Cli, config: &Config) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        config.logging.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{level}'"))?;

    let (file_layer, guard) = match &config.logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if config.logging.json_format {
                fmt::layer().json().with_writer(writer).boxed()
            } else {
                fmt::layer().with_ansi(false).with_writer(writer).boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

fn build_engine(config: &Config) -> Result<(SyncEngine, CancelScopeStack)> {
    if config.packs.is_empty() {
        bail!("No packs are configured; run `modsync config init` and edit the file");
    }
    let factory = MirrorClientFactory::from_connection(&config.connection)
        .context("Cannot reach the repository")?;
    info!("Using {}", modsync_types::ClientFactory::describe(&factory));

    let scopes = CancelScopeStack::new(CancellationToken::new());
    let engine = SyncEngine::new(
        SyncSettings::from_config(config),
        Arc::new(factory),
        scopes.clone(),
    );
    Ok((engine, scopes))
}

async fn sync_command(
    mut config: Config,
    mut options: SyncOptions,
    yes: bool,
    connections: Option<usize>,
    skip_scan: Option<PathBuf>,
    quiet: bool,
    json: bool,
) -> Result<ExitCode> {
    if let Some(connections) = connections {
        config.connection.max_connections = connections.max(1);
    }
    if let Some(list) = &skip_scan {
        options = options.explicit_files(read_explicit_files(list, &config)?);
    }

    let (engine, scopes) = build_engine(&config)?;
    let listener = scopes.spawn_interrupt_listener();
    let quiet = quiet || json;

    if !quiet {
        println!(
            "{} Syncing {} with {}",
            style("⟲").blue().bold(),
            style(config.local_base.display()).cyan(),
            style(&config.connection.address).cyan()
        );
        if options.dry_run {
            println!("{} Dry run mode - no changes will be made", style("ℹ").yellow());
        }
    }

    let spinner = progress::scan_spinner(quiet);
    let planned = engine.plan(options).await;
    spinner.finish_and_clear();

    let mut plan = match planned {
        Ok(plan) => plan,
        Err(error) => {
            listener.abort();
            let report = modsync_sync::SyncReport::from_error(
                error,
                chrono::Local::now(),
                std::time::Duration::ZERO,
            );
            return Ok(finish_report(&report, json));
        }
    };

    if !quiet {
        display::display_plan(&plan, &config.local_base);
    }

    let deletions = plan.deletions().len();
    if deletions > config.deletion_confirm_threshold && !yes && !plan.diff().to_delete.is_empty() {
        let scanned = plan.scan_stats().files_found;
        if !confirm_deletions(deletions, scanned, json).await? {
            plan.skip_deletions();
        }
    }

    let mut tracker = DownloadProgress::new(config.progress.clone());
    let view = match tracker.take_event_receiver() {
        Some(events) if !quiet && !plan.downloads().is_empty() => {
            let bytes = plan.diff().download_bytes();
            let view =
                progress::TransferView::new(&config.local_base, plan.downloads().len(), bytes);
            Some(tokio::spawn(view.run(events)))
        }
        _ => None,
    };

    let report = engine.execute(plan, tracker).await;
    if let Some(view) = view {
        let _ = view.await;
    }
    listener.abort();

    Ok(finish_report(&report, json))
}

fn finish_report(report: &modsync_sync::SyncReport, json: bool) -> ExitCode {
    if json {
        match serde_json::to_string_pretty(&json_output::SyncReportJson::from_report(report)) {
            Ok(text) => println!("{text}"),
            Err(e) => display::display_error(&format!("Could not serialize the report: {e}")),
        }
    } else {
        display::display_report(report);
    }
    ExitCode::from(exit_status(report.outcome))
}

fn exit_status(outcome: SyncOutcome) -> u8 {
    match outcome {
        SyncOutcome::Completed => 0,
        SyncOutcome::Failed => 1,
        SyncOutcome::PartialSuccess => 2,
        SyncOutcome::Cancelled => 130,
    }
}

async fn confirm_deletions(count: usize, scanned: usize, json: bool) -> Result<bool> {
    if json || !console::Term::stdout().is_term() {
        warn!(
            "Refusing to delete {} without --yes in a non-interactive session",
            pluralize(count, "file")
        );
        return Ok(false);
    }

    display::display_warning(&format!("There are {} to delete.", pluralize(count, "file")));
    if scanned < count {
        display::display_warning(
            "That is more than the repository holds, which points to a scan problem. Answer no unless you are sure.",
        );
    }

    let prompt = format!("Delete {}?", pluralize(count, "file"));
    tokio::task::spawn_blocking(move || {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
    })
    .await
    .context("Confirmation prompt failed")?
    .context("Could not read the answer")
}

async fn scan_command(
    mut config: Config,
    connections: Option<usize>,
    quiet: bool,
    json: bool,
) -> Result<ExitCode> {
    if let Some(connections) = connections {
        config.connection.max_connections = connections.max(1);
    }
    let (engine, scopes) = build_engine(&config)?;
    let listener = scopes.spawn_interrupt_listener();

    let spinner = progress::scan_spinner(quiet || json);
    let outcome = engine.scan().await;
    spinner.finish_and_clear();
    listener.abort();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(error) if error.is_cancellation() => {
            display::display_warning("Scan was cancelled.");
            return Ok(ExitCode::from(130));
        }
        Err(error) => return Err(error).context("Could not scan the repository"),
    };

    if json {
        let text =
            serde_json::to_string_pretty(&json_output::ScanResultJson::from_outcome(&outcome))
                .context("Could not serialize the scan result")?;
        println!("{text}");
    } else {
        display::display_scan(&outcome);
    }

    Ok(if outcome.faults.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn config_command(action: ConfigAction, config: &Config, explicit: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Init { path, force } => {
            let path = path
                .or_else(|| explicit.map(Path::to_path_buf))
                .unwrap_or_else(ConfigLoader::default_config_path);
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite it", path.display());
            }
            ConfigLoader::generate_default_config(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "{} Wrote a default configuration to {}",
                style("✓").green(),
                style(path.display()).cyan()
            );
        }
        ConfigAction::Show => {
            let text = serde_yaml::to_string(config).context("Failed to render the configuration")?;
            println!("{} Current configuration:", style("⚙").blue().bold());
            println!("{text}");
        }
        ConfigAction::Path => {
            let found = explicit
                .map(Path::to_path_buf)
                .or_else(ConfigLoader::config_exists);
            match found {
                Some(path) => println!("{}", path.display()),
                None => println!(
                    "No configuration file found; `modsync config init` writes one to {}",
                    ConfigLoader::default_config_path().display()
                ),
            }
        }
    }
    Ok(())
}

fn read_explicit_files(list: &Path, config: &Config) -> Result<Vec<PathMapping>> {
    let text = std::fs::read_to_string(list)
        .with_context(|| format!("Failed to read {}", list.display()))?;
    let parsed: ExplicitFileList = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse {}", list.display()))?;
    parsed
        .files
        .iter()
        .map(|entry| parse_file_mapping(entry, config))
        .collect()
}

/// Parse `remote | local`; a single path maps to the same place on both sides
fn parse_file_mapping(entry: &str, config: &Config) -> Result<PathMapping> {
    let (remote, local) = match entry.split_once('|') {
        Some((remote, local)) => (remote.trim(), local.trim()),
        None => (entry.trim(), entry.trim()),
    };
    if remote.is_empty() || local.is_empty() {
        bail!("Invalid file mapping '{entry}'");
    }
    Ok(PathMapping::new(
        config.connection.root_path.clone(),
        config.local_base.clone(),
        local,
        remote,
    ))
}
