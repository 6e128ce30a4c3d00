//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use oerflow_core::{http_spout, jsonl_spout, run_pipeline, standard_spec};
use oerflow_shared::{
    AppConfig, init_config, load_config, load_config_from, validate_user_key,
};
use oerflow_topology::{ShutdownReport, TopologySpec, load_topology};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// oerflow — preprocess open educational resources into searchable catalogs.
#[derive(Parser)]
#[command(
    name = "oerflow",
    version,
    about = "Pull OER material descriptors through the preprocessing pipeline into local catalogs.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the preprocessing pipeline until its input is exhausted or ctrl-c.
    Run {
        /// Config file path (defaults to ~/.oerflow/oerflow.toml).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Custom topology definition (TOML). Mutually exclusive with
        /// --jsonl and --poll.
        #[arg(long)]
        topology: Option<PathBuf>,

        /// Run the standard topology over a JSONL descriptor file.
        #[arg(long)]
        jsonl: Option<PathBuf>,

        /// Run the standard topology against an upstream HTTP queue.
        #[arg(long)]
        poll: Option<String>,
    },

    /// Parse and validate a topology definition without running it.
    Validate {
        /// Topology definition (TOML).
        topology: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "oerflow=info",
        1 => "oerflow=debug",
        _ => "oerflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            config,
            topology,
            jsonl,
            poll,
        } => cmd_run(config.as_deref(), topology.as_deref(), jsonl, poll).await,
        Command::Validate { topology } => cmd_validate(&topology).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: Option<&std::path::Path>,
    topology: Option<&std::path::Path>,
    jsonl: Option<PathBuf>,
    poll: Option<String>,
) -> Result<()> {
    let config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    let spec = resolve_spec(topology, jsonl, poll)?;

    // Fail before startup if enrichment is declared but the key is absent.
    if spec.bolts.iter().any(|b| b.kind == "concept-enrichment") {
        validate_user_key(&config)?;
    }

    info!(topology = %spec.name, "starting pipeline");
    let handle = run_pipeline(&config, spec).await?;

    // First ctrl-c drains in-flight records; a second one exits immediately.
    let signal = handle.shutdown_signal();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining in-flight records (ctrl-c again to abort)");
            let _ = signal.send(true);
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second interrupt, exiting immediately");
                std::process::exit(130);
            }
        }
    });

    let report = handle.join().await;
    interrupt.abort();

    print_report(&report);

    if !report.errors.is_empty() || !report.aborted.is_empty() {
        return Err(eyre!(
            "pipeline stopped with {} error(s) and {} aborted stage(s)",
            report.errors.len(),
            report.aborted.len()
        ));
    }
    Ok(())
}

fn resolve_spec(
    topology: Option<&std::path::Path>,
    jsonl: Option<PathBuf>,
    poll: Option<String>,
) -> Result<TopologySpec> {
    match (topology, jsonl, poll) {
        (Some(path), None, None) => Ok(load_topology(path)?),
        (None, Some(path), None) => Ok(standard_spec(jsonl_spout(&path))),
        (None, None, Some(endpoint)) => Ok(standard_spec(http_spout(&endpoint))),
        (None, None, None) => Err(eyre!(
            "nothing to run: pass --topology, --jsonl, or --poll"
        )),
        _ => Err(eyre!(
            "--topology, --jsonl, and --poll are mutually exclusive"
        )),
    }
}

fn print_report(report: &ShutdownReport) {
    println!();
    println!("  Pipeline stopped.");
    println!("  Records processed: {}", report.processed);
    println!("  Stages completed:  {}", report.completed.len());
    if !report.aborted.is_empty() {
        println!("  Stages aborted:    {}", report.aborted.join(", "));
    }
    for (stage, err) in &report.errors {
        println!("  Error in {stage}: {err}");
    }
    println!();
}

async fn cmd_validate(topology: &std::path::Path) -> Result<()> {
    let spec = load_topology(topology)?;
    println!("Topology '{}' is valid.", spec.name);
    for spout in &spec.spouts {
        println!("  spout {} (source: {})", spout.name, spout.source);
    }
    for bolt in &spec.bolts {
        let inputs: Vec<String> = bolt
            .inputs
            .iter()
            .map(|i| format!("{}/{}", i.source, i.stream))
            .collect();
        println!(
            "  bolt  {} (kind: {}) <- {}",
            bolt.name,
            bolt.kind,
            inputs.join(", ")
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
