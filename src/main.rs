use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flotilla_agent::formation::{validate, FormationDefinition};
use flotilla_agent::FormationRuntime;
use flotilla_core::config::AppConfig;
use flotilla_core::event::EventBus;
use flotilla_llm::ProviderRegistry;

const DEFAULT_CONFIG: &str = "flotilla.toml";

#[derive(Parser)]
#[command(name = "flotilla", version, about = "Run multi-agent formations over LLM sessions")]
struct Cli {
    /// Path to config file (defaults to ./flotilla.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a formation definition without running it
    Validate {
        /// JSON or YAML definition
        file: PathBuf,
    },
    /// Execute a formation and print node outputs as JSON
    Run {
        /// JSON or YAML definition
        file: PathBuf,
        /// Input object handed to the root nodes
        #[arg(short, long)]
        input: Option<String>,
        /// Print formation events as JSON lines on stderr
        #[arg(long)]
        events: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "flotilla=debug,info" } else { "flotilla=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { file } => {
            let def = FormationDefinition::load(&file)?;
            validate(&def)?;
            println!("{}: ok ({} nodes, {} edges)", def.name, def.nodes.len(), def.edges.len());
            Ok(())
        }
        Commands::Run { file, input, events } => {
            let config = load_config(cli.config.as_deref())?;
            run_formation(&config, &file, input.as_deref(), events).await
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => Ok(AppConfig::load(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            info!(path = DEFAULT_CONFIG, "Loading config");
            Ok(AppConfig::load(Path::new(DEFAULT_CONFIG))?)
        }
        None => Ok(AppConfig::default()),
    }
}

fn parse_input(input: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    let Some(raw) = input else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--input must be a JSON object, got {}", other),
    }
}

async fn run_formation(config: &AppConfig, file: &Path, input: Option<&str>, events: bool) -> anyhow::Result<()> {
    let def = FormationDefinition::load(file)?;
    let inputs = parse_input(input)?;

    let mut runtime_config = config.runtime.clone();
    runtime_config.work_dir = config.work_dir().to_string_lossy().into_owned();

    let providers = Arc::new(ProviderRegistry::from_config(config));
    let mut runtime = FormationRuntime::new(providers, runtime_config);

    let printer = if events {
        let bus = Arc::new(EventBus::new(config.runtime.observer_capacity));
        let mut rx = bus.subscribe();
        runtime = runtime.with_sink(bus.sink());
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => eprintln!("{}", line),
                        Err(e) => warn!(error = %e, "Failed to encode event"),
                    },
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event printer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling formation");
            ctrl_c.cancel();
        }
    });

    let result = runtime.run(&def, inputs, cancel).await;

    // Dropping the runtime drops the last sender so the printer drains and exits.
    drop(runtime);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let outcome = result?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
