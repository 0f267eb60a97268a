//! Device Defender reporting agent - main entry point

use clap::{Parser, Subcommand};
use defender_agent::agent::{DefenderAgent, PersistentReportId};
use defender_agent::collectors::ProcNetCollector;
use defender_agent::config::AgentConfig;
use defender_agent::observability::{init_default_logging, stats};
use defender_agent::store::{KvKey, KvStore};
use defender_agent::transport::{MqttTransport, TopicRouter};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Periodic device metrics reporting over MQTT
#[derive(Parser)]
#[command(name = "defender-agent")]
#[command(about = "Publishes device network metrics to the Device Defender service")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DEFENDER_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reporting loop until SIGINT or SIGTERM
    Run,
    /// Validate the configuration file
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["defender-agent.toml", "config/defender-agent.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting defender-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    Err(format!(
        "no configuration file found; pass -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

fn open_store(config: &AgentConfig) -> Result<Arc<KvStore>, Box<dyn std::error::Error>> {
    let store = match &config.device.store_path {
        Some(path) => KvStore::open(path)?,
        None => KvStore::in_memory(),
    };

    if let Some(thing_name) = &config.device.thing_name {
        store.set_string(KvKey::ThingName, thing_name)?;
    }
    Ok(Arc::new(store))
}

async fn run_agent(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&config)?;
    let thing_name = store
        .get_string(KvKey::ThingName)?
        .ok_or("thing name is not provisioned; set device.thing_name")?;

    let router = Arc::new(TopicRouter::new(config.report.router_capacity));
    let mut client = MqttTransport::new(&config.client_id(&thing_name), &config.mqtt, router)?;
    client.start()?;
    let transport = Arc::new(client);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        let _ = shutdown_tx.send(true);
    });

    let mut agent = DefenderAgent::new(
        Arc::clone(&transport),
        Arc::clone(&store),
        Arc::new(ProcNetCollector::default()),
        Arc::new(PersistentReportId::new(Arc::clone(&store))),
    )
    .with_timing(config.timing())
    .with_buffer_size(config.report.buffer_size);

    info!(thing_name = %thing_name, "Agent starting");
    let outcome = agent.run(shutdown_rx).await;
    drop(agent);

    match Arc::try_unwrap(transport) {
        Ok(mut client) => client.disconnect().await?,
        Err(_) => warn!("Transport still shared at shutdown, skipping disconnect"),
    }

    if outcome.startup_failed {
        stats().set_agent_state("error");
        return Err("agent startup failed".into());
    }
    info!(cycles = outcome.cycles, "Agent stopped");
    Ok(())
}

fn handle_config_command(config: &AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
