use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshgate_core::config::Config;
use meshgate_core::config::NegotiationConfig;
use meshgate_core::core_identity::{generate_registry_secret, provider_from_config};
use meshgate_core::logging::{init_logging_with_config, LogConfig};
use meshgate_core::metrics::init_metrics;
use meshgate_core::shutdown::{install_signal_handlers, run_until_shutdown};
use meshgate_core::{LocalMesh, LogLevel, NodeIdentity, RunningNode, ShutdownCoordinator, ShutdownSignal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; MESHGATE_* variables override it
    #[arg(short, long, env = "MESHGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run several peers and a relay on an in-process mesh
    Simulate {
        /// Number of peers to start
        #[arg(short, long, default_value_t = 3)]
        peers: usize,

        /// Stop after this many seconds instead of waiting for Ctrl+C
        #[arg(short, long)]
        duration: Option<u64>,

        /// Make peers earn access from a relay before joining
        #[arg(long)]
        negotiate: bool,

        /// Seconds between status lines
        #[arg(long, default_value_t = 5)]
        status_interval: u64,
    },

    /// Print a fresh base64 registry secret to share between peers
    GenSecret,

    /// Print the effective configuration as TOML
    PrintConfig,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    config.validate()?;
    Ok(config)
}

fn init_observability(config: &Config) -> Result<()> {
    let log_config = LogConfig::try_from(&config.logging).unwrap_or_else(|e| {
        eprintln!("{}, using '{}'", e, LogLevel::Info);
        LogConfig::new(LogLevel::Info).json_format(config.logging.json_format)
    });
    init_logging_with_config(log_config)?;
    if config.metrics.enabled {
        init_metrics();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Command::GenSecret => {
            println!("{}", generate_registry_secret().as_str());
            Ok(())
        }
        Command::PrintConfig => {
            let config = load_config(&args)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Simulate {
            peers,
            duration,
            negotiate,
            status_interval,
        } => {
            let config = load_config(&args)?;
            init_observability(&config)?;
            simulate(
                config,
                *peers,
                duration.map(Duration::from_secs),
                *negotiate,
                Duration::from_secs((*status_interval).max(1)),
            )
            .await
        }
    }
}

async fn simulate(
    mut config: Config,
    peers: usize,
    duration: Option<Duration>,
    negotiate: bool,
    status_interval: Duration,
) -> Result<()> {
    anyhow::ensure!(peers > 0, "at least one peer is required");
    config.negotiation.enabled |= negotiate;

    let shutdown = Arc::new(ShutdownCoordinator::new());
    install_signal_handlers(shutdown.clone());

    let mesh = LocalMesh::new(provider_from_config(&config.identity.credential));
    info!(peers, negotiate = config.negotiation.enabled, "Starting simulation");

    let relay = if config.negotiation.enabled {
        Some(start_relay(&mesh, &config.negotiation, &shutdown).await?)
    } else {
        None
    };

    let mut nodes = Vec::with_capacity(peers);
    for i in 1..=peers {
        let mut peer_config = config.clone();
        peer_config.identity.display_name = format!("{}-{}", config.identity.display_name, i);
        let identity = NodeIdentity::generate(peer_config.identity.display_name.clone());
        let node = mesh.node(identity, peer_config)?;
        let running = node.start(&shutdown).await?;
        if let Some(auth) = running.authorization() {
            info!(
                peer = %running.identity().display_name(),
                requests = auth.requests_sent,
                elapsed = ?auth.elapsed,
                "Access granted"
            );
        }
        nodes.push(running);
    }

    if let Some(duration) = duration {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            info!("Simulation time elapsed");
            shutdown.shutdown(ShutdownSignal::Graceful);
        });
    }

    let mut ticker = tokio::time::interval(status_interval);
    run_until_shutdown("status-report", shutdown.subscribe(), async {
        loop {
            ticker.tick().await;
            report(&nodes);
        }
    })
    .await;

    for node in nodes {
        if let Err(e) = node.join().await {
            warn!(error = %e, "Peer did not stop cleanly");
        }
    }
    if let Some(relay) = relay {
        let responder = relay.join().await?;
        info!(admitted = responder.authorized_peers().len(), "Relay stopped");
    }
    info!("Simulation finished");
    Ok(())
}

async fn start_relay(
    mesh: &LocalMesh,
    config: &NegotiationConfig,
    shutdown: &ShutdownCoordinator,
) -> Result<meshgate_core::Relay> {
    let identity = NodeIdentity::generate("relay");
    let relay = mesh.relay(identity.identity(), config, shutdown).await?;
    info!(relay = %identity.short(), library = config.library_size, "Relay serving");
    Ok(relay)
}

fn report(nodes: &[RunningNode]) {
    for node in nodes {
        let online: Vec<String> = node
            .presence()
            .online_peers()
            .into_iter()
            .map(|p| p.display_name)
            .collect();
        let members = node.registry().members().borrow().len();
        let status = node.registry().status().borrow().to_string();
        info!(
            peer = %node.identity().display_name(),
            online = ?online,
            members,
            registry = %status,
            "Status"
        );
    }
}
