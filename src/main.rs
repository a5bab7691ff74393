use clap::{Parser, Subcommand};
use sondeo::config::{Config, ConfigError};
use sondeo::core::Endpoint;
use sondeo::node::{NodeInfo, NodeListener, ProbedNode};
use sondeo::pool::mock::{mongos_reply, primary_reply, secondary_reply, MockPoolFactory, MockServer};
use sondeo::pool::PoolFactory;
use sondeo::utils::format_duration;
use sondeo::{Cluster, ClusterDescription};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sondeo")]
#[command(about = "Client-side topology monitor for MongoDB-style clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Sondeo Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a simulated cluster built from the configured seeds
    Simulate {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
        /// How long to run, in seconds
        #[arg(short, long, default_value_t = 30)]
        duration: u64,
        /// Take the first seed down after this many seconds
        #[arg(long)]
        fail_after: Option<u64>,
    },
    /// Generate example configuration files
    Config {
        /// Configuration mode (standalone, replicaset or sharded)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            duration,
            fail_after,
        } => {
            simulate(config, Duration::from_secs(duration), fail_after.map(Duration::from_secs)).await?;
        }
        Commands::Config { mode, output } => {
            generate_config(mode, output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

/// Logs probe results the way a driver's diagnostics would
struct LoggingListener;

impl NodeListener for LoggingListener {
    fn node_info_changed(&self, old: &NodeInfo, new: &NodeInfo) -> anyhow::Result<()> {
        info!(from = %old, to = %new, "node changed");
        Ok(())
    }

    fn probed_node(&self, event: &ProbedNode) -> anyhow::Result<()> {
        debug!(
            endpoint = %event.endpoint,
            connection_id = ?event.connection_id,
            elapsed = %format_duration(event.elapsed),
            succeeded = event.succeeded(),
            "probed node"
        );
        Ok(())
    }
}

/// One mock server per seed, shaped after the configured deployment
fn simulated_servers(config: &Config, seeds: &[Endpoint]) -> Vec<(Endpoint, MockServer)> {
    let hosts: Vec<String> = seeds.iter().map(Endpoint::to_string).collect();
    let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();

    seeds
        .iter()
        .enumerate()
        .map(|(i, seed)| {
            let me = seed.to_string();
            let reply = match &config.cluster.replica_set {
                Some(set) if i == 0 => primary_reply(set, &hosts, &me),
                Some(set) => secondary_reply(set, &hosts, &me, hosts.first().copied()),
                None if seeds.len() > 1 => mongos_reply(),
                None => sondeo::pool::mock::standalone_reply(),
            };
            (seed.clone(), MockServer::with_is_master(reply))
        })
        .collect()
}

async fn simulate(config_path: PathBuf, duration: Duration, fail_after: Option<Duration>) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load config from {:?}: {}", config_path, e))?;
    init_logging(&config)?;

    info!("Starting sondeo v{} simulation", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);

    let seeds = config.seed_endpoints()?;
    let factory = Arc::new(if config.pool.shared {
        MockPoolFactory::with_shared_pools()
    } else {
        MockPoolFactory::new()
    });
    let servers = simulated_servers(&config, &seeds);
    for (endpoint, server) in &servers {
        factory.add_server(endpoint.clone(), server.clone());
    }

    let pool_factory: Arc<dyn PoolFactory> = factory;
    let settings = config.cluster_settings(pool_factory)?;
    let listener: Arc<dyn NodeListener> = Arc::new(LoggingListener);
    let cluster = Cluster::start(settings, Some(listener))?;
    info!(cluster_id = %cluster.id(), seeds = seeds.len(), "cluster monitoring started");

    let mut descriptions = cluster.subscribe();
    let stop = tokio::time::sleep(duration);
    tokio::pin!(stop);
    let failure = async {
        match fail_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(failure);
    let mut failed = false;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut failure, if !failed => {
                failed = true;
                if let Some((endpoint, server)) = servers.first() {
                    warn!(%endpoint, "taking simulated node down");
                    server.set_reachable(false);
                    cluster.request_probe_all()?;
                }
            }
            changed = descriptions.changed() => {
                if changed.is_err() {
                    break;
                }
                let description = descriptions.borrow_and_update().clone();
                report(&description);
            }
        }
    }

    cluster.dispose().await;
    info!("Simulation finished");
    Ok(())
}

fn report(description: &ClusterDescription) {
    info!(
        cluster_type = %description.cluster_type(),
        revision = description.revision(),
        "{}",
        description
    );
    for node in description.nodes() {
        info!("  {}", node);
    }
}

fn generate_config(mode: String, output: PathBuf) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode)
        .map_err(|e| anyhow::anyhow!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  sondeo simulate --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            match &config.cluster.replica_set {
                Some(name) => println!("  Replica set: {}", name),
                None => println!("  Replica set: none"),
            }
            println!(
                "  Probe interval: {}",
                format_duration(Duration::from_millis(config.monitor.probe_interval_ms))
            );
            println!("  Pool max size: {}", config.pool.max_size);
            println!("  Seeds: {} instances", config.cluster.seeds.len());
            for (i, seed) in config.cluster.seeds.iter().enumerate() {
                println!("    {}: {}", i + 1, seed);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("sondeo v{}", env!("CARGO_PKG_VERSION"));
    println!("Client-side topology monitor for MongoDB-style clusters");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Background node probing with revisioned snapshots");
    println!("  • Revision-gated waits with sliding timeouts");
    println!("  • Dedicated and shared connection pools per node");
    println!("  • Replica set and sharded cluster discovery");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
