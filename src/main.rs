use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use replipool::config::{Config, ConfigError};
use replipool::driver::memory::MemoryCluster;
use replipool::driver::Adapter;
use replipool::events::Event;
use replipool::routing::classify::classify;
use replipool::routing::QueryContext;
use replipool::utils::format_duration;
use replipool::{Endpoint, ReplicationPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replipool")]
#[command(about = "Database connection pooling with primary/replica routing and automated failover")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication pool against a simulated in-memory cluster
    Simulate {
        /// Path to configuration file; a local cluster is generated when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of replicas for the generated cluster
        #[arg(short, long, default_value_t = 2)]
        replicas: usize,
        /// Number of statements to run
        #[arg(short, long, default_value_t = 1000)]
        queries: usize,
        /// Share of writes among the statements (0.0 - 1.0)
        #[arg(long, default_value_t = 0.2)]
        write_ratio: f64,
        /// Take the primary down halfway through and wait for failover
        #[arg(long)]
        kill_primary: bool,
    },
    /// Generate example configuration files
    Config {
        /// Number of replicas in the example
        #[arg(short, long, default_value_t = 2)]
        replicas: usize,
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
    /// Show where a statement would be routed
    Classify {
        /// SQL statement
        sql: String,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            replicas,
            queries,
            write_ratio,
            kill_primary,
        } => {
            simulate(config, replicas, queries, write_ratio, kill_primary).await?;
        }
        Commands::Config { replicas, output } => {
            generate_config(replicas, output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Classify { sql } => {
            println!("{:?}", classify(&sql));
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn simulation_config(replicas: usize) -> Config {
    let mut config = Config::default();
    config.primary = Endpoint::new("127.0.0.1", 5432).with_id("primary");
    config.replication.replicas = (1..=replicas)
        .map(|i| Endpoint::new("127.0.0.1", 5432 + i as u16).with_id(format!("replica-{}", i)))
        .collect();
    config.replication.health_check_interval_ms = 200;
    config.replication.health_check_timeout_ms = 100;
    config.replication.failure_threshold = 2;
    config.failover.poll_interval_ms = 50;
    config
}

async fn simulate(
    config_path: Option<PathBuf>,
    replicas: usize,
    queries: usize,
    write_ratio: f64,
    kill_primary: bool,
) -> Result<()> {
    let config = match &config_path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => simulation_config(replicas),
    };

    init_logging(&config)?;
    info!("Starting replipool v{} simulation", env!("CARGO_PKG_VERSION"));

    let cluster = MemoryCluster::for_endpoints(&config.primary, &config.replication.replicas);
    let mut rng = rand::thread_rng();
    for replica in &config.replication.replicas {
        if let Some(node) = cluster.node(&replica.address()) {
            node.set_lag_ms(rng.gen_range(0..500));
        }
    }

    let pool = ReplicationPool::new(config.clone(), Adapter::postgres(Arc::new(cluster.driver())))
        .context("Failed to build replication pool")?;
    pool.init().await.context("Failed to initialize replication pool")?;
    let mut events = pool.subscribe();

    let started = Instant::now();
    let mut failed = 0usize;
    for i in 0..queries {
        if kill_primary && i == queries / 2 {
            if let Some(node) = cluster.node(&config.primary.address()) {
                warn!("Taking primary {} down", config.primary.address());
                node.set_reachable(false);
            }
            wait_for_failover(&mut events, &config).await;
        }

        let sql = if rng.gen_bool(write_ratio.clamp(0.0, 1.0)) {
            "UPDATE accounts SET balance = balance + 1 WHERE id = $1"
        } else {
            "SELECT balance FROM accounts WHERE id = $1"
        };
        let params = [replipool::core::Value::Int(i as i64)];
        if let Err(e) = pool.query(sql, &params, &QueryContext::default()).await {
            failed += 1;
            warn!("Statement {} failed: {}", i, e);
        }
    }
    let elapsed = started.elapsed();

    let stats = pool.stats().await;
    println!("Ran {} statements in {} ({} failed)", queries, format_duration(elapsed), failed);
    println!("Primary: {}", stats.primary);
    println!(
        "Routing: {} replica reads, {} primary reads, {} writes, {} fallbacks",
        stats.routing.replica_reads,
        stats.routing.primary_reads,
        stats.routing.writes,
        stats.routing.fallbacks
    );
    for entry in &stats.nodes {
        println!(
            "  {:<12} {:<8} {:<10} lag {:>6}  conns {}/{}  queries {}  errors {}  avg query {:.2}ms",
            entry.node.id,
            entry.node.role.to_string(),
            entry.node.status.to_string(),
            if entry.node.lag_ms == replipool::core::LAG_UNREACHABLE_MS {
                "-".to_string()
            } else {
                format!("{}ms", entry.node.lag_ms)
            },
            entry.pool.active,
            entry.pool.total,
            entry.pool.total_queries,
            entry.pool.errors,
            entry.pool.avg_query_ms
        );
    }
    for event in pool.failover_history() {
        println!(
            "Failover {}: {} -> {} in {} ({})",
            event.id,
            event.previous_primary,
            event.new_primary.as_deref().unwrap_or("-"),
            format_duration(event.duration),
            if event.success { "ok" } else { "failed" }
        );
    }

    pool.close().await;
    Ok(())
}

async fn wait_for_failover(events: &mut tokio::sync::broadcast::Receiver<Event>, config: &Config) {
    let budget = Duration::from_millis(
        config.replication.health_check_interval_ms
            * (config.replication.failure_threshold as u64 + 1)
            + config.failover.timeout_ms,
    );

    let outcome = tokio::time::timeout(budget, async {
        loop {
            match events.recv().await {
                Ok(Event::FailoverComplete(event)) => return Some(event),
                Ok(Event::FailoverFailed { error, .. }) => {
                    warn!("Failover failed: {}", error);
                    return None;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match outcome {
        Ok(Some(event)) => info!(
            "Failover complete, {} is the new primary",
            event.new_primary.as_deref().unwrap_or("-")
        ),
        Ok(None) => {}
        Err(_) => warn!("No failover within {}", format_duration(budget)),
    }
}

fn generate_config(replicas: usize, output: PathBuf) -> Result<()> {
    println!("Generating configuration file with {} replicas: {:?}", replicas, output);

    Config::create_example_config(&output, replicas)
        .with_context(|| format!("Failed to generate config at {:?}", output))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  replipool validate --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Pool size: {}..{} per node", config.pool.min, config.pool.max);
            println!(
                "  Load balancing: {}",
                config.replication.load_balancing_strategy
            );
            println!("  Auto failover: {}", config.failover.auto_failover);
            for (id, endpoint, role) in config.nodes() {
                println!("    {} ({}): {}", id, role, endpoint.address());
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
    println!("replipool v{}", env!("CARGO_PKG_VERSION"));
    println!("Database connection pooling with primary/replica routing and automated failover");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Bounded connection pools with FIFO waiters and idle eviction");
    println!("  • Read/write splitting with lag-aware replica selection");
    println!("  • Health monitoring and automated failover");
    println!("  • Priority admission queue");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
