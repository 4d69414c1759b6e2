use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slotgate::config::{Config, ConfigError};
use slotgate::Gateway;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slotgate")]
#[command(about = "An HTTP gateway for Redis Cluster with slot-aware routing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/slotgate.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
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

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_gateway(config),
        Commands::Config { output } => generate_config(output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn run_gateway(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!("Starting slotgate v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Seed nodes: {:?}", config.cluster.seed_nodes);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.server.worker_threads {
        builder.worker_threads(threads);
    }
    let runtime = builder
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime
        .block_on(Gateway::new(config).run())
        .context("Gateway terminated with an error")?;

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your cluster and run:");
    println!("  slotgate run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!(
                "  Proxying: {}",
                if config.server.enabled { "enabled" } else { "disabled (204)" }
            );
            println!("  Seed nodes: {} instances", config.cluster.seed_nodes.len());
            for (i, node) in config.cluster.seed_nodes.iter().enumerate() {
                println!("    {}: {}", i + 1, node);
            }
            if let Some(fallback) = &config.cluster.fallback_node {
                println!("  Fallback node: {}", fallback);
            }
            println!("  Max redirects: {}", config.upstream.max_redirects);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("slotgate v{}", env!("CARGO_PKG_VERSION"));
    println!("An HTTP gateway for Redis Cluster with slot-aware routing");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • CRC16 slot routing with hash tags");
    println!("  • MOVED/ASK redirect handling");
    println!("  • Bounded per-node connection pools");
    println!("  • Streaming reply decoding");
    println!("  • Periodic topology refresh and health checks");
}

fn init_logging(config: &Config) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
