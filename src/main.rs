use clap::{Parser, Subcommand};
use inference_worker::config::WorkerConfig;
use tracing_subscriber::EnvFilter;

/// Admission-control proxy worker for a local model-inference server
#[derive(Parser)]
#[command(name = "inference-worker", version, about)]
struct Cli {
    /// Path to configuration file (.hcl); built-in defaults when absent
    #[arg(short, long)]
    config: Option<String>,

    /// Override listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without starting the worker
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> inference_worker::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Validate { config: config_path }) = &cli.command {
        return validate_config(config_path).await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("Inference worker v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(config = path, "Loading configuration");
            WorkerConfig::from_file(path).await?
        }
        None => {
            tracing::info!("No config file given, using built-in defaults");
            WorkerConfig::default()
        }
    };
    config.apply_env_overrides()?;
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }

    let worker = inference_worker::Worker::new(config)?;
    worker.start().await?;

    tracing::info!("Worker ready, press Ctrl+C to stop");
    worker.wait_for_shutdown().await;

    Ok(())
}

/// Validate a configuration file and print diagnostics
async fn validate_config(path: &str) -> inference_worker::Result<()> {
    if !std::path::Path::new(path).exists() {
        eprintln!("✗ Config file not found: {}", path);
        std::process::exit(1);
    }

    let config = match WorkerConfig::from_file(path).await {
        Ok(c) => {
            println!("✓ Config parsed successfully ({})", path);
            c
        }
        Err(e) => {
            eprintln!("✗ Parse error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        std::process::exit(1);
    }

    println!("✓ Configuration is valid");
    println!();
    println!("  Listen:   {}", config.listen);
    println!("  Upstream: {}", config.upstream.base_url());
    println!("  Log:      {}", config.log.path);
    println!("  Routes:   {}", config.routes.len());
    for route in &config.routes {
        let mode = if route.allow_parallel {
            "parallel"
        } else {
            "serialized"
        };
        let benchmark = route
            .benchmark
            .as_ref()
            .map(|b| format!(", benchmark {}x{}", b.runs, b.concurrency))
            .unwrap_or_default();
        println!(
            "    - {} ({}, max queue {}s{})",
            route.path, mode, route.max_queue_secs, benchmark
        );
    }
    if let Some(url) = &config.metrics.report_url {
        println!("  Report:   {} every {}s", url, config.metrics.report_interval_secs);
    }

    Ok(())
}
