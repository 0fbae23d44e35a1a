use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewall::config::ServiceConfig;
use ratewall::ratelimit::{LimiterFactory, RateLimiterBackend};
use ratewall::store::MemoryStore;

/// Operator tool for the Ratewall rate limiter.
#[derive(Debug, Parser)]
#[command(name = "ratewall", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL, overriding the configuration file
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Use an in-process store instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count requests against a named limit
    Check {
        /// Limit name, e.g. password_reset
        limit: String,
        /// Identifier being limited, e.g. an email address
        identifier: String,
        /// Number of requests to count
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Forget recorded requests for an identifier
    Reset { limit: String, identifier: String },
    /// Forget recorded requests for every key matching a glob
    ResetPattern { pattern: String },
    /// Probe the store and print the health state
    Health,
    /// Keep the limiter running and log health until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => ServiceConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(url) = &cli.redis_url {
        config.store.url = url.clone();
    }
    info!(version = env!("CARGO_PKG_VERSION"), "Configuration loaded");

    let factory = if cli.memory {
        info!("Using in-process store");
        LimiterFactory::with_store(config, Arc::new(MemoryStore::new()))?
    } else {
        LimiterFactory::new(config)?
    };

    let outcome = run(&factory, cli.command).await;

    if let Err(err) = factory.shutdown().await {
        warn!(error = %err, "Shutdown did not complete cleanly");
    }
    outcome
}

async fn run(factory: &LimiterFactory, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Check {
            limit,
            identifier,
            count,
        } => {
            let limiter = factory.named(&limit).await?;
            for _ in 0..count {
                let result = limiter.check(&identifier).await;
                println!("{}", serde_json::to_string(&result)?);
            }
            let shared = factory.limiter().await;
            println!(
                "{}",
                serde_json::to_string(&json!({ "metrics": shared.metrics() }))?
            );
        }
        Command::Reset { limit, identifier } => {
            let limiter = factory.named(&limit).await?;
            limiter.reset(&identifier).await?;
            println!(
                "{}",
                json!({ "limit": limit, "identifier": identifier, "reset": true })
            );
        }
        Command::ResetPattern { pattern } => {
            let removed = factory.limiter().await.reset_pattern(&pattern).await?;
            println!("{}", json!({ "pattern": pattern, "removed": removed }));
        }
        Command::Health => {
            let limiter = factory.limiter().await;
            limiter.probe().await;
            println!("{}", serde_json::to_string_pretty(&limiter.health_snapshot())?);
        }
        Command::Watch => {
            let limiter = factory.limiter().await;
            info!(limits = ?factory.limit_names(), "Rate limiter running, press Ctrl+C to stop");

            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let health = limiter.health_snapshot();
                        info!(
                            state = ?health.state,
                            transitions = health.transitions,
                            last_error = ?health.last_error,
                            "Health"
                        );
                    }
                    signal = &mut shutdown => {
                        signal?;
                        break;
                    }
                }
            }

            println!("{}", serde_json::to_string_pretty(&limiter.metrics())?);
        }
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            result
        }
        result = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
            result
        }
    }
}
