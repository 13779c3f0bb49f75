use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Decision, RateLimiter, RequestDescriptor, LOOPBACK_PLACEHOLDER};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Fixed-window request admission control")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate a configuration, then list its limiters
    Validate {
        /// YAML file layered over the built-in presets
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Replay a burst of requests against a fresh limiter
    Simulate {
        /// YAML file layered over the built-in presets
        #[arg(long)]
        config: Option<PathBuf>,

        /// Limiter to simulate, e.g. "chat"
        #[arg(long)]
        limiter: String,

        /// Client address sent as X-Forwarded-For
        #[arg(long, default_value = LOOPBACK_PLACEHOLDER)]
        address: String,

        /// Route the requests are sent to
        #[arg(long, default_value = "/")]
        route: String,

        /// Number of requests to replay
        #[arg(long, default_value_t = 1)]
        requests: u64,
    },
}

/// One line of `simulate` output.
#[derive(Debug, Serialize)]
struct SimulatedRequest<'a> {
    request: u64,
    key: &'a str,
    #[serde(flatten)]
    decision: Decision,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Simulate {
            config,
            limiter,
            address,
            route,
            requests,
        } => simulate(config, &limiter, &address, &route, requests),
    }
}

/// Logs go to stderr so `simulate` output stays machine-readable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = TurnstileConfig::load(path.as_deref()).context("Invalid configuration")?;

    for (name, settings) in &config.limiters {
        info!(
            limiter = %name,
            window_ms = settings.window_ms,
            max_requests = settings.max_requests,
            store_capacity = settings.store_capacity,
            key = ?settings.key,
            "Limiter configured"
        );
    }

    info!(limiters = config.limiters.len(), "Configuration is valid");
    Ok(())
}

fn simulate(
    path: Option<PathBuf>,
    name: &str,
    address: &str,
    route: &str,
    requests: u64,
) -> anyhow::Result<()> {
    let config = TurnstileConfig::load(path.as_deref()).context("Invalid configuration")?;
    let settings = config
        .limiter(name)
        .with_context(|| format!("No limiter named {:?}", name))?;
    let limiter = RateLimiter::from_settings(name, settings)?;

    let descriptor = RequestDescriptor::new(route).with_header("x-forwarded-for", address);
    let key = limiter.key_for(&descriptor);

    for request in 1..=requests {
        let line = SimulatedRequest {
            request,
            key: &key,
            decision: limiter.increment(&descriptor),
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    Ok(())
}
