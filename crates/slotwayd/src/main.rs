//! slotwayd: the slotway daemon.
//!
//! Single binary that assembles all slotway subsystems:
//! - State store (redb)
//! - Slot registry + traffic router
//! - Metrics collector
//! - Rollout manager
//! - REST API
//!
//! and doubles as the operator client for a running daemon.
//!
//! # Usage
//!
//! ```text
//! slotwayd serve --config /etc/slotway/slotway.toml
//! slotwayd deploy --server http://localhost:8470 --deployment cart \
//!     --plugin cart-ui --version 2.0.0 --strategy canary --initial-percent 5
//! slotwayd watch --server http://localhost:8470 --attempt <id>
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use slotway_rollout::{CanaryConfig, RolloutPlan, RolloutStrategy};
use slotwayd::client::{ensure_completed, format_event};
use slotwayd::{Client, Daemon, SlotwayConfig};

#[derive(Parser)]
#[command(name = "slotwayd", about = "slotway plugin rollout daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Immediate,
    BlueGreen,
    Canary,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: state store, router, metrics, rollouts and API.
    Serve {
        /// Path to slotway.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Start a rollout and follow it until it finishes.
    Deploy {
        #[arg(long, default_value = "http://localhost:8470")]
        server: String,

        #[arg(long)]
        deployment: String,

        #[arg(long)]
        plugin: String,

        #[arg(long)]
        version: String,

        #[arg(long, value_enum, default_value_t = StrategyArg::Canary)]
        strategy: StrategyArg,

        /// Canary: traffic percent of the first step.
        #[arg(long, default_value = "10")]
        initial_percent: u32,

        /// Canary: percent added per step.
        #[arg(long, default_value = "10")]
        increment_percent: u32,

        /// Canary: seconds between steps.
        #[arg(long, default_value = "60")]
        interval_secs: u64,

        /// Canary: consecutive healthy probes required per check.
        #[arg(long, default_value = "1")]
        success_threshold: u32,

        /// Roll back above this error rate (0.0-1.0).
        #[arg(long)]
        max_error_rate: Option<f64>,

        /// Roll back above this p99 latency.
        #[arg(long)]
        max_p99_ms: Option<f64>,

        /// Health endpoint path on the new slot.
        #[arg(long)]
        health_endpoint: Option<String>,

        /// Backend address of the new slot (overrides the server template).
        #[arg(long)]
        backend_url: Option<String>,

        /// Seconds between event polls.
        #[arg(long, default_value = "2")]
        poll_secs: u64,
    },

    /// Follow an existing rollout attempt.
    Watch {
        #[arg(long, default_value = "http://localhost:8470")]
        server: String,

        #[arg(long)]
        attempt: String,

        /// Seconds between event polls.
        #[arg(long, default_value = "2")]
        poll_secs: u64,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,slotwayd=debug,slotway=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = SlotwayConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            run_serve(config).await
        }
        Command::Deploy {
            server,
            deployment,
            plugin,
            version,
            strategy,
            initial_percent,
            increment_percent,
            interval_secs,
            success_threshold,
            max_error_rate,
            max_p99_ms,
            health_endpoint,
            backend_url,
            poll_secs,
        } => {
            let strategy = match strategy {
                StrategyArg::Immediate => RolloutStrategy::Immediate,
                StrategyArg::BlueGreen => RolloutStrategy::BlueGreen,
                StrategyArg::Canary => RolloutStrategy::Canary(CanaryConfig {
                    initial_percent,
                    increment_percent,
                    interval_secs,
                    success_threshold,
                }),
            };
            let mut plan = RolloutPlan::new(&deployment, &plugin, &version, strategy);
            if let Some(rate) = max_error_rate {
                plan.rollback.max_error_rate = rate;
            }
            if let Some(p99) = max_p99_ms {
                plan.rollback.max_p99_latency_ms = p99;
            }
            if let Some(endpoint) = health_endpoint {
                plan.health_check.endpoint = endpoint;
            }
            plan.backend_url = backend_url;
            plan.validate()?;

            let client = Client::new(&server)?;
            let started = client.start_rollout(&plan).await?;
            println!("rollout {} started for {}", started.attempt_id, started.deployment_id);
            follow(&client, &started.attempt_id, poll_secs).await
        }
        Command::Watch {
            server,
            attempt,
            poll_secs,
        } => {
            let client = Client::new(&server)?;
            follow(&client, &attempt, poll_secs).await
        }
    }
}

async fn run_serve(config: SlotwayConfig) -> anyhow::Result<()> {
    info!(
        port = config.server.port,
        data_dir = ?config.server.data_dir,
        "slotway daemon starting"
    );
    let daemon = Daemon::open(config)?;
    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
}

/// Print events until the terminal one; error unless the rollout completed.
async fn follow(client: &Client, attempt: &str, poll_secs: u64) -> anyhow::Result<()> {
    let terminal = client
        .follow(attempt, Duration::from_secs(poll_secs.max(1)), |event| {
            println!("{}", format_event(event));
        })
        .await?;
    ensure_completed(&terminal)
}
