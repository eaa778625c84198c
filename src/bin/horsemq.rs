//! horsemq – runs the queue engine from a TOML configuration.
//
//  $ horsemq start --config horsemq.toml
//  $ horsemq check --config horsemq.toml
use horsemq::config::ENV_CONFIG;
use horsemq::core::events::TracingEventSink;
use horsemq::logging::init_logging;
use horsemq::{load_config, Config, RiderBuilder};

use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "horsemq", version, about = "HorseMQ queue engine")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker and run until Ctrl-C.
    Start {
        /// Path to config TOML (env HORSEMQ_CONFIG overrides)
        #[arg(short, long, default_value = "horsemq.toml")]
        config: String,
    },
    /// Validate a configuration file and list the queues it declares.
    Check {
        #[arg(short, long, default_value = "horsemq.toml")]
        config: String,
    },
}

fn resolve(config: String) -> String {
    std::env::var(ENV_CONFIG).unwrap_or(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let cfg: Config = load_config(resolve(config))?;
            init_logging(&cfg.broker.log_level)?;
            run(cfg).await?;
        }
        Command::Check { config } => {
            let path = resolve(config);
            let cfg: Config = load_config(&path)?;
            println!("{path}: ok");
            println!(
                "auto queue creation: {}, default type: {:?}",
                cfg.broker.auto_queue_creation, cfg.queue_defaults.queue_type
            );
            for queue in &cfg.queues {
                println!(
                    "  {:<24} {:?} ack={:?} put_back={:?}",
                    queue.name, queue.options.queue_type, queue.options.acknowledge, queue.options.put_back
                );
            }
        }
    }
    Ok(())
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let (errors_tx, mut errors_rx) = tokio::sync::mpsc::unbounded_channel();
    let rider = RiderBuilder::from_config(&cfg)
        .event_sink(TracingEventSink)
        .error_sink(errors_tx)
        .build();

    for queue in &cfg.queues {
        rider.create_queue(&queue.name, Some(queue.options.clone()), None)?;
    }
    info!(queues = cfg.queues.len(), "horsemq started");

    let consume_errors = tokio::spawn(async move {
        while let Some(err) = errors_rx.recv().await {
            warn!(target: "horsemq::consume", "{err}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    rider.shutdown();
    drop(rider);
    consume_errors.abort();
    Ok(())
}
