//! Relay Listen - binds routing patterns and logs every matching message.
//!
//! Usage: `relay-listen [PATTERN]... [--queue NAME]`
//!
//! With no patterns the queue receives everything (`#`). Without a queue
//! name an exclusive anonymous queue is used, which disappears on exit.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use relay::broker::amqp::AmqpConnection;
use relay::broker::Connection;
use relay::shutdown::shutdown_signal;
use relay::{logging, Config, Consumer, ListenError, LogFormat, LogHandler};

#[derive(Debug, Parser)]
#[command(name = "relay-listen", about = "Consume messages matching routing patterns")]
struct Args {
    /// Binding patterns; `*` matches one word, `#` zero or more
    patterns: Vec<String>,

    /// Shared queue to consume from instead of a private one
    #[arg(short, long, env = "QUEUE_NAME")]
    queue: Option<String>,

    /// Exchange to bind to
    #[arg(short, long, env = "EXCHANGE_NAME")]
    exchange: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(LogFormat::from_env());

    let mut config = Config::from_env();

    if args.queue.is_some() {
        config.queue_name = args.queue;
    }
    if let Some(exchange) = args.exchange {
        config.exchange_name = exchange;
    }

    info!(
        broker = %config.broker_address(),
        exchange = %config.exchange_name,
        queue = config.queue_name.as_deref().unwrap_or("<anonymous>"),
        patterns = ?args.patterns,
        "listener_starting"
    );

    run(config, &args.patterns).await
}

async fn run(config: Config, patterns: &[String]) -> Result<()> {
    let connection = AmqpConnection::connect(&config.amqp_url)
        .await
        .context("Failed to connect to RabbitMQ")?;

    let mut consumer = Consumer::open(&connection, config.consumer_settings())
        .await
        .context("Failed to set up consumer")?;

    let outcome = tokio::select! {
        _ = shutdown_signal() => None,
        result = consumer.listen(patterns, LogHandler) => match result {
            Ok(never) => match never {},
            Err(e) => Some(e),
        },
    };

    match outcome {
        None => {
            info!("listener_shutting_down");
            if let Err(e) = consumer.close().await {
                warn!(error = %e, "consumer_close_failed");
            }
            connection
                .close()
                .await
                .context("Failed to close connection")?;
            Ok(())
        }
        Some(ListenError::Cancelled) => {
            warn!("listener_cancelled_by_broker");
            Ok(())
        }
        Some(e) => Err(e).context("Listener stopped"),
    }
}
