//! Relay Emit - publishes numbered test messages under a severity key.
//!
//! Usage: `relay-emit <severity> [--count N] [--exchange NAME]`
//!
//! Every message is `"[i] - Automated test message"` for i in 1..=N.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};

use relay::broker::amqp::AmqpConnection;
use relay::broker::Connection;
use relay::{logging, Config, Emitter, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "relay-emit", about = "Publish test messages to a topic exchange")]
struct Args {
    /// Routing key, e.g. `error` or `kern.critical`
    severity: String,

    /// Number of messages to send
    #[arg(short = 'n', long, env = "MESSAGE_COUNT")]
    count: Option<u32>,

    /// Exchange to publish to
    #[arg(short, long, env = "EXCHANGE_NAME")]
    exchange: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(LogFormat::from_env());

    let mut config = Config::from_env();

    if let Some(count) = args.count {
        config.message_count = count;
    }
    if let Some(exchange) = args.exchange {
        config.exchange_name = exchange;
    }

    info!(
        broker = %config.broker_address(),
        exchange = %config.exchange_name,
        severity = %args.severity,
        count = config.message_count,
        "emitter_starting"
    );

    run(config, &args.severity).await
}

async fn run(config: Config, severity: &str) -> Result<()> {
    let connection = AmqpConnection::connect(&config.amqp_url)
        .await
        .context("Failed to connect to RabbitMQ")?;

    let emitter = Emitter::open(&connection, config.emitter_settings())
        .await
        .context("Failed to set up emitter")?;

    let mut failed = 0u32;
    for i in 1..=config.message_count {
        let body = format!("[{i}] - Automated test message");
        if let Err(e) = emitter.publish(body, severity).await {
            error!(index = i, error = %e, "message_not_sent");
            failed += 1;
        }
    }

    emitter.close().await.context("Failed to close channel")?;
    connection
        .close()
        .await
        .context("Failed to close connection")?;

    info!(
        sent = config.message_count - failed,
        failed,
        "emitter_finished"
    );

    if failed > 0 {
        bail!("{failed} of {} messages were not published", config.message_count);
    }
    Ok(())
}
