use anyhow::Context;
use dotenv::dotenv;
use std::sync::Arc;
use tracing::{info, warn};

use moneystream::logging::init_logging;
use moneystream::{
    Amount, Config, Connection, ConnectionEvent, MockSigner, StaticLink, Stream,
};

const USAGE: &str = "usage: moneystream-demo [--config <file.yaml|file.json>] [AMOUNT...]";

struct Args {
    config_path: Option<String>,
    amounts: Vec<Amount>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut amounts = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(args.next().context(USAGE)?);
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            amount => amounts.push(
                amount
                    .parse()
                    .with_context(|| format!("invalid amount '{}'\n{}", amount, USAGE))?,
            ),
        }
    }
    if amounts.is_empty() {
        amounts.push(100);
    }
    Ok(Args {
        config_path,
        amounts,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = parse_args()?;

    let config = match &args.config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => Config::from_env().context("failed to load config from environment")?,
    };
    init_logging(&config.logging)?;

    let signer = Arc::new(MockSigner::new());
    let connection = Connection::new(
        config.connection.clone(),
        signer.clone(),
        Arc::new(StaticLink::established()),
    )?;
    let mut events = connection.subscribe();

    let mut streams: Vec<Stream> = Vec::with_capacity(args.amounts.len());
    for amount in &args.amounts {
        let stream = connection.create_stream().await?;
        stream.set_amount_available_to_send(*amount)?;
        streams.push(stream);
    }

    let expected: Amount = args.amounts.iter().sum();
    let mut stalled_rounds = 0usize;
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::OutgoingMoney { stream_id, amount }) => {
                info!(
                    "Stream {} delivered {}",
                    stream_id,
                    connection.source_asset().format(amount)
                );
            }
            Ok(ConnectionEvent::SendLoopFinished) => {
                let pending: Amount = streams
                    .iter()
                    .map(|stream| stream.amount_available_to_send())
                    .sum();
                if pending == 0 || connection.total_delivered().await >= expected {
                    break;
                }
                stalled_rounds += 1;
                if stalled_rounds > config.connection.retry.max_attempts {
                    warn!("Giving up with {} still pending", pending);
                    break;
                }
                warn!("Send loop paused with {} still pending, restarting", pending);
                connection.start_send_loop().await;
            }
            Ok(ConnectionEvent::Closed { cause }) => {
                warn!("Connection closed early: {:?}", cause);
                break;
            }
            Err(e) => {
                warn!("Stopped listening for connection events: {}", e);
                break;
            }
        }
    }

    connection.end().await?;
    println!(
        "connection {} delivered {} in {} transaction(s)",
        connection.id(),
        connection.total_delivered_formatted().await,
        signer.call_count()
    );
    Ok(())
}
