use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use account_delta_scanner::aggregate::{block_range, AggregateError, Aggregator};
use account_delta_scanner::config::{Config, DEFAULT_BLOCK_COUNT};
use account_delta_scanner::quantity::format_units;
use account_delta_scanner::rpc::{GetBlockClient, LedgerNode};

/// Finds the account with the largest net value movement over the latest blocks.
#[derive(Parser, Debug)]
#[clap(version)]
pub struct Cli {
    /// number of blocks back from the chain head to scan
    #[clap(value_parser, default_value_t = DEFAULT_BLOCK_COUNT)]
    blocks: u64,
    /// path to config file
    #[clap(long, value_parser)]
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = _main().await {
        if is_cancelled(&err) {
            tracing::warn!("exited prematurely");
        } else {
            tracing::error!("{:#}", err);
        }
        std::process::exit(1);
    }
}

/// An interrupted run unwinds normally, it is not a failure to report.
fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AggregateError>()
        .map_or(false, AggregateError::is_cancelled)
}

async fn _main() -> anyhow::Result<()> {
    // Start logging setup block
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry().with(fmt_layer).init();

    let Cli { blocks, config_path } = Cli::parse();

    let config = Config::load(config_path.as_deref())?;
    let api_key = config.api_key()?;
    let node = GetBlockClient::new(config.endpoint.clone(), &api_key)?;

    let head = node
        .current_height()
        .await
        .context("couldn't get chain head")?;
    let heights = block_range(head, blocks);
    let block_count = heights.len();
    tracing::info!(head, blocks = block_count, "scanning blocks");

    let token = CancellationToken::new();
    let shutdown = tokio::spawn(cancel_on_shutdown_signal(token.clone()));

    let result = Aggregator::new(Arc::new(node), token)
        .with_max_in_flight(config.max_in_flight)
        .run(heights)
        .await;
    shutdown.abort();
    let deltas = result?;

    let max = deltas.max_abs();
    tracing::info!(accounts = deltas.len(), "resolved largest delta");
    match max.account {
        Some(account) => println!(
            "account {} has the largest delta of {} ETH across {} blocks",
            account,
            format_units(&max.delta),
            block_count
        ),
        None => println!(
            "no account had a non-zero delta across {} blocks",
            block_count
        ),
    }

    Ok(())
}

async fn cancel_on_shutdown_signal(token: CancellationToken) {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("couldn't listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("couldn't listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    tracing::warn!("cancelling all the work by user request");
    token.cancel();
}
