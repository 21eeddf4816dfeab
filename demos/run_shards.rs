//! Connect a shard pool to the live gateway and log what arrives.
//!
//! USAGE:
//!   SHARDWIRE_TOKEN=... [SHARDWIRE_SHARD_COUNT=2] cargo run --example run_shards
//!
//! Any `SHARDWIRE_*` variable (or a `.env` file) overrides the defaults. `RUST_LOG` controls
//! log verbosity (default `info`).

use futures_util::StreamExt;
use shardwire::{Client, ClientConfig, ClientResult, LifecycleKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ClientResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ClientConfig::from_env()?;
    let client = Client::connect_with(config)?;

    let mut lifecycle = client.gateway().lifecycle();
    tokio::spawn(async move {
        while let Some(notice) = lifecycle.next().await {
            match notice.kind {
                LifecycleKind::Fatal { reason, authentication } => {
                    warn!(shard = notice.shard_id, authentication, %reason, "shard failed")
                }
                kind => info!(shard = notice.shard_id, ?kind, "lifecycle"),
            }
        }
    });

    let mut events = client.gateway().events();
    client.start().await?;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                info!(
                    shard = event.shard_id,
                    sequence = event.sequence,
                    kind = %event.kind,
                    "dispatch"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received; shutting down");
                break;
            }
        }
    }

    client.shutdown().await
}
