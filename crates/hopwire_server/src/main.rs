//! Standalone rendezvous server: binds a TCP listener and exchanges
//! messages with every device that dials in.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hopwire::store::{MemoryAckStore, MemoryMessageStore};
use hopwire::{ExchangeConfig, ExchangeContext, PeerId, RendezvousServer};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hopwire=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    // Optional argument: path to a JSON config file.
    let config = match std::env::args().nth(1) {
        Some(path) => ExchangeConfig::load_or_default(&PathBuf::from(path)),
        None => ExchangeConfig::default(),
    };
    let own_id = PeerId::new(&config.server_id)?;

    warn!("using in-memory repositories - nothing will be persisted across restarts");
    let ctx = ExchangeContext::new(
        own_id,
        config.clone(),
        Arc::new(MemoryMessageStore::new()),
        Arc::new(MemoryAckStore::new()),
    );

    let server = RendezvousServer::bind(ctx, &config.server_addr).await?;
    info!(addr = %server.local_addr()?, "serving");
    server.run().await?;
    Ok(())
}
