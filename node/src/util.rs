use crate::config::NodeConfig;
use crate::engine::ConsensusEngine;
use crate::transport::Transport;
use anyhow::{Context, Result};
use betlib::crypto::PrivateKey;
use betlib::types::Blockchain;
use betlib::util::Saveable;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info, warn};

/// Reads the configured chain file, re-verifying every block. A missing file
/// gives an empty chain.
pub fn load_chain(config: &NodeConfig) -> Result<Blockchain> {
    let Some(path) = &config.chain_file else {
        return Ok(Blockchain::new(config.difficulty_bits));
    };
    if !path.exists() {
        info!(path = %path.display(), "no chain file yet, starting empty");
        return Ok(Blockchain::new(config.difficulty_bits));
    }
    let stored = Blockchain::load_from_file(path)
        .with_context(|| format!("loading chain file {}", path.display()))?;
    let stored_height = stored.block_height();
    let chain = Blockchain::from_blocks(config.difficulty_bits, stored.into_blocks());
    if chain.block_height() < stored_height {
        warn!(
            kept = chain.block_height(),
            stored = stored_height,
            "chain file truncated at its first invalid block"
        );
    }
    info!(height = chain.block_height(), "chain loaded");
    Ok(chain)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    PrivateKey::load_from_file(path)
        .with_context(|| format!("loading private key {}", path.display()))
}

/// Periodically merges the rendezvous peer list into the membership table.
pub async fn refresh(transport: Arc<Transport>, interval: time::Duration) {
    let mut interval = time::interval(interval);
    // startup already did the first refresh
    interval.tick().await;
    loop {
        interval.tick().await;
        match transport.refresh_peer_list().await {
            Ok(added) => debug!(added, "peer list refreshed"),
            Err(e) => warn!(error = %e, "peer list refresh failed"),
        }
    }
}

pub async fn save(engine: Arc<ConsensusEngine>, path: PathBuf, interval: time::Duration) {
    let mut interval = time::interval(interval);
    loop {
        interval.tick().await;
        save_now(&engine, &path).await;
    }
}

pub async fn save_now(engine: &ConsensusEngine, path: &Path) {
    let chain = engine.snapshot().await;
    match chain.save_to_file(path) {
        Ok(()) => debug!(height = chain.block_height(), path = %path.display(), "chain saved"),
        Err(e) => warn!(error = %e, path = %path.display(), "saving the chain failed"),
    }
}
