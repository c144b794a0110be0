//! Bet ledger node: membership and authenticated messaging, the pending
//! transaction pool, and the proof-of-work consensus engine.
//!
//! Used by the `node` binary and by the multi-node integration tests.

pub mod config;
pub mod engine;
pub mod handler;
pub mod mempool;
pub mod rendezvous;
pub mod transport;
pub mod util;

use anyhow::{Context, Result};
use betlib::crypto::PrivateKey;
use config::NodeConfig;
use engine::ConsensusEngine;
use mempool::Mempool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use transport::{Broadcast, Transport};

pub use betlib;

/// A running node and its background tasks.
pub struct Node {
    pub transport: Arc<Transport>,
    pub mempool: Arc<Mempool>,
    pub engine: Arc<ConsensusEngine>,
    config: NodeConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Brings a node up. Failing to bind the peer port, to register with the
    /// rendezvous service or to read the chain file is fatal.
    pub async fn start(config: NodeConfig, private_key: PrivateKey) -> Result<Node> {
        let transport = Arc::new(Transport::new(&config, private_key));
        let outbound: Arc<dyn Broadcast> = transport.clone();
        let mempool = Arc::new(Mempool::new(Arc::clone(&outbound)));

        let chain = util::load_chain(&config)?;
        mempool.reconcile(chain.transactions());
        let (engine, mined) =
            ConsensusEngine::new(chain, Arc::clone(&mempool), outbound, config.batch_size);
        handler::register_handlers(&transport, &engine, &mempool);

        let mut tasks = Vec::new();
        let listener = transport.bind().await?;
        tasks.push(tokio::spawn(Arc::clone(&transport).serve(listener)));

        transport.register_with_rendezvous().await?;
        let known = transport
            .refresh_peer_list()
            .await
            .context("fetching the initial peer list")?;
        info!(known, "initial peer list");

        let announcer = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move { announcer.announce_mined(mined).await }));
        tasks.push(tokio::spawn(util::refresh(
            Arc::clone(&transport),
            config.refresh_interval(),
        )));
        if let Some(path) = &config.chain_file {
            tasks.push(tokio::spawn(util::save(
                Arc::clone(&engine),
                path.clone(),
                config.save_interval(),
            )));
        }

        engine.bootstrap(config.sync_timeout()).await;
        Ok(Node {
            transport,
            mempool,
            engine,
            config,
            tasks,
        })
    }

    /// Stops mining and the background tasks, then saves the chain once more.
    /// Inbound messages that are still in flight can no longer restart the
    /// miner, and dropping the handlers breaks the transport/engine cycle.
    pub async fn shutdown(self) {
        self.engine.stop_mining().await;
        for task in &self.tasks {
            task.abort();
        }
        self.transport.clear_handlers();
        if let Some(path) = &self.config.chain_file {
            util::save_now(&self.engine, path).await;
        }
        info!("node stopped");
    }
}
