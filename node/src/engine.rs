use crate::mempool::Mempool;
use crate::transport::Broadcast;
use betlib::MAX_NONCE;
use betlib::network::Message;
use betlib::sha256::Hash;
use betlib::types::{Block, BlockHeader, Blockchain};
use betlib::util::unix_now;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Syncing,
    Mining,
}

struct ChainState {
    chain: Blockchain,
    phase: Phase,
}

struct MiningTask {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the local chain and the mining loop.
///
/// Lock order is chain state, then pool. The miner slot is only taken while
/// no chain lock is held. Once [`ConsensusEngine::stop_mining`] ran, no path
/// starts the loop again.
pub struct ConsensusEngine {
    state: RwLock<ChainState>,
    miner: Mutex<Option<MiningTask>>,
    halted: AtomicBool,
    sync_fallback: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    mempool: Arc<Mempool>,
    outbound: Arc<dyn Broadcast>,
    batch_size: usize,
    mined: mpsc::UnboundedSender<Block>,
}

impl ConsensusEngine {
    /// Blocks mined locally come out of the returned receiver; feed it to
    /// [`ConsensusEngine::announce_mined`] to gossip them.
    pub fn new(
        chain: Blockchain,
        mempool: Arc<Mempool>,
        outbound: Arc<dyn Broadcast>,
        batch_size: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Block>) {
        let (mined, receiver) = mpsc::unbounded_channel();
        let engine = ConsensusEngine {
            state: RwLock::new(ChainState {
                chain,
                phase: Phase::Syncing,
            }),
            miner: Mutex::new(None),
            halted: AtomicBool::new(false),
            sync_fallback: parking_lot::Mutex::new(None),
            mempool,
            outbound,
            batch_size,
            mined,
        };
        (Arc::new(engine), receiver)
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase
    }

    pub async fn block_height(&self) -> u64 {
        self.state.read().await.chain.block_height()
    }

    pub async fn tip_hash(&self) -> Hash {
        self.state.read().await.chain.tip_hash()
    }

    pub async fn snapshot(&self) -> Blockchain {
        self.state.read().await.chain.clone()
    }

    /// Mines straight away when alone, otherwise asks peers for their chains
    /// and falls back to mining if nobody answers within `sync_timeout`.
    pub async fn bootstrap(self: &Arc<Self>, sync_timeout: Duration) {
        if self.outbound.peer_count() == 0 {
            info!("no peers known, mining from our own tip");
            self.restart_mining().await;
            return;
        }
        self.state.write().await.phase = Phase::Syncing;
        self.request_chain().await;

        let engine = Arc::clone(self);
        let fallback = tokio::spawn(async move {
            tokio::time::sleep(sync_timeout).await;
            if engine.phase().await == Phase::Syncing && !engine.is_halted() {
                warn!("no usable chain received, mining from our own tip");
                engine.restart_mining().await;
            }
        });
        if let Some(previous) = self.sync_fallback.lock().replace(fallback) {
            previous.abort();
        }
        if self.is_halted() {
            // stop_mining ran while we were requesting the chain
            self.abort_sync_fallback();
        }
    }

    pub async fn request_chain(&self) {
        match Message::ChainRequest.encode() {
            Ok(payload) => {
                let delivered = self.outbound.broadcast(payload, None).await;
                debug!(delivered, "chain requested");
            }
            Err(e) => error!(error = %e, "chain request not encodable"),
        }
    }

    pub async fn handle_download_request(&self, sender: String) {
        let encoded = self.state.read().await.chain.encode();
        let payload = match encoded.and_then(|blocks| Message::ChainResponse(blocks).encode()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "chain not encodable");
                return;
            }
        };
        let delivered = self.outbound.broadcast(payload, Some(&sender)).await;
        debug!(peer = %sender, delivered, "chain sent");
    }

    pub async fn handle_download_response(self: &Arc<Self>, body: Vec<u8>, sender: String) {
        let replaced = {
            let mut state = self.state.write().await;
            let candidate = Blockchain::from_download(state.chain.difficulty(), &body);
            let offered = candidate.block_height();
            let ours = state.chain.block_height();
            if state.chain.adopt(candidate) {
                self.mempool.reconcile(state.chain.transactions());
                info!(peer = %sender, height = offered, replaced = ours, "adopted a longer chain");
                true
            } else {
                debug!(peer = %sender, offered, ours, "kept our chain");
                false
            }
        };
        if replaced {
            self.restart_mining().await;
        }
    }

    /// A block that does not extend our tip triggers a chain request, since
    /// the sender may be on a longer fork.
    pub async fn handle_new_block(self: &Arc<Self>, body: Vec<u8>, sender: String) {
        let block = match Block::decode(&body) {
            Ok(block) => block,
            Err(e) => {
                warn!(peer = %sender, error = %e, "malformed block dropped");
                return;
            }
        };
        let hash = block.hash();
        let appended = {
            let mut state = self.state.write().await;
            match state.chain.append(block) {
                Ok(()) => {
                    self.mempool.reconcile(state.chain.transactions());
                    info!(peer = %sender, %hash, height = state.chain.block_height(), "block accepted");
                    true
                }
                Err(e) => {
                    info!(peer = %sender, reason = %e, "block does not extend our tip");
                    false
                }
            }
        };
        if appended {
            self.restart_mining().await;
        } else {
            self.request_chain().await;
        }
    }

    /// Stops the running loop, waits for it to exit, then mines from the
    /// current tip. Concurrent callers queue on the miner slot.
    pub async fn restart_mining(self: &Arc<Self>) {
        let mut miner = self.miner.lock().await;
        if self.is_halted() {
            debug!("mining halted, restart ignored");
            return;
        }
        if let Some(task) = miner.take() {
            join_miner(task).await;
        }
        self.state.write().await.phase = Phase::Mining;

        let stop = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let spawned = std::thread::Builder::new()
            .name("miner".to_string())
            .spawn(move || engine.mine(&flag));
        match spawned {
            Ok(handle) => *miner = Some(MiningTask { stop, handle }),
            Err(e) => error!(error = %e, "could not start the mining thread"),
        }
    }

    /// Halts mining for good. The running loop is joined and any later
    /// restart, including a pending sync fallback, is ignored.
    pub async fn stop_mining(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.abort_sync_fallback();
        if let Some(task) = self.miner.lock().await.take() {
            join_miner(task).await;
        }
    }

    pub async fn is_mining(&self) -> bool {
        self.miner.lock().await.is_some()
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn abort_sync_fallback(&self) {
        if let Some(fallback) = self.sync_fallback.lock().take() {
            fallback.abort();
        }
    }

    /// Gossips every locally mined block. Runs until the engine is dropped.
    pub async fn announce_mined(&self, mut mined: mpsc::UnboundedReceiver<Block>) {
        while let Some(block) = mined.recv().await {
            match Message::NewBlock(block).encode() {
                Ok(payload) => {
                    let delivered = self.outbound.broadcast(payload, None).await;
                    debug!(delivered, "block announced");
                }
                Err(e) => warn!(error = %e, "mined block not encodable"),
            }
        }
    }

    fn mine(&self, stop: &AtomicBool) {
        let (mut prev, difficulty) = {
            let state = self.state.blocking_read();
            (state.chain.tip_hash(), state.chain.difficulty())
        };
        debug!(%prev, difficulty, "mining started");
        let mut rng = rand::thread_rng();
        while !stop.load(Ordering::Relaxed) {
            let header = BlockHeader::new(prev, unix_now() as u32, rng.gen_range(1..=MAX_NONCE));
            if !header.meets_difficulty(difficulty) {
                continue;
            }

            let mut state = self.state.blocking_write();
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if state.chain.tip_hash() != prev {
                // the tip moved while we searched
                prev = state.chain.tip_hash();
                continue;
            }
            let batch = self.mempool.collect(self.batch_size);
            let block = Block::new(header, batch);
            if let Err(e) = state.chain.append(block.clone()) {
                error!(error = %e, "mined block rejected by our own chain");
                continue;
            }
            self.mempool.reconcile(state.chain.transactions());
            prev = block.hash();
            info!(
                hash = %prev,
                height = state.chain.block_height(),
                transactions = block.tx_count(),
                "mined a block"
            );
            drop(state);
            if self.mined.send(block).is_err() {
                warn!("nobody announces mined blocks");
            }
        }
        debug!("mining stopped");
    }
}

async fn join_miner(task: MiningTask) {
    task.stop.store(true, Ordering::Relaxed);
    match tokio::task::spawn_blocking(move || task.handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => error!("mining thread panicked"),
        Err(e) => error!(error = %e, "could not join the mining thread"),
    }
}
