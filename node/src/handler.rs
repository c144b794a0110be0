use crate::engine::ConsensusEngine;
use crate::mempool::Mempool;
use crate::transport::Transport;
use betlib::network::MessageType;
use std::sync::Arc;

/// Routes every authenticated message type to the engine or the pool.
pub fn register_handlers(transport: &Transport, engine: &Arc<ConsensusEngine>, mempool: &Arc<Mempool>) {
    let handler_engine = Arc::clone(engine);
    transport.register_handler(MessageType::ChainRequest, move |_, sender| {
        let engine = Arc::clone(&handler_engine);
        async move { engine.handle_download_request(sender).await }
    });

    let handler_engine = Arc::clone(engine);
    transport.register_handler(MessageType::ChainResponse, move |body, sender| {
        let engine = Arc::clone(&handler_engine);
        async move { engine.handle_download_response(body, sender).await }
    });

    let handler_engine = Arc::clone(engine);
    transport.register_handler(MessageType::NewBlock, move |body, sender| {
        let engine = Arc::clone(&handler_engine);
        async move { engine.handle_new_block(body, sender).await }
    });

    let handler_mempool = Arc::clone(mempool);
    transport.register_handler(MessageType::NewTransaction, move |body, sender| {
        let mempool = Arc::clone(&handler_mempool);
        async move { mempool.receive_remote(&body, &sender) }
    });
}
