use crate::config::NodeConfig;
use crate::rendezvous::{RendezvousClient, connect_from};
use anyhow::{Context, Result};
use betlib::crypto::{PrivateKey, PublicKey};
use betlib::network::{Frame, Inbound, MessageType, send_pong, split_payload};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Outcome of the latest delivery attempt to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Unknown,
    Reachable,
    Unreachable,
}

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub host: String,
    pub public_key: Option<PublicKey>,
    pub liveness: Liveness,
}

impl PeerRecord {
    fn new(host: &str) -> Self {
        PeerRecord {
            host: host.to_string(),
            public_key: None,
            liveness: Liveness::Unknown,
        }
    }
}

/// Callback for one message type, invoked with the body after the tag and
/// the sender's host identifier.
pub type Handler = Arc<dyn Fn(Vec<u8>, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// The outbound half of the transport, as seen by the pool and the engine.
pub trait Broadcast: Send + Sync {
    /// Signs `payload` and delivers it to `target`, or to every known peer.
    /// Returns how many peers took the frame.
    fn broadcast<'a>(&'a self, payload: Vec<u8>, target: Option<&'a str>) -> BoxFuture<'a, usize>;
    fn peer_count(&self) -> usize;
}

/// Membership table plus framing and authentication of every message.
pub struct Transport {
    host: String,
    peer_port: u16,
    io_timeout: Duration,
    private_key: PrivateKey,
    rendezvous: RendezvousClient,
    peers: DashMap<String, PeerRecord>,
    handlers: DashMap<MessageType, Handler>,
}

impl Transport {
    pub fn new(config: &NodeConfig, private_key: PrivateKey) -> Self {
        Transport {
            host: config.host.clone(),
            peer_port: config.peer_port,
            io_timeout: config.io_timeout(),
            private_key,
            rendezvous: RendezvousClient::new(
                &config.host,
                config.tracker.clone(),
                config.io_timeout(),
            ),
            peers: DashMap::new(),
            handlers: DashMap::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.host, self.peer_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding the peer port on {addr}"))?;
        info!(%addr, "listening for peers");
        Ok(listener)
    }

    pub async fn register_with_rendezvous(&self) -> Result<()> {
        self.rendezvous.register(&self.public_key()).await?;
        info!(host = %self.host, "registered with the rendezvous service");
        Ok(())
    }

    /// Merges the rendezvous peer list into the membership table and returns
    /// how many peers were new. Peers missing from the list are kept.
    pub async fn refresh_peer_list(&self) -> Result<usize> {
        let hosts = self.rendezvous.peer_list().await?;
        let added = hosts.iter().filter(|host| self.add_peer(host)).count();
        if added > 0 {
            info!(added, known = self.peers.len(), "peer list refreshed");
        }
        Ok(added)
    }

    /// Returns false for ourselves and for peers we already know.
    pub fn add_peer(&self, host: &str) -> bool {
        if host == self.host || self.peers.contains_key(host) {
            return false;
        }
        self.peers.insert(host.to_string(), PeerRecord::new(host));
        true
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.host.cmp(&b.host));
        peers
    }

    /// Installs the callback for `message_type`, replacing any earlier one.
    pub fn register_handler<F, Fut>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(Vec<u8>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |body, sender| handler(body, sender).boxed());
        if self.handlers.insert(message_type, handler).is_some() {
            debug!(?message_type, "handler replaced");
        }
    }

    /// Drops every callback. Handlers capture the components they feed, so
    /// this releases them once the node shuts down.
    pub fn clear_handlers(&self) {
        self.handlers.clear();
    }

    /// Best-effort delivery: each target gets its own short-lived connection,
    /// failures are logged and only mark that peer unreachable.
    pub async fn send_signed(&self, data: Vec<u8>, target: Option<&str>) -> Result<usize> {
        let frame = Frame::sign(data, &self.private_key)?;
        let bytes = frame.encode();
        let targets: Vec<String> = match target {
            Some(host) => vec![host.to_string()],
            None => self.peers.iter().map(|p| p.key().clone()).collect(),
        };
        let results = join_all(targets.iter().map(|host| self.deliver(host, &bytes))).await;

        let mut delivered = 0;
        for (host, result) in targets.iter().zip(results) {
            let liveness = match result {
                Ok(()) => {
                    delivered += 1;
                    Liveness::Reachable
                }
                Err(e) => {
                    warn!(peer = %host, error = %e, "delivery failed");
                    Liveness::Unreachable
                }
            };
            if let Some(mut peer) = self.peers.get_mut(host) {
                peer.liveness = liveness;
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, host: &str, bytes: &[u8]) -> Result<()> {
        let mut stream = connect_from(&self.host, host, self.peer_port, self.io_timeout).await?;
        timeout(self.io_timeout, async {
            stream.write_all(bytes).await?;
            stream.shutdown().await
        })
        .await
        .context("write timed out")??;
        Ok(())
    }

    /// Accept loop. Every connection is handled on its own task; aborting the
    /// loop aborts the connections still in flight.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let transport = Arc::clone(&self);
                        connections.spawn(async move { transport.on_connection(stream, addr).await });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        }
    }

    pub async fn on_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let sender = addr.ip().to_string();
        let inbound = match timeout(self.io_timeout, Frame::receive_async(&mut stream)).await {
            Ok(Ok(inbound)) => inbound,
            Ok(Err(e)) => {
                warn!(peer = %sender, error = %e, "unreadable frame");
                return;
            }
            Err(_) => {
                warn!(peer = %sender, "frame read timed out");
                return;
            }
        };
        let frame = match inbound {
            Inbound::Ping => {
                debug!(peer = %sender, "answering ping");
                if let Err(e) = send_pong(&mut stream).await {
                    debug!(peer = %sender, error = %e, "pong not delivered");
                }
                return;
            }
            Inbound::Signed(frame) => frame,
        };
        drop(stream);

        if !self.authenticate(&sender, &frame).await {
            warn!(peer = %sender, "signature check failed, message dropped");
            return;
        }
        let (message_type, body) = match split_payload(&frame.data) {
            Ok(split) => split,
            Err(e) => {
                warn!(peer = %sender, error = %e, "malformed payload dropped");
                return;
            }
        };
        let handler = self.handlers.get(&message_type).map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => handler(body.to_vec(), sender).await,
            None => debug!(?message_type, "no handler registered"),
        }
    }

    /// Verifies against the cached key first. A miss or a mismatch asks the
    /// rendezvous service, since the peer may have restarted with a new key.
    async fn authenticate(&self, sender: &str, frame: &Frame) -> bool {
        let cached = self.peers.get(sender).and_then(|p| p.public_key.clone());
        if let Some(key) = &cached {
            if frame.verify(key) {
                return true;
            }
        }
        let fresh = match self.rendezvous.lookup(sender).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(peer = %sender, "sender unknown to the rendezvous service");
                return false;
            }
            Err(e) => {
                warn!(peer = %sender, error = %e, "key lookup failed");
                return false;
            }
        };
        if cached.as_ref() == Some(&fresh) || !frame.verify(&fresh) {
            return false;
        }
        if sender != self.host {
            self.peers
                .entry(sender.to_string())
                .or_insert_with(|| PeerRecord::new(sender))
                .public_key = Some(fresh);
        }
        true
    }
}

impl Broadcast for Transport {
    fn broadcast<'a>(&'a self, payload: Vec<u8>, target: Option<&'a str>) -> BoxFuture<'a, usize> {
        async move {
            match self.send_signed(payload, target).await {
                Ok(delivered) => delivered,
                Err(e) => {
                    warn!(error = %e, "message not sent");
                    0
                }
            }
        }
        .boxed()
    }

    fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// Records every payload instead of sending it.
    #[derive(Default)]
    pub struct Recorder {
        pub peers: usize,
        pub sent: Mutex<Vec<(Vec<u8>, Option<String>)>>,
    }

    impl Recorder {
        pub fn with_peers(peers: usize) -> Arc<Self> {
            Arc::new(Recorder {
                peers,
                sent: Mutex::new(Vec::new()),
            })
        }
        pub fn sent(&self) -> Vec<(Vec<u8>, Option<String>)> {
            self.sent.lock().clone()
        }
    }

    impl Broadcast for Recorder {
        fn broadcast<'a>(
            &'a self,
            payload: Vec<u8>,
            target: Option<&'a str>,
        ) -> BoxFuture<'a, usize> {
            self.sent.lock().push((payload, target.map(str::to_string)));
            futures::future::ready(self.peers).boxed()
        }
        fn peer_count(&self) -> usize {
            self.peers
        }
    }
}
