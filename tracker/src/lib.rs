//! Rendezvous service: peers register their public key, look up each other's
//! keys and fetch the peer list. A poller drops peers that stop answering
//! liveness pings.

use anyhow::{Context, Result};
use betlib::crypto::PublicKey;
use betlib::network::{ACCEPTED, PERMISSION_DENIED, REJECTED, UNKNOWN, send_ping};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// a PEM key is a few hundred bytes
const MAX_REQUEST: u64 = 16 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TrackerConfig {
    pub host: String,
    pub register_port: u16,
    pub lookup_port: u16,
    pub list_port: u16,
    /// Port every peer listens on, used for liveness pings.
    pub peer_port: u16,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub io_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            host: "127.0.0.1".to_string(),
            register_port: betlib::DEFAULT_REGISTER_PORT,
            lookup_port: betlib::DEFAULT_LOOKUP_PORT,
            list_port: betlib::DEFAULT_LIST_PORT,
            peer_port: betlib::DEFAULT_PEER_PORT,
            ping_interval_secs: 10,
            ping_timeout_secs: 3,
            io_timeout_secs: 5,
        }
    }
}

impl TrackerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Registered peers by source IP, with the PEM key each one submitted.
#[derive(Debug, Default)]
pub struct Registry {
    peers: DashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn register(&self, host: &str, pem: String) {
        if self.peers.insert(host.to_string(), pem).is_some() {
            info!(peer = %host, "key replaced");
        } else {
            info!(peer = %host, "peer registered");
        }
    }
    pub fn key_of(&self, host: &str) -> Option<String> {
        self.peers.get(host).map(|pem| pem.value().clone())
    }
    pub fn is_registered(&self, host: &str) -> bool {
        self.peers.contains_key(host)
    }
    pub fn remove(&self, host: &str) -> bool {
        self.peers.remove(host).is_some()
    }
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        hosts.sort();
        hosts
    }
    pub fn len(&self) -> usize {
        self.peers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Register,
    Lookup,
    List,
}

/// The reply `requester` gets for `request` on `endpoint`.
pub fn respond(registry: &Registry, endpoint: Endpoint, requester: &str, request: &[u8]) -> Vec<u8> {
    match endpoint {
        Endpoint::Register => match PublicKey::from_pem_bytes(request).and_then(|key| key.to_pem()) {
            Ok(pem) => {
                registry.register(requester, pem);
                ACCEPTED.to_vec()
            }
            Err(e) => {
                warn!(peer = %requester, error = %e, "registration rejected");
                REJECTED.to_vec()
            }
        },
        Endpoint::Lookup => {
            if !registry.is_registered(requester) {
                return PERMISSION_DENIED.to_vec();
            }
            let wanted = String::from_utf8_lossy(request);
            match registry.key_of(wanted.trim()) {
                Some(pem) => pem.into_bytes(),
                None => UNKNOWN.to_vec(),
            }
        }
        Endpoint::List => {
            if !registry.is_registered(requester) {
                return REJECTED.to_vec();
            }
            let hosts = registry.hosts();
            let mut reply = format!("{}\n", hosts.len());
            for host in hosts {
                reply.push_str(&host);
                reply.push('\n');
            }
            reply.into_bytes()
        }
    }
}

/// A bound but not yet running tracker.
pub struct Tracker {
    config: TrackerConfig,
    registry: Arc<Registry>,
    listeners: Vec<(Endpoint, TcpListener)>,
}

impl Tracker {
    pub async fn bind(config: TrackerConfig) -> Result<Tracker> {
        let mut listeners = Vec::new();
        for (endpoint, port) in [
            (Endpoint::Register, config.register_port),
            (Endpoint::Lookup, config.lookup_port),
            (Endpoint::List, config.list_port),
        ] {
            let addr = format!("{}:{}", config.host, port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding the {endpoint:?} endpoint on {addr}"))?;
            info!(?endpoint, %addr, "endpoint listening");
            listeners.push((endpoint, listener));
        }
        Ok(Tracker {
            config,
            registry: Arc::new(Registry::new()),
            listeners,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Actual port of `endpoint`, useful when the config asked for port 0.
    pub fn port(&self, endpoint: Endpoint) -> Option<u16> {
        self.listeners
            .iter()
            .find(|(e, _)| *e == endpoint)
            .and_then(|(_, listener)| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Serves the three endpoints and polls peer liveness until aborted.
    pub async fn run(self) {
        let io_timeout = Duration::from_secs(self.config.io_timeout_secs);
        let mut tasks = JoinSet::new();
        for (endpoint, listener) in self.listeners {
            tasks.spawn(serve(listener, endpoint, Arc::clone(&self.registry), io_timeout));
        }
        tasks.spawn(poll_liveness(
            Arc::clone(&self.registry),
            self.config.peer_port,
            Duration::from_secs(self.config.ping_interval_secs),
            Duration::from_secs(self.config.ping_timeout_secs),
        ));
        while tasks.join_next().await.is_some() {}
    }
}

async fn serve(listener: TcpListener, endpoint: Endpoint, registry: Arc<Registry>, io_timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = handle(stream, addr, endpoint, &registry, io_timeout).await {
                        debug!(peer = %addr, ?endpoint, error = %e, "request abandoned");
                    }
                });
            }
            Err(e) => warn!(?endpoint, error = %e, "accept failed"),
        }
    }
}

async fn handle(
    mut stream: TcpStream,
    addr: SocketAddr,
    endpoint: Endpoint,
    registry: &Registry,
    io_timeout: Duration,
) -> Result<()> {
    let requester = addr.ip().to_string();
    let mut request = Vec::new();
    timeout(io_timeout, (&mut stream).take(MAX_REQUEST).read_to_end(&mut request))
        .await
        .context("request timed out")??;
    let reply = respond(registry, endpoint, &requester, &request);
    timeout(io_timeout, async {
        stream.write_all(&reply).await?;
        stream.shutdown().await
    })
    .await
    .context("reply timed out")??;
    Ok(())
}

/// Pings a peer's listening port with the zero-length frame.
pub async fn ping(host: &str, port: u16, limit: Duration) -> bool {
    let probe = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        send_ping(&mut stream).await.map_err(anyhow::Error::from)
    };
    matches!(timeout(limit, probe).await, Ok(Ok(true)))
}

async fn poll_liveness(registry: Arc<Registry>, peer_port: u16, interval: Duration, limit: Duration) {
    let mut interval = tokio::time::interval(interval);
    loop {
        interval.tick().await;
        let mut probes = JoinSet::new();
        for host in registry.hosts() {
            probes.spawn(async move {
                let alive = ping(&host, peer_port, limit).await;
                (host, alive)
            });
        }
        while let Some(result) = probes.join_next().await {
            let Ok((host, alive)) = result else { continue };
            if !alive && registry.remove(&host) {
                info!(peer = %host, "peer stopped answering pings, removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use betlib::crypto::PrivateKey;

    fn pem() -> String {
        PrivateKey::generate(1024).unwrap().public_key().to_pem().unwrap()
    }

    #[test]
    fn strangers_are_turned_away() {
        let registry = Registry::new();
        assert_eq!(respond(&registry, Endpoint::Lookup, "10.0.0.2", b"10.0.0.3"), PERMISSION_DENIED);
        assert_eq!(respond(&registry, Endpoint::List, "10.0.0.2", b""), REJECTED);
        assert_eq!(respond(&registry, Endpoint::Register, "10.0.0.2", b"not a key"), REJECTED);
        assert!(registry.is_empty());
    }

    #[test]
    fn registered_peers_see_each_other() {
        let registry = Registry::new();
        let key = pem();
        assert_eq!(respond(&registry, Endpoint::Register, "10.0.0.3", key.as_bytes()), ACCEPTED);
        assert_eq!(respond(&registry, Endpoint::Register, "10.0.0.2", pem().as_bytes()), ACCEPTED);

        let found = respond(&registry, Endpoint::Lookup, "10.0.0.2", b"10.0.0.3");
        assert_eq!(PublicKey::from_pem_bytes(&found).unwrap(), PublicKey::from_pem(&key).unwrap());
        assert_eq!(respond(&registry, Endpoint::Lookup, "10.0.0.2", b"10.0.0.9"), UNKNOWN);
        assert_eq!(
            respond(&registry, Endpoint::List, "10.0.0.3", b""),
            b"2\n10.0.0.2\n10.0.0.3\n".to_vec()
        );
    }

    #[test]
    fn re_registration_replaces_the_key() {
        let registry = Registry::new();
        let (first, second) = (pem(), pem());
        respond(&registry, Endpoint::Register, "10.0.0.2", first.as_bytes());
        respond(&registry, Endpoint::Register, "10.0.0.2", second.as_bytes());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.key_of("10.0.0.2"), Some(second));
    }
}
