use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the rendezvous service listens.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TrackerEndpoint {
    pub host: String,
    pub register_port: u16,
    pub lookup_port: u16,
    pub list_port: u16,
}

impl Default for TrackerEndpoint {
    fn default() -> Self {
        TrackerEndpoint {
            host: "127.0.0.1".to_string(),
            register_port: betlib::DEFAULT_REGISTER_PORT,
            lookup_port: betlib::DEFAULT_LOOKUP_PORT,
            list_port: betlib::DEFAULT_LIST_PORT,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NodeConfig {
    /// Our host identifier: the IP peers and the tracker see us as. We listen
    /// on it and originate every outbound connection from it.
    pub host: String,
    /// Listening port, shared by every node of a deployment.
    pub peer_port: u16,
    pub private_key: PathBuf,
    pub difficulty_bits: u32,
    pub batch_size: usize,
    pub refresh_interval_secs: u64,
    pub io_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub chain_file: Option<PathBuf>,
    pub save_interval_secs: u64,
    pub tracker: TrackerEndpoint,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: "127.0.0.1".to_string(),
            peer_port: betlib::DEFAULT_PEER_PORT,
            private_key: PathBuf::from("private.pem"),
            difficulty_bits: betlib::DIFFICULTY_BITS,
            batch_size: betlib::BLOCK_TRANSACTION_CAP,
            refresh_interval_secs: 10,
            io_timeout_secs: 5,
            sync_timeout_secs: 30,
            chain_file: None,
            save_interval_secs: 15,
            tracker: TrackerEndpoint::default(),
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}
