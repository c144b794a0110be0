use crate::config::TrackerEndpoint;
use anyhow::{Context, Result, anyhow, bail};
use betlib::crypto::PublicKey;
use betlib::network::{ACCEPTED, PERMISSION_DENIED, REJECTED, UNKNOWN};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

// a peer list or a PEM key is far below this
const MAX_REPLY: u64 = 64 * 1024;

/// Opens a connection to `remote:port` that originates from `local`, so the
/// other side sees our host identifier as the source address. Falls back to
/// an unbound socket when `local` is not an IP of the same family and scope.
pub async fn connect_from(
    local: &str,
    remote: &str,
    port: u16,
    limit: Duration,
) -> io::Result<TcpStream> {
    let connect = async {
        let remote = tokio::net::lookup_host((remote, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for peer"))?;
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Ok(ip) = local.parse::<IpAddr>() {
            if ip.is_ipv4() == remote.is_ipv4() && ip.is_loopback() == remote.ip().is_loopback() {
                socket.bind(SocketAddr::new(ip, 0))?;
            }
        }
        socket.connect(remote).await
    };
    timeout(limit, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}

/// Client side of the three rendezvous endpoints.
#[derive(Clone, Debug)]
pub struct RendezvousClient {
    local_host: String,
    endpoint: TrackerEndpoint,
    io_timeout: Duration,
}

impl RendezvousClient {
    pub fn new(local_host: &str, endpoint: TrackerEndpoint, io_timeout: Duration) -> Self {
        RendezvousClient {
            local_host: local_host.to_string(),
            endpoint,
            io_timeout,
        }
    }

    pub async fn register(&self, public_key: &PublicKey) -> Result<()> {
        let pem = public_key.to_pem()?;
        let reply = self
            .exchange(self.endpoint.register_port, pem.as_bytes())
            .await
            .context("registering with the rendezvous service")?;
        if reply != ACCEPTED {
            bail!(
                "rendezvous service refused our key: {}",
                String::from_utf8_lossy(&reply)
            );
        }
        Ok(())
    }

    /// The key `host` registered, or `None` if the service does not know it.
    pub async fn lookup(&self, host: &str) -> Result<Option<PublicKey>> {
        let reply = self
            .exchange(self.endpoint.lookup_port, host.as_bytes())
            .await
            .with_context(|| format!("looking up the key of {host}"))?;
        if reply == UNKNOWN {
            return Ok(None);
        }
        if reply == PERMISSION_DENIED {
            bail!("rendezvous service denied the lookup, we are not registered");
        }
        Ok(Some(PublicKey::from_pem_bytes(&reply)?))
    }

    pub async fn peer_list(&self) -> Result<Vec<String>> {
        let reply = self
            .exchange(self.endpoint.list_port, &[])
            .await
            .context("fetching the peer list")?;
        if reply == REJECTED {
            bail!("rendezvous service rejected the peer list request");
        }
        parse_peer_list(&reply)
    }

    async fn exchange(&self, port: u16, request: &[u8]) -> Result<Vec<u8>> {
        let mut stream = connect_from(
            &self.local_host,
            &self.endpoint.host,
            port,
            self.io_timeout,
        )
        .await?;
        let round_trip = async {
            stream.write_all(request).await?;
            stream.shutdown().await?;
            let mut reply = Vec::new();
            (&mut stream).take(MAX_REPLY).read_to_end(&mut reply).await?;
            Ok::<_, io::Error>(reply)
        };
        let reply = timeout(self.io_timeout, round_trip)
            .await
            .map_err(|_| anyhow!("rendezvous round-trip timed out"))??;
        Ok(reply)
    }
}

/// `"<count>\n"` followed by `count` newline-terminated host identifiers.
pub fn parse_peer_list(reply: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(reply).context("peer list is not UTF-8")?;
    let mut lines = text.lines();
    let count: usize = lines
        .next()
        .context("empty peer list reply")?
        .trim()
        .parse()
        .context("peer list count is not a number")?;
    let hosts: Vec<String> = lines
        .take(count)
        .map(|line| line.trim().to_string())
        .filter(|host| !host.is_empty())
        .collect();
    if hosts.len() != count {
        bail!("peer list announced {count} hosts but carried {}", hosts.len());
    }
    Ok(hosts)
}
