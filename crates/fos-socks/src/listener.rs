//! SOCKS4 Listener
//!
//! Accepts clients and spawns one [`Session`] task per connection.
//!
//! # Admission
//!
//! A semaphore holds `max_connections` permits. The accept loop takes a
//! permit before accepting, so a full proxy leaves new clients queued in
//! the kernel backlog instead of buffering them in memory.

use crate::config::ProxyConfig;
use crate::error::{Result, SocksError};
use crate::session::{ConnectionId, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// SOCKS4/4a proxy server
pub struct Socks4Server {
    listener: TcpListener,
    config: Arc<ProxyConfig>,
    /// Connection semaphore (limits concurrent connections)
    semaphore: Arc<Semaphore>,
    active_connections: Arc<AtomicU64>,
    next_id: u64,
}

impl Socks4Server {
    /// Bind the listening socket with address reuse enabled.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let addr = config.listen_addr;
        let bind_err = |source| SocksError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(config.backlog).map_err(bind_err)?;

        let semaphore = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            listener,
            config: Arc::new(config),
            semaphore,
            active_connections: Arc::new(AtomicU64::new(0)),
            next_id: 0,
        })
    }

    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get the proxy URL for client configuration
    pub fn proxy_url(&self) -> Result<String> {
        Ok(format!("socks4a://{}", self.local_addr()?))
    }

    /// Get number of active connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Accept and handle connections until the task is dropped.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "SOCKS4 proxy listening on {} (max {} connections, ~{:.1}KB per connection)",
            self.local_addr()?,
            self.config.max_connections,
            self.config.memory_estimate() as f64 / 1024.0
        );

        loop {
            // Accept with semaphore (limits connections)
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SocksError::ShuttingDown)?;

            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    self.next_id += 1;
                    let id = ConnectionId(self.next_id);
                    let session = Session::new(id, Arc::clone(&self.config));
                    let active = Arc::clone(&self.active_connections);

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(conn = %id, "set_nodelay failed: {}", e);
                    }
                    active.fetch_add(1, Ordering::Relaxed);

                    tokio::spawn(async move {
                        debug!(conn = %id, %peer, "accepted");
                        session.run(stream).await;

                        active.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }
                Err(e) => {
                    drop(permit);
                    accept_failed(&e).await;
                }
            }
        }
    }
}

async fn accept_failed(err: &std::io::Error) {
    warn!("Accept error: {}", err);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback() -> ProxyConfig {
        ProxyConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Socks4Server::bind(loopback()).await.unwrap();
        let addr = server.local_addr().unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(server.active_connections(), 0);
        assert_eq!(server.proxy_url().unwrap(), format!("socks4a://{}", addr));
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let started = std::time::Instant::now();
        accept_failed(&std::io::Error::from_raw_os_error(24)).await;
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ProxyConfig {
            listen_addr: first.local_addr().unwrap(),
            ..ProxyConfig::default()
        };

        let err = Socks4Server::bind(config).await.err().unwrap();
        assert!(matches!(err, SocksError::Bind { .. }));
    }
}
