//! Plain TCP relay
//!
//! Every accepted connection is paired with a fresh upstream connection and
//! handed to the pump registry. When the upstream cannot be reached the
//! client connection is closed.

use crate::config::TcpServerConfig;
use crate::loadbalancer::{LoadBalancer, LoadBalancers};
use crate::pump::PumpRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where relayed connections go
#[derive(Clone)]
pub enum Upstream {
    Fixed(String),
    Balanced(Arc<LoadBalancer>),
}

impl Upstream {
    pub fn from_config(config: &TcpServerConfig, balancers: &LoadBalancers) -> anyhow::Result<Self> {
        match (&config.address, &config.load_balancer) {
            (Some(address), None) => Ok(Upstream::Fixed(address.clone())),
            (None, Some(name)) => Ok(Upstream::Balanced(LoadBalancer::lookup(balancers, name)?)),
            _ => anyhow::bail!("tcp server {} needs exactly one of address or load_balancer", config.listen),
        }
    }

    fn next_address(&self) -> anyhow::Result<String> {
        match self {
            Upstream::Fixed(address) => Ok(address.clone()),
            Upstream::Balanced(lb) => Ok(lb.next_address()?.to_string()),
        }
    }
}

pub struct TcpRelayServer {
    listener: TcpListener,
    upstream: Upstream,
    connect_timeout: Duration,
    pumps: PumpRegistry,
    shutdown_rx: watch::Receiver<bool>,
}

impl TcpRelayServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        upstream: Upstream,
        connect_timeout: Duration,
        pumps: PumpRegistry,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
        Ok(Self {
            listener,
            upstream,
            connect_timeout,
            pumps,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "TCP relay listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, client)) => {
                            let _ = stream.set_nodelay(true);
                            let upstream = self.upstream.clone();
                            let pumps = self.pumps.clone();
                            let connect_timeout = self.connect_timeout;
                            tokio::spawn(async move {
                                relay_connection(stream, client, upstream, connect_timeout, pumps).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.wait_for(|stopping| *stopping) => {
                    info!(addr = %addr, "TCP relay shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn relay_connection(
    client_stream: TcpStream,
    client: SocketAddr,
    upstream: Upstream,
    connect_timeout: Duration,
    pumps: PumpRegistry,
) {
    let address = match upstream.next_address() {
        Ok(address) => address,
        Err(e) => {
            error!(client = %client, error = %e, "No upstream address");
            return;
        }
    };

    let upstream_stream =
        match tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(client = %client, upstream = %address, error = %e, "Upstream connect failed");
                return;
            }
            Err(_) => {
                warn!(client = %client, upstream = %address, "Upstream connect timed out");
                return;
            }
        };
    let _ = upstream_stream.set_nodelay(true);

    let pump_id = pumps.start(client_stream, upstream_stream);
    debug!(client = %client, upstream = %address, pump_id, "Relaying TCP connection");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(address: Option<&str>, load_balancer: Option<&str>) -> TcpServerConfig {
        TcpServerConfig {
            listen: "127.0.0.1:0".to_string(),
            address: address.map(String::from),
            load_balancer: load_balancer.map(String::from),
            connect_timeout_ms: 1000,
        }
    }

    #[test]
    fn test_upstream_from_config() {
        let mut balancers = HashMap::new();
        balancers.insert(
            "db".to_string(),
            Arc::new(LoadBalancer::new("db".to_string(), vec!["10.0.0.1:5432".to_string()]).unwrap()),
        );

        assert!(matches!(
            Upstream::from_config(&config(Some("127.0.0.1:1"), None), &balancers).unwrap(),
            Upstream::Fixed(_)
        ));
        assert!(matches!(
            Upstream::from_config(&config(None, Some("db")), &balancers).unwrap(),
            Upstream::Balanced(_)
        ));
        assert!(Upstream::from_config(&config(None, Some("missing")), &balancers).is_err());
        assert!(Upstream::from_config(&config(None, None), &balancers).is_err());
    }

    #[tokio::test]
    async fn test_relay_echo() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pumps = PumpRegistry::new();
        let server = TcpRelayServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Upstream::Fixed(echo_addr.to_string()),
            Duration::from_secs(1),
            pumps.clone(),
            shutdown_rx,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_closes_client() {
        // Grab a free port and release it so nothing listens there
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap();
        drop(unused);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = TcpRelayServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Upstream::Fixed(dead_addr.to_string()),
            Duration::from_secs(1),
            PumpRegistry::new(),
            shutdown_rx,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
