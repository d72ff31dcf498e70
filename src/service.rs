//! Service graph: load balancers, listeners, handler trees and pumps

use crate::action::{ActionEnv, Extensions};
use crate::config::Config;
use crate::handler::{build_tree, stop_tree, Handler};
use crate::loadbalancer::LoadBalancer;
use crate::proxy::ProxyServer;
use crate::pump::PumpRegistry;
use crate::stats::ServiceStats;
use crate::tcp::{TcpRelayServer, Upstream};
use crate::tls;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long `stop` waits for accept loops to exit
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Service {
    shutdown_tx: watch::Sender<bool>,
    trees: Vec<Arc<Vec<Handler>>>,
    tasks: Vec<JoinHandle<()>>,
    http_addrs: Vec<SocketAddr>,
    tcp_addrs: Vec<SocketAddr>,
    stats: Arc<ServiceStats>,
    pumps: PumpRegistry,
}

impl Service {
    /// Build the service graph and start accepting connections
    pub async fn start(config: Config, extensions: Extensions) -> anyhow::Result<Self> {
        config.validate()?;

        let load_balancers = LoadBalancer::build_all(&config.load_balancers)?;
        let pumps = PumpRegistry::new();
        let stats = Arc::new(ServiceStats::new(pumps.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let env = ActionEnv {
            load_balancers: load_balancers.clone(),
            pumps: pumps.clone(),
            stats: Arc::clone(&stats),
            extensions,
        };

        let mut trees: Vec<Arc<Vec<Handler>>> = Vec::with_capacity(config.http_servers.len());
        for server in &config.http_servers {
            match build_tree(&server.handlers, &env)
                .with_context(|| format!("http server {}", server.listen))
            {
                Ok(tree) => trees.push(Arc::new(tree)),
                Err(e) => {
                    stop_trees(&trees);
                    return Err(e);
                }
            }
        }

        let mut http_servers = Vec::with_capacity(config.http_servers.len());
        let mut tcp_servers = Vec::with_capacity(config.tcp_servers.len());
        let bound: anyhow::Result<()> = async {
            for (server, tree) in config.http_servers.iter().zip(&trees) {
                let addr = parse_listen(&server.listen)?;
                let mut proxy =
                    ProxyServer::bind(addr, Arc::clone(tree), Arc::clone(&stats), shutdown_rx.clone())
                        .await?;
                if let Some(tls_config) = &server.tls {
                    let acceptor = tls::build_acceptor(tls_config)
                        .with_context(|| format!("http server {}", server.listen))?;
                    info!(cert = %tls_config.certificate, key = %tls_config.private_key, "TLS enabled");
                    proxy = proxy.with_tls(acceptor);
                }
                http_servers.push(proxy);
            }

            for server in &config.tcp_servers {
                let addr = parse_listen(&server.listen)?;
                let upstream = Upstream::from_config(server, &load_balancers)?;
                tcp_servers.push(
                    TcpRelayServer::bind(
                        addr,
                        upstream,
                        server.connect_timeout(),
                        pumps.clone(),
                        shutdown_rx.clone(),
                    )
                    .await?,
                );
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = bound {
            stop_trees(&trees);
            return Err(e);
        }

        let mut tasks = Vec::new();
        let mut http_addrs = Vec::new();
        let mut tcp_addrs = Vec::new();

        for proxy in http_servers {
            http_addrs.push(proxy.local_addr()?);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = proxy.run().await {
                    error!(error = %e, "HTTP server error");
                }
            }));
        }

        for relay in tcp_servers {
            tcp_addrs.push(relay.local_addr()?);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = relay.run().await {
                    error!(error = %e, "TCP relay error");
                }
            }));
        }

        info!(
            http_servers = http_addrs.len(),
            tcp_servers = tcp_addrs.len(),
            load_balancers = load_balancers.len(),
            "Service started"
        );

        Ok(Self {
            shutdown_tx,
            trees,
            tasks,
            http_addrs,
            tcp_addrs,
            stats,
            pumps,
        })
    }

    /// Bound addresses of the HTTP servers, in configuration order
    pub fn http_addrs(&self) -> &[SocketAddr] {
        &self.http_addrs
    }

    /// Bound addresses of the TCP relay servers, in configuration order
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    pub fn stats(&self) -> &Arc<ServiceStats> {
        &self.stats
    }

    pub fn pumps(&self) -> &PumpRegistry {
        &self.pumps
    }

    /// Stop listeners, handler trees and pumps
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);

        info!("Stopping handlers...");
        stop_trees(&self.trees);

        let active = self.pumps.len();
        if active > 0 {
            info!(active, "Stopping pumps...");
        }
        self.pumps.stop_all();

        let waited = tokio::time::timeout(STOP_TIMEOUT, async {
            for task in self.tasks {
                let _ = task.await;
            }
        })
        .await;
        if waited.is_err() {
            warn!(timeout_secs = STOP_TIMEOUT.as_secs(), "Listeners did not stop in time");
        }
    }
}

fn stop_trees(trees: &[Arc<Vec<Handler>>]) {
    for tree in trees.iter().rev() {
        stop_tree(tree);
    }
}

fn parse_listen(listen: &str) -> anyhow::Result<SocketAddr> {
    listen
        .parse()
        .with_context(|| format!("invalid listen address '{}'", listen))
}
