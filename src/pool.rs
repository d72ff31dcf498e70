//! Bounded connection pool for one upstream address
//!
//! Connections are HTTP/1.1 client connections driven by their own task. An
//! acquired connection is owned by a [`Pooled`] guard that ends in exactly one
//! of three ways: released back to the pool, destroyed, or hijacked for a
//! protocol upgrade. Dropping a guard without releasing it destroys the
//! connection.
//!
//! Idle connections are reused most recently released first. When every slot
//! is in use, acquisitions park on a FIFO queue and are handed the next
//! released connection, or the slot of the next destroyed one.

use crate::error::{PoolError, ProxyBody};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

/// Statistics for one pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests relayed through the pool
    pub requests: AtomicU64,
    /// Upstream connections established
    pub connections_opened: AtomicU64,
    /// Connections moved out of the pool by a protocol upgrade
    pub hijacked: AtomicU64,
    /// Acquisitions that gave up waiting for a connection
    pub acquire_timeouts: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    pub fn get_hijacked(&self) -> u64 {
        self.hijacked.load(Ordering::Relaxed)
    }

    pub fn get_acquire_timeouts(&self) -> u64 {
        self.acquire_timeouts.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a pool, reported by the status action
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub address: String,
    pub live: usize,
    pub idle: usize,
    pub waiting: usize,
    pub requests: u64,
    pub connections_opened: u64,
    pub hijacked: u64,
    pub acquire_timeouts: u64,
}

/// Configuration for a pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live connections
    pub max_connections: usize,
    /// How long an acquisition may wait for a connection
    pub acquire_timeout: Duration,
    /// How long establishing a connection may take
    pub connect_timeout: Duration,
    /// How long the upstream has to answer a request
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// An HTTP/1.1 connection to the upstream and the task driving it.
///
/// Dropping the value lets the connection finish gracefully once it is idle;
/// [`UpstreamConn::close`] tears it down immediately.
pub struct UpstreamConn {
    id: u64,
    sender: SendRequest<ProxyBody>,
    task: JoinHandle<()>,
}

impl UpstreamConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.task.is_finished()
    }

    pub fn close(self) {
        self.task.abort();
    }
}

struct State {
    idle: Vec<UpstreamConn>,
    /// Connections in any state plus reserved slots still connecting
    live: usize,
    waiters: VecDeque<oneshot::Sender<Pooled>>,
    stopping: bool,
    /// Bumped by every stop. Guards from an earlier generation no longer
    /// own a slot and their connections are closed on return.
    generation: u64,
}

struct Shared {
    address: String,
    config: PoolConfig,
    state: Mutex<State>,
    stats: PoolStats,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    /// Return a connection, or only its slot, to the pool. A parked waiter is
    /// served first; otherwise the connection goes idle or the slot is freed.
    fn give_back(self: &Arc<Self>, mut conn: Option<UpstreamConn>, generation: u64) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.stopping || state.generation != generation {
                    drop(state);
                    if let Some(conn) = conn {
                        conn.close();
                    }
                    return;
                }

                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        match conn {
                            Some(conn) => state.idle.push(conn),
                            None => state.live = state.live.saturating_sub(1),
                        }
                        return;
                    }
                }
            };

            let grant = Pooled {
                conn,
                shared: Some(self.clone()),
                generation,
            };
            match waiter.send(grant) {
                Ok(()) => return,
                // Waiter gave up; try the next one
                Err(mut grant) => {
                    conn = grant.conn.take();
                    grant.shared = None;
                }
            }
        }
    }
}

/// Guard over an acquired connection
pub struct Pooled {
    /// `None` while the guard only holds a reserved slot
    conn: Option<UpstreamConn>,
    /// `None` once the guard has been settled
    shared: Option<Arc<Shared>>,
    /// Pool generation the slot was taken from
    generation: u64,
}

impl Pooled {
    pub fn id(&self) -> Option<u64> {
        self.conn.as_ref().map(|conn| conn.id)
    }

    /// Put the connection back for reuse
    pub fn release(mut self) {
        if let Some(shared) = self.shared.take() {
            match self.conn.take() {
                Some(conn) if conn.is_closed() => {
                    conn.close();
                    shared.give_back(None, self.generation);
                }
                conn => shared.give_back(conn, self.generation),
            }
        }
    }

    /// Close the connection and free its slot
    pub fn destroy(mut self) {
        self.settle_destroyed();
    }

    /// Move the connection out of the pool for good. Its slot is freed at
    /// once and the pool never hands the connection out again.
    pub fn hijack(mut self) -> Option<UpstreamConn> {
        let conn = self.conn.take();
        if let Some(shared) = self.shared.take() {
            shared.stats.hijacked.fetch_add(1, Ordering::Relaxed);
            shared.give_back(None, self.generation);
        }
        conn
    }

    fn settle_destroyed(&mut self) {
        if let Some(shared) = self.shared.take() {
            if let Some(conn) = self.conn.take() {
                debug!(address = %shared.address, conn_id = conn.id, "Destroying upstream connection");
                conn.close();
            }
            shared.give_back(None, self.generation);
        }
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        self.settle_destroyed();
    }
}

/// A bounded pool of connections to one upstream address
#[derive(Clone)]
pub struct PooledClient {
    shared: Arc<Shared>,
}

impl PooledClient {
    pub fn new(address: String, config: PoolConfig) -> Self {
        debug!(
            address = %address,
            max_connections = config.max_connections,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "Connection pool initialized"
        );

        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                address,
                config,
                state: Mutex::new(State {
                    idle: Vec::new(),
                    live: 0,
                    waiters: VecDeque::new(),
                    stopping: false,
                    generation: 0,
                }),
                stats: PoolStats::default(),
                next_id: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let (live, idle, waiting) = {
            let state = self.shared.state.lock();
            (state.live, state.idle.len(), state.waiters.len())
        };
        let stats = &self.shared.stats;
        PoolSnapshot {
            address: self.shared.address.clone(),
            live,
            idle,
            waiting,
            requests: stats.get_requests(),
            connections_opened: stats.get_connections_opened(),
            hijacked: stats.get_hijacked(),
            acquire_timeouts: stats.get_acquire_timeouts(),
        }
    }

    /// Allow acquisitions again after a stop
    pub fn start(&self) {
        self.shared.state.lock().stopping = false;
        self.shared.shutdown.send_replace(false);
    }

    /// Close idle connections, fail parked acquisitions and interrupt
    /// in-flight relays. Connections given back afterwards are closed.
    pub fn stop(&self) {
        let (idle, waiters) = {
            let mut state = self.shared.state.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            state.generation += 1;
            state.live = 0;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };

        let (idle_count, waiting) = (idle.len(), waiters.len());
        drop(waiters);
        for conn in idle {
            conn.close();
        }
        self.shared.shutdown.send_replace(true);

        info!(
            address = %self.shared.address,
            closed_idle = idle_count,
            failed_waiters = waiting,
            "Connection pool stopped"
        );
    }

    /// Get a connection, establishing one if the pool has a free slot
    pub async fn acquire(&self) -> Result<Pooled, PoolError> {
        enum Next {
            Idle(UpstreamConn),
            Connect,
            Wait(oneshot::Receiver<Pooled>),
        }

        let mut stale = Vec::new();
        let (next, generation) = {
            let mut state = self.shared.state.lock();
            if state.stopping {
                return Err(PoolError::ClientStopping);
            }
            let next = loop {
                match state.idle.pop() {
                    Some(conn) if conn.is_closed() => {
                        state.live = state.live.saturating_sub(1);
                        stale.push(conn);
                    }
                    Some(conn) => break Next::Idle(conn),
                    None if state.live < self.shared.config.max_connections => {
                        state.live += 1;
                        break Next::Connect;
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.retain(|waiter| !waiter.is_closed());
                        state.waiters.push_back(tx);
                        break Next::Wait(rx);
                    }
                }
            };
            (next, state.generation)
        };

        for conn in stale {
            debug!(address = %self.shared.address, conn_id = conn.id, "Discarding closed idle connection");
            conn.close();
        }

        match next {
            Next::Idle(conn) => Ok(Pooled {
                conn: Some(conn),
                shared: Some(self.shared.clone()),
                generation,
            }),
            Next::Connect => {
                let slot = Pooled {
                    conn: None,
                    shared: Some(self.shared.clone()),
                    generation,
                };
                self.fill(slot).await
            }
            Next::Wait(rx) => match timeout(self.shared.config.acquire_timeout, rx).await {
                Ok(Ok(grant)) => self.fill(grant).await,
                Ok(Err(_)) => Err(PoolError::ClientStopping),
                Err(_) => {
                    self.shared
                        .stats
                        .acquire_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(address = %self.shared.address, "Timed out waiting for a connection");
                    Err(PoolError::NoConnectionAvailable)
                }
            },
        }
    }

    /// Make sure a granted guard holds an open connection. On failure the
    /// guard is dropped, which frees its slot.
    async fn fill(&self, mut grant: Pooled) -> Result<Pooled, PoolError> {
        match grant.conn.take() {
            Some(conn) if !conn.is_closed() => {
                grant.conn = Some(conn);
                return Ok(grant);
            }
            Some(conn) => conn.close(),
            None => {}
        }

        grant.conn = Some(self.connect().await?);
        Ok(grant)
    }

    async fn connect(&self) -> Result<UpstreamConn, PoolError> {
        let address = &self.shared.address;
        let stream = match timeout(
            self.shared.config.connect_timeout,
            TcpStream::connect(address.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(PoolError::Connect {
                    address: address.clone(),
                    source,
                })
            }
            Err(_) => return Err(PoolError::ConnectTimeout(address.clone())),
        };
        let _ = stream.set_nodelay(true);

        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| PoolError::Handshake {
                address: address.clone(),
                source,
            })?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_address = address.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(address = %conn_address, conn_id = id, error = %e, "Upstream connection ended with error");
            }
        });

        self.shared
            .stats
            .connections_opened
            .fetch_add(1, Ordering::Relaxed);
        debug!(address = %address, conn_id = id, "Opened upstream connection");

        Ok(UpstreamConn { id, sender, task })
    }

    /// Send a request on an acquired connection. The exchange is bounded by
    /// the request timeout and interrupted when the pool stops.
    pub async fn send(
        &self,
        pooled: &mut Pooled,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, PoolError> {
        let conn = pooled.conn.as_mut().ok_or(PoolError::Detached)?;
        self.shared.stats.record_request();

        let request_timeout = self.shared.config.request_timeout;
        let mut shutdown = self.shared.shutdown.subscribe();
        let exchange = async {
            conn.sender.ready().await.map_err(PoolError::Transport)?;
            conn.sender
                .send_request(req)
                .await
                .map_err(PoolError::Transport)
        };

        tokio::select! {
            result = timeout(request_timeout, exchange) => match result {
                Ok(result) => result,
                Err(_) => Err(PoolError::RequestTimeout(request_timeout)),
            },
            _ = shutdown.wait_for(|stopping| *stopping) => Err(PoolError::ClientStopping),
        }
    }
}
