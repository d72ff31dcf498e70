//! Service-wide counters reported by the status action

use crate::pool::{PoolSnapshot, PooledClient};
use crate::pump::PumpRegistry;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct ServiceStats {
    started_at: Instant,
    requests: AtomicU64,
    pools: RwLock<Vec<PooledClient>>,
    pumps: PumpRegistry,
}

impl ServiceStats {
    pub fn new(pumps: PumpRegistry) -> Self {
        Self {
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            pools: RwLock::new(Vec::new()),
            pumps,
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn active_pumps(&self) -> usize {
        self.pumps.len()
    }

    /// Track a pool so it shows up in status reports
    pub fn register_pool(&self, pool: PooledClient) {
        self.pools.write().push(pool);
    }

    pub fn pools(&self) -> Vec<PooledClient> {
        self.pools.read().clone()
    }

    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        self.pools.read().iter().map(PooledClient::snapshot).collect()
    }
}
