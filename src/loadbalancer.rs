//! Round-robin load balancer over a fixed list of upstream addresses
//!
//! Load balancers are built once from configuration, shared through `Arc` and
//! looked up by name when reverse proxy actions and TCP servers are built.

use crate::config::LoadBalancerConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadBalancerError {
    #[error("load balancer '{0}' has no servers")]
    Empty(String),
    #[error("unknown load balancer '{0}'")]
    Unknown(String),
}

/// Load balancers by name
pub type LoadBalancers = HashMap<String, Arc<LoadBalancer>>;

#[derive(Debug)]
pub struct LoadBalancer {
    name: String,
    addresses: Vec<String>,
    /// Index of the next address to hand out
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(name: String, addresses: Vec<String>) -> Result<Self, LoadBalancerError> {
        if addresses.is_empty() {
            return Err(LoadBalancerError::Empty(name));
        }

        Ok(Self {
            name,
            addresses,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Build every configured load balancer
    pub fn build_all(configs: &[LoadBalancerConfig]) -> Result<LoadBalancers, LoadBalancerError> {
        let mut balancers = HashMap::new();
        for config in configs {
            let lb = LoadBalancer::new(config.name.clone(), config.servers.clone())?;
            info!(
                load_balancer = %config.name,
                servers = config.servers.len(),
                "Load balancer ready"
            );
            balancers.insert(config.name.clone(), Arc::new(lb));
        }
        Ok(balancers)
    }

    pub fn lookup(balancers: &LoadBalancers, name: &str) -> Result<Arc<LoadBalancer>, LoadBalancerError> {
        balancers
            .get(name)
            .cloned()
            .ok_or_else(|| LoadBalancerError::Unknown(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Return the index of the address to use and advance the cursor
    pub fn next_index(&self) -> Result<usize, LoadBalancerError> {
        let len = self.addresses.len();
        if len == 0 {
            return Err(LoadBalancerError::Empty(self.name.clone()));
        }

        let index = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| Some((i + 1) % len))
            .unwrap_or_else(|i| i)
            % len;

        debug!(
            load_balancer = %self.name,
            address = %self.addresses[index],
            index,
            "Selected server"
        );

        Ok(index)
    }

    /// Return the next address in rotation
    pub fn next_address(&self) -> Result<&str, LoadBalancerError> {
        let index = self.next_index()?;
        Ok(&self.addresses[index])
    }
}
