//! Control-plane endpoint pool
//!
//! Holds the set of known registry node addresses, refreshes them from the
//! environment on a cooldown, and hands out one endpoint per outbound call
//! with uniform random selection for load spreading.
//!
//! Selection on an empty pool is a configuration invariant violation
//! ([`RegistryError::NoServerAvailable`]): there is no way to serve a
//! request without at least one control-plane address.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tracing::info;

use crate::clock::Clock;
use crate::error::{RegistryError, RegistryResult};

/// Environment variable consulted on refresh: comma-separated `host:port` list
pub const SERVER_LIST_ENV: &str = "SVCREG_SERVER_LIST";

/// Cooldown between environment refreshes
const REFRESH_COOLDOWN_MILLIS: i64 = 60_000;

/// Pool of control-plane endpoints with cooldown refresh and random pick
pub struct ServerPool {
    servers: RwLock<Vec<String>>,
    last_refresh_millis: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl ServerPool {
    /// Create a pool seeded with `servers`
    #[must_use]
    pub fn new(servers: Vec<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            servers: RwLock::new(servers),
            last_refresh_millis: AtomicI64::new(0),
            clock,
        }
    }

    /// Reload the endpoint list from the environment if stale
    ///
    /// A reload happens only when more than 60 seconds have elapsed since
    /// the last one AND at least one endpoint is already known; otherwise
    /// the existing list is returned unchanged. Logs a notice when the
    /// resolved list differs from the previous one.
    pub fn refresh_if_stale(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        {
            let servers = self.servers.read();
            if now - self.last_refresh_millis.load(Ordering::Acquire) < REFRESH_COOLDOWN_MILLIS
                && !servers.is_empty()
            {
                return servers.clone();
            }
        }

        let resolved: Vec<String> = std::env::var(SERVER_LIST_ENV)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();

        let mut servers = self.servers.write();
        if !resolved.is_empty() {
            if *servers != resolved {
                info!("server list updated, old: {:?}, new: {:?}", *servers, resolved);
            }
            *servers = resolved;
            self.last_refresh_millis.store(now, Ordering::Release);
        }

        servers.clone()
    }

    /// Pick one endpoint uniformly at random, refreshing first if stale
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoServerAvailable`] if the list is empty;
    /// the host is expected to treat this as unrecoverable.
    pub fn next_server(&self) -> RegistryResult<String> {
        let servers = self.refresh_if_stale();

        if servers.is_empty() {
            return Err(RegistryError::NoServerAvailable);
        }

        let index = rand::thread_rng().gen_range(0..servers.len());
        Ok(servers[index].clone())
    }

    /// Replace the endpoint list directly
    ///
    /// Used at construction and by configuration.
    pub fn set_servers(&self, servers: Vec<String>) {
        *self.servers.write() = servers;
    }

    /// Current endpoint list
    #[must_use]
    pub fn servers(&self) -> Vec<String> {
        self.servers.read().clone()
    }
}
