//! Shared host connections, keyed by engine address.
//!
//! Every viewer bound for the same `hostname:port` shares one
//! [`HostConnection`]. The registry hands out the existing connection or
//! starts a fresh one, and tears a connection down once its last viewer
//! has left.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::host::{HostConnection, RelaySettings};

/// One registry slot. The cell records the outcome of the single start
/// attempt the entry gets; callers that lose the insert race await it
/// instead of starting their own connection.
struct HostEntry {
    host: Arc<HostConnection>,
    started: OnceCell<bool>,
}

pub struct HostRegistry {
    hosts: RwLock<HashMap<(String, u16), Arc<HostEntry>>>,
    settings: RelaySettings,
}

impl HostRegistry {
    pub fn new(settings: RelaySettings) -> Self {
        HostRegistry {
            hosts: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Returns the connection for `hostname:port`, starting one if none
    /// exists yet. The map lock only covers the entry lookup; the start
    /// runs outside it, so an unreachable engine cannot stall acquires
    /// for other engines. Concurrent viewers racing for the same engine
    /// share a single start attempt, and a connection that fails to start
    /// is stopped and dropped rather than cached.
    pub async fn acquire(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Arc<HostConnection>, RegistryError> {
        let key = (hostname.to_string(), port);
        let entry = {
            let mut hosts = self.hosts.write().await;
            if let Some(entry) = hosts.get(&key) {
                debug!(host = hostname, port, "reusing host connection");
                Arc::clone(entry)
            } else {
                info!(host = hostname, port, "opening host connection");
                let entry = Arc::new(HostEntry {
                    host: Arc::new(HostConnection::new(hostname, port, self.settings.clone())),
                    started: OnceCell::new(),
                });
                hosts.insert(key.clone(), Arc::clone(&entry));
                entry
            }
        };

        let started = *entry
            .started
            .get_or_init(|| {
                let host = Arc::clone(&entry.host);
                async move { host.start().await }
            })
            .await;
        if started {
            return Ok(Arc::clone(&entry.host));
        }

        warn!(host = hostname, port, "host connection failed to start");
        // A failed start still spawned the health loop; stop reaps it.
        entry.host.stop().await;
        let mut hosts = self.hosts.write().await;
        if hosts
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &entry))
        {
            hosts.remove(&key);
        }
        Err(RegistryError::Unreachable {
            hostname: hostname.to_string(),
            port,
        })
    }

    /// Drops and stops the connection once its last viewer has detached.
    /// Connections that still carry viewers are left alone, as is any
    /// newer entry that replaced this connection under the same key.
    pub async fn release_if_idle(&self, host: &Arc<HostConnection>) {
        let mut hosts = self.hosts.write().await;

        if host.client_count().await > 0 {
            return;
        }

        let key = (host.hostname().to_string(), host.port());
        if hosts
            .get(&key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.host, host))
        {
            hosts.remove(&key);
            debug!(
                host = %host.hostname(),
                port = host.port(),
                "last viewer left; closing host connection"
            );
            host.stop().await;
        }
    }

    /// Stops every connection. Viewers still attached see their sockets
    /// close through the usual path.
    pub async fn shutdown(&self) {
        let mut hosts = self.hosts.write().await;
        for ((hostname, port), entry) in hosts.drain() {
            debug!(host = %hostname, port, "closing host connection");
            entry.host.stop().await;
        }
        info!("host registry shut down");
    }

    pub async fn host_count(&self) -> usize {
        self.hosts.read().await.len()
    }
}
