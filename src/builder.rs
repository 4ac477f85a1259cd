//! Builder wiring the registry, address cache, connection manager and peer store
//! into a [`Coordinator`].
//!
//! Initial peers are best effort: a coordinator that cannot be joined is logged and
//! left out, and a node agent that does not resolve is registered DOWN.

use std::net::SocketAddrV4;
use std::sync::Arc;

use tracing::warn;

use crate::address_cache::{AddressCache, DnsResolver, Resolver};
use crate::config::ClusterConfig;
use crate::connection::ConnectionManager;
use crate::coordinator::Coordinator;
use crate::persistence::{MemoryStore, PeerStore};
use crate::registry::{NoopScheduler, PeerRegistry, WorkScheduler};
use crate::Result;

/// Builder for a [`Coordinator`] with its initial peers.
pub struct CoordinatorBuilder {
    local: SocketAddrV4,
    config: Option<ClusterConfig>,
    resolver: Option<Arc<dyn Resolver>>,
    scheduler: Option<Arc<dyn WorkScheduler>>,
    store: Option<Arc<dyn PeerStore>>,
    peers: Vec<(String, u16)>,
    node_agents: Vec<(String, u16)>,
}

impl std::fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("local", &self.local)
            .field("peers", &self.peers)
            .field("node_agents", &self.node_agents)
            .finish_non_exhaustive()
    }
}

impl CoordinatorBuilder {
    /// Create a new builder for the coordinator listening on `local`
    pub fn new(local: SocketAddrV4) -> Self {
        Self {
            local,
            config: None,
            resolver: None,
            scheduler: None,
            store: None,
            peers: Vec::new(),
            node_agents: Vec::new(),
        }
    }

    /// Set the cluster configuration. Its local endpoint is replaced by the builder's.
    pub fn with_config(mut self, config: ClusterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the host resolver (defaults to the system resolver)
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the scheduler notified of liveness changes
    pub fn with_scheduler(mut self, scheduler: Arc<dyn WorkScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the peer store (defaults to an in-memory store)
    pub fn with_store(mut self, store: Arc<dyn PeerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a peer coordinator to join
    pub fn add_peer(mut self, host: impl Into<String>, port: u16) -> Self {
        self.peers.push((host.into(), port));
        self
    }

    /// Add a node agent to register
    pub fn add_node_agent(mut self, host: impl Into<String>, port: u16) -> Self {
        self.node_agents.push((host.into(), port));
        self
    }

    /// Build the coordinator, recover stored peers, then register and join the
    /// configured ones.
    pub async fn build(self) -> Result<Coordinator> {
        let mut config = self.config.unwrap_or_default();
        config.local_addr = *self.local.ip();
        config.local_port = self.local.port();
        let config = Arc::new(config);

        let scheduler = self.scheduler.unwrap_or_else(|| Arc::new(NoopScheduler));
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(DnsResolver));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::default()));

        let registry = PeerRegistry::new(&config, scheduler).shared();
        let cache = Arc::new(AddressCache::new(resolver));
        let manager = Arc::new(ConnectionManager::new(config, registry, cache));
        let coordinator = Coordinator::new(manager, store);

        coordinator.recover().await?;

        for (host, port) in self.node_agents {
            if let Err(err) = coordinator.register_node_agent(&host, port).await {
                warn!(host = %host, port, error = %err, "cannot register node agent");
            }
        }
        for (host, port) in self.peers {
            if let Err(err) = coordinator.join(&host, port).await {
                warn!(host = %host, port, error = %err, "cannot join peer coordinator");
            }
        }

        Ok(coordinator)
    }
}
