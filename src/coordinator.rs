//! The coordinator-side handle tying the cluster layer together.
//!
//! A [`Coordinator`] owns the peer registry, the address cache, the connection
//! manager, cluster membership and the peer store. It is built through
//! [`CoordinatorBuilder`](crate::builder::CoordinatorBuilder) and torn down with
//! [`Coordinator::shutdown`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address_cache::AddressCache;
use crate::config::ClusterConfig;
use crate::connection::{ConnectionManager, InboundFrames};
use crate::membership::{BroadcastReport, ClusterMembership, ResourceUpdate};
use crate::persistence::{PeerIdentity, PeerStore};
use crate::registry::{PeerHandle, PeerRole, SharedRegistry};
use crate::{ClusterError, Result};

/// Handle to a running coordinator's cluster layer.
#[derive(Debug)]
pub struct Coordinator {
    manager: Arc<ConnectionManager>,
    membership: ClusterMembership,
    store: Arc<dyn PeerStore>,
}

impl Coordinator {
    pub(crate) fn new(manager: Arc<ConnectionManager>, store: Arc<dyn PeerStore>) -> Self {
        Self {
            membership: ClusterMembership::new(Arc::clone(&manager)),
            manager,
            store,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ClusterConfig {
        self.manager.config()
    }

    /// Peer registry.
    pub fn registry(&self) -> &SharedRegistry {
        self.manager.registry()
    }

    /// Host address cache.
    pub fn cache(&self) -> &Arc<AddressCache> {
        self.manager.cache()
    }

    /// Connection manager.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Peer coordinators.
    pub fn membership(&self) -> &ClusterMembership {
        &self.membership
    }

    /// Peer store.
    pub fn store(&self) -> &Arc<dyn PeerStore> {
        &self.store
    }

    /// Registers a node agent and persists its identity. No connection is opened.
    ///
    /// Adding an agent that was registered unresolved gives it its addresses. If
    /// the identity cannot be stored, a record created by this call is removed again.
    pub async fn add_node_agent(&self, host: &str, port: u16) -> Result<PeerHandle> {
        let known = self.registry().read().find(host, port);
        let peer = self.resolve_node_agent(host, port).await?;
        self.persist_or_forget(peer, known.is_none())?;
        Ok(peer)
    }

    /// Like [`add_node_agent`](Self::add_node_agent), but an agent whose host does
    /// not resolve is still registered, DOWN and UNRESOLVED with no addresses.
    pub async fn register_node_agent(&self, host: &str, port: u16) -> Result<PeerHandle> {
        let known = self.registry().read().find(host, port);
        let peer = self.node_agent_or_unresolved(host, port).await?;
        self.persist_or_forget(peer, known.is_none())?;
        Ok(peer)
    }

    /// Joins a peer coordinator and persists its identity. If the identity cannot
    /// be stored, a coordinator first seen by this call leaves again.
    pub async fn join(&self, host: &str, port: u16) -> Result<PeerHandle> {
        let known = self.registry().read().find(host, port);
        let peer = self.membership.join(host, port).await?;
        self.persist_or_forget(peer, known.is_none())?;
        Ok(peer)
    }

    async fn resolve_node_agent(&self, host: &str, port: u16) -> Result<PeerHandle> {
        let addrs = self.cache().resolve(host).await?;
        let mut registry = self.registry().write();
        let peer = registry.create_node_agent(host, port, Arc::clone(&addrs))?;
        registry.set_addresses(peer, addrs)?;
        Ok(peer)
    }

    async fn node_agent_or_unresolved(&self, host: &str, port: u16) -> Result<PeerHandle> {
        match self.resolve_node_agent(host, port).await {
            Err(ClusterError::AddressNotFound(_)) => {
                warn!(host = %host, port, "node agent does not resolve, registering it down");
                self.registry().write().create_unresolved_node_agent(host, port)
            }
            outcome => outcome,
        }
    }

    fn persist_or_forget(&self, peer: PeerHandle, created: bool) -> Result<()> {
        let Err(err) = self.persist(peer) else {
            return Ok(());
        };
        if created {
            warn!(peer = %peer, error = %err, "cannot store new peer, removing it");
            let removed = if self.membership.members().contains(&peer) {
                self.membership.leave(peer)
            } else {
                self.manager.delete_peer(peer).map(|_| ())
            };
            if let Err(cleanup) = removed {
                debug!(peer = %peer, error = %cleanup, "rollback found no record");
            }
        }
        Err(err)
    }

    /// Sends a resource update to every peer coordinator.
    pub async fn broadcast(&self, update: &ResourceUpdate) -> Result<BroadcastReport> {
        self.membership.broadcast(update).await
    }

    /// Saves the identity of `peer`.
    pub fn persist(&self, peer: PeerHandle) -> Result<()> {
        let identity = {
            let registry = self.registry().read();
            let record = registry.get(peer).ok_or(ClusterError::StalePeer)?;
            PeerIdentity::of(record)
                .ok_or_else(|| ClusterError::System(format!("{peer} has no role data")))?
        };
        self.store.save(&identity)
    }

    /// Recreates every stored peer.
    ///
    /// Node agents are registered without connecting, unresolved ones as DOWN and
    /// UNRESOLVED. Peer coordinators are joined. A peer that cannot be recovered is
    /// logged and skipped; its stored identity is kept for the next attempt.
    pub async fn recover(&self) -> Result<Vec<PeerHandle>> {
        let identities = self.store.load_all()?;
        let mut recovered = Vec::with_capacity(identities.len());
        for identity in identities {
            let outcome = match identity.role {
                PeerRole::NodeAgent => {
                    self.node_agent_or_unresolved(&identity.host, identity.port)
                        .await
                }
                PeerRole::Coordinator => self.membership.join(&identity.host, identity.port).await,
            };
            match outcome {
                Ok(peer) => {
                    debug!(host = %identity.host, port = identity.port, role = ?identity.role, "recovered peer");
                    recovered.push(peer);
                }
                Err(err) => {
                    warn!(host = %identity.host, port = identity.port, error = %err, "cannot recover peer");
                }
            }
        }
        info!(recovered = recovered.len(), "peer recovery finished");
        Ok(recovered)
    }

    /// Deletes a peer from the registry, the member list and the store.
    pub fn remove_peer(&self, peer: PeerHandle) -> Result<()> {
        let (host, port) = {
            let registry = self.registry().read();
            let record = registry.get(peer).ok_or(ClusterError::StalePeer)?;
            (record.host().to_string(), record.port())
        };
        if self.membership.members().contains(&peer) {
            self.membership.leave(peer)?;
        } else {
            self.manager.delete_peer(peer)?;
        }
        self.store.delete(&host, port)
    }

    /// Takes the inbound tunnel frame stream. Returns `None` after the first call.
    pub fn inbound(&self) -> Option<InboundFrames> {
        self.manager.inbound()
    }

    /// Closes every connection and tunnel.
    pub fn shutdown(&self) {
        self.manager.shutdown();
        info!(local = %self.config().local_endpoint(), "coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CoordinatorBuilder;
    use crate::persistence::MemoryStore;
    use crate::registry::Liveness;
    use crate::test_helpers::{StaticResolver, TunnelSink};
    use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

    fn resolver(hosts: &[&str]) -> Arc<StaticResolver> {
        Arc::new(hosts.iter().fold(StaticResolver::default(), |resolver, host| {
            resolver.with_host(host, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
        }))
    }

    fn local() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 15001)
    }

    #[tokio::test]
    async fn node_agents_are_persisted_and_removed() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = CoordinatorBuilder::new(local())
            .with_resolver(resolver(&["node01"]))
            .with_store(store.clone())
            .build()
            .await
            .unwrap();

        let peer = coordinator.add_node_agent("node01", 15002).await.unwrap();
        let stored = store.load("node01", 15002).unwrap().unwrap();
        assert_eq!(stored.role, PeerRole::NodeAgent);
        assert_eq!(
            coordinator.registry().read().get(peer).unwrap().rm_port(),
            15003
        );

        coordinator.remove_peer(peer).unwrap();
        assert!(store.load("node01", 15002).unwrap().is_none());
        assert!(coordinator.registry().read().get(peer).is_none());
        assert!(!coordinator.cache().contains("node01"));
        assert!(matches!(coordinator.remove_peer(peer), Err(ClusterError::StalePeer)));
    }

    #[tokio::test]
    async fn recover_rebuilds_stored_peers() {
        let sink = TunnelSink::start().await.unwrap();
        let store = Arc::new(MemoryStore::default());
        store
            .save(&PeerIdentity {
                host: "node01".into(),
                port: 15002,
                role: PeerRole::NodeAgent,
                modified: 0,
            })
            .unwrap();
        store
            .save(&PeerIdentity {
                host: "svr2".into(),
                port: sink.port(),
                role: PeerRole::Coordinator,
                modified: 0,
            })
            .unwrap();
        store
            .save(&PeerIdentity {
                host: "gone".into(),
                port: 15002,
                role: PeerRole::NodeAgent,
                modified: 0,
            })
            .unwrap();

        let coordinator = CoordinatorBuilder::new(local())
            .with_resolver(resolver(&["node01", "svr2"]))
            .with_store(store.clone())
            .build()
            .await
            .unwrap();

        let registry = coordinator.registry().read();
        assert_eq!(registry.len(), 3);
        let agent = registry.find("node01", 15002).unwrap();
        assert_eq!(registry.liveness(agent), Some(Liveness::UNKNOWN | Liveness::DOWN));
        let member = registry.find("svr2", sink.port()).unwrap();
        assert_eq!(registry.liveness(member), Some(Liveness::UP));
        // the agent that no longer resolves stays visible, down and unresolved
        let gone = registry.find("gone", 15002).unwrap();
        let liveness = registry.liveness(gone).unwrap();
        assert!(liveness.is_down() && liveness.is_unresolved());
        assert!(registry.get(gone).unwrap().role().unwrap().addrs.is_empty());
        drop(registry);

        assert_eq!(coordinator.membership().members(), vec![member]);
        assert!(store.load("gone", 15002).unwrap().is_some());
        coordinator.shutdown();
    }

    #[derive(Debug)]
    struct ReadOnlyStore;

    impl PeerStore for ReadOnlyStore {
        fn load(&self, _host: &str, _port: u16) -> Result<Option<PeerIdentity>> {
            Ok(None)
        }

        fn load_all(&self) -> Result<Vec<PeerIdentity>> {
            Ok(Vec::new())
        }

        fn save(&self, _identity: &PeerIdentity) -> Result<()> {
            Err(ClusterError::Store("read-only file system".into()))
        }

        fn delete(&self, _host: &str, _port: u16) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unstored_peers_are_removed_again() {
        let sink = TunnelSink::start().await.unwrap();
        let coordinator = CoordinatorBuilder::new(local())
            .with_resolver(resolver(&["node01", "svr2"]))
            .with_store(Arc::new(ReadOnlyStore))
            .build()
            .await
            .unwrap();

        assert!(matches!(
            coordinator.add_node_agent("node01", 15002).await,
            Err(ClusterError::Store(_))
        ));
        assert!(matches!(
            coordinator.join("svr2", sink.port()).await,
            Err(ClusterError::Store(_))
        ));

        assert!(coordinator.registry().read().is_empty());
        assert!(coordinator.membership().is_empty());
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn unresolved_agent_gets_its_addresses_when_added_again() {
        let names = resolver(&["node01"]);
        let coordinator = CoordinatorBuilder::new(local())
            .with_resolver(names.clone())
            .add_node_agent("node07", 15002)
            .build()
            .await
            .unwrap();
        let peer = coordinator.registry().read().find("node07", 15002).unwrap();
        assert!(coordinator.registry().read().liveness(peer).unwrap().is_unresolved());
        assert!(coordinator.store().load("node07", 15002).unwrap().is_some());
        assert!(matches!(
            coordinator.add_node_agent("node07", 15002).await,
            Err(ClusterError::AddressNotFound(_))
        ));

        names.add_host("node07", vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 7))]);
        assert_eq!(coordinator.add_node_agent("node07", 15002).await.unwrap(), peer);

        let registry = coordinator.registry().read();
        assert!(!registry.liveness(peer).unwrap().is_unresolved());
        assert_eq!(
            registry.find_by_address(Ipv4Addr::new(127, 0, 0, 7), 15002),
            Some(peer)
        );
    }
}
