//! Membership of a multi-coordinator cluster.
//!
//! Peer coordinators are joined one at a time: resolve, register, open a tunnel
//! stream, announce with a handshake. The member list only grows in steady state.

use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::codec::{Request, RequestBody};
use crate::connection::ConnectionManager;
use crate::registry::{PeerHandle, PeerRole, RoleKind};
use crate::{current_timestamp, ClusterError, Result};

/// A resource usage update fanned out to every peer coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUpdate {
    /// Job the usage belongs to.
    pub job_id: String,
    /// Update operation.
    pub op: u32,
    /// Select specification of the usage.
    pub select: String,
    /// Optional extension string.
    pub extension: Option<String>,
}

/// Outcome of a broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members the update was written to.
    pub delivered: Vec<PeerHandle>,
    /// Members that could not be reached, with the reason.
    pub failed: Vec<(PeerHandle, String)>,
}

impl BroadcastReport {
    /// Returns `true` if every member received the update.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The list of peer coordinators.
#[derive(Debug)]
pub struct ClusterMembership {
    manager: Arc<ConnectionManager>,
    members: RwLock<Vec<PeerHandle>>,
}

impl ClusterMembership {
    /// Creates an empty member list on top of `manager`.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            members: RwLock::new(Vec::new()),
        }
    }

    /// Current members in join order.
    pub fn members(&self) -> Vec<PeerHandle> {
        self.members.read().clone()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    /// Returns `true` if no peer coordinator has joined.
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Joins the coordinator at `(host, port)`.
    ///
    /// On any failure a registry record created by this call is deleted again, so a
    /// failed join leaves nothing behind. A `(host, port)` already registered as a
    /// node agent is refused.
    pub async fn join(&self, host: &str, port: u16) -> Result<PeerHandle> {
        let addrs = self.manager.cache().resolve(host).await?;

        let (peer, created) = {
            let mut registry = self.manager.registry().write();
            let existing = registry.find(host, port);
            let role = existing
                .and_then(|peer| registry.get(peer))
                .and_then(|record| record.role())
                .map(|role| role.kind.role());
            if matches!(role, Some(role) if role != PeerRole::Coordinator) {
                return Err(ClusterError::InvalidRequest(format!(
                    "{host}:{port} is registered as a node agent"
                )));
            }
            let peer = registry.create_coordinator(host, port, addrs)?;
            (peer, existing.is_none())
        };

        let handshake = Request::new(self.manager.config().requester.clone(), RequestBody::Handshake);
        if let Err(err) = self.manager.send_tunnel(peer, &handshake).await {
            warn!(host = %host, port, error = %err, "join failed");
            if created {
                if let Err(cleanup) = self.manager.delete_peer(peer) {
                    debug!(host = %host, port, error = %cleanup, "rollback found no record");
                }
            }
            return Err(err);
        }

        if let Some(RoleKind::Coordinator(data)) = self
            .manager
            .registry()
            .write()
            .get_mut(peer)
            .and_then(|record| record.role_mut())
            .map(|role| &mut role.kind)
        {
            data.joined_at = Some(current_timestamp());
        }

        let mut members = self.members.write();
        if !members.contains(&peer) {
            members.push(peer);
        }
        info!(host = %host, port, peer = %peer, members = members.len(), "peer coordinator joined");
        Ok(peer)
    }

    /// Removes a member and deletes its record.
    pub fn leave(&self, peer: PeerHandle) -> Result<()> {
        self.members.write().retain(|member| *member != peer);
        self.manager.delete_peer(peer).map(|_| ())
    }

    /// Returns the member coordinator connecting from `(addr, port)`, if any.
    pub fn recognize(&self, addr: Ipv4Addr, port: u16) -> Option<PeerHandle> {
        let peer = self.manager.registry().read().peer_coordinator(addr, port)?;
        self.members.read().contains(&peer).then_some(peer)
    }

    /// Sends `update` to every member over one multicast group.
    ///
    /// Members whose tunnel cannot be opened or written are logged and reported; the
    /// group is closed whatever the individual outcomes.
    pub async fn broadcast(&self, update: &ResourceUpdate) -> Result<BroadcastReport> {
        let request = Request::new(
            self.manager.config().requester.clone(),
            RequestBody::ResourceUpdate {
                job_id: update.job_id.clone(),
                op: update.op,
                select: update.select.clone(),
            },
        )
        .with_extension(update.extension.clone());
        let payload = self.manager.codec().encode_request(&request)?;

        let mut report = BroadcastReport::default();
        let mut group = self.manager.tunnel().multicast();
        for peer in self.members() {
            match self.manager.open_tunnel(peer).await {
                Ok(sender) => group.add(sender),
                Err(err) => {
                    warn!(peer = %peer, error = %err, "cannot reach member for broadcast");
                    report.failed.push((peer, err.to_string()));
                }
            }
        }

        let results = group.send(&payload).await;
        let closed = group.close();
        for (stream, result) in results {
            let owner = self.manager.registry().read().find_by_stream(stream);
            let Some(peer) = owner else {
                debug!(stream = %stream, "broadcast stream no longer indexed");
                continue;
            };
            match result {
                Ok(()) => report.delivered.push(peer),
                Err(err) => {
                    self.manager.mark_down(peer, &format!("broadcast failed: {err}"));
                    report.failed.push((peer, err.to_string()));
                }
            }
        }

        debug!(
            group = closed,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "broadcast finished"
        );
        Ok(report)
    }
}
