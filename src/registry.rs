//! Peer registry.
//!
//! The registry is a slab of peer records. Slots freed by [`PeerRegistry::delete`]
//! are tombstoned and reused lowest index first; the table only grows when no
//! tombstone is available, and then by a fixed increment. Records are referenced
//! through [`PeerHandle`]s carrying the slot generation, so a handle kept across a
//! delete never resolves to the record that later reuses the slot.
//!
//! Two secondary indexes are kept in step with the slab: `(address, port)` to peer,
//! for matching an inbound connection to its record, and tunnel stream to peer, for
//! matching inbound tunnel frames.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::address_cache::AddressList;
use crate::config::ClusterConfig;
use crate::connection::Connection;
use crate::tunnel::{StreamId, TunnelStream};
use crate::{current_timestamp, ClusterError, Result};

/// Registry shared between the connection manager, membership and the coordinator.
pub type SharedRegistry = Arc<RwLock<PeerRegistry>>;

/// Generation-checked reference to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

impl PeerHandle {
    /// Slot index of the record.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}.{}", self.index, self.generation)
    }
}

/// Liveness flags of a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Liveness(u8);

impl Liveness {
    /// Never contacted.
    pub const UNKNOWN: Liveness = Liveness(0b001);
    /// Last contact failed or none was established.
    pub const DOWN: Liveness = Liveness(0b010);
    /// Currently reachable.
    pub const UP: Liveness = Liveness(0b100);
    /// Host name did not resolve; the record has no addresses.
    pub const UNRESOLVED: Liveness = Liveness(0b1000);

    /// Flags carried by a freshly created record.
    pub const INITIAL: Liveness = Liveness(Self::UNKNOWN.0 | Self::DOWN.0);

    /// Returns `true` if every flag in `other` is set.
    pub fn contains(self, other: Liveness) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if the UP flag is set.
    pub fn is_up(self) -> bool {
        self.contains(Self::UP)
    }

    /// Returns `true` if the DOWN flag is set.
    pub fn is_down(self) -> bool {
        self.contains(Self::DOWN)
    }

    /// Returns `true` if the UNKNOWN flag is set.
    pub fn is_unknown(self) -> bool {
        self.contains(Self::UNKNOWN)
    }

    /// Returns `true` if the UNRESOLVED flag is set.
    pub fn is_unresolved(self) -> bool {
        self.contains(Self::UNRESOLVED)
    }

    /// Flags of `self` with every flag of `other` cleared.
    pub fn without(self, other: Liveness) -> Liveness {
        Liveness(self.0 & !other.0)
    }

    /// Raw bitmask.
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for Liveness {
    type Output = Liveness;

    fn bitor(self, rhs: Liveness) -> Liveness {
        Liveness(self.0 | rhs.0)
    }
}

impl fmt::Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::with_capacity(4);
        if self.is_unknown() {
            names.push("unknown");
        }
        if self.is_down() {
            names.push("down");
        }
        if self.is_up() {
            names.push("up");
        }
        if self.is_unresolved() {
            names.push("unresolved");
        }
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Work queued for a peer while it is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeferredAction {
    /// Push node attributes.
    SendAttributes,
    /// Push the node configuration.
    SendConfig,
    /// Push hook scripts.
    SendScript,
    /// Push resource definitions.
    SendResourceDefs,
    /// Push credentials.
    SendCredentials,
    /// Remove hooks that no longer exist.
    DeleteHooks,
}

/// Transport owned by a peer record.
#[derive(Debug)]
pub enum TransportHandle {
    /// Direct stream connection.
    Direct(Arc<Connection>),
    /// Stream on the multiplexed tunnel.
    Tunnel(TunnelStream),
}

impl TransportHandle {
    /// Closes the underlying transport.
    pub fn close(self) {
        match self {
            TransportHandle::Direct(conn) => conn.close(),
            TransportHandle::Tunnel(stream) => stream.close(),
        }
    }

    /// Tunnel stream id, if this is a tunnel handle.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            TransportHandle::Direct(_) => None,
            TransportHandle::Tunnel(stream) => Some(stream.id()),
        }
    }
}

/// Per-peer connection and liveness state.
#[derive(Debug)]
pub struct ConnectionState {
    transport: Option<TransportHandle>,
    liveness: Liveness,
    down_since: Option<u64>,
    up_since: Option<u64>,
    down_reason: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            transport: None,
            liveness: Liveness::INITIAL,
            down_since: None,
            up_since: None,
            down_reason: None,
        }
    }
}

impl ConnectionState {
    /// Current liveness flags.
    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Current transport, if any.
    pub fn transport(&self) -> Option<&TransportHandle> {
        self.transport.as_ref()
    }

    /// Unix time of the last transition to DOWN.
    pub fn down_since(&self) -> Option<u64> {
        self.down_since
    }

    /// Unix time of the last transition to UP.
    pub fn up_since(&self) -> Option<u64> {
        self.up_since
    }

    /// Reason recorded with the last transition to DOWN.
    pub fn down_reason(&self) -> Option<&str> {
        self.down_reason.as_deref()
    }

    /// Assigns `transport` and enters UP, clearing DOWN and UNKNOWN in the same step.
    /// Returns the replaced transport and whether this was a transition.
    fn set_up(&mut self, transport: TransportHandle) -> (Option<TransportHandle>, bool) {
        let was_up = self.liveness.is_up();
        let previous = self.transport.replace(transport);
        self.liveness = Liveness::UP;
        self.down_reason = None;
        if !was_up {
            self.up_since = Some(current_timestamp());
        }
        (previous, !was_up)
    }

    /// Enters DOWN, taking the transport out. Returns it and whether this was a transition.
    fn set_down(&mut self, reason: &str) -> (Option<TransportHandle>, bool) {
        let was_up = self.liveness.is_up();
        self.liveness = if self.liveness.is_unresolved() {
            Liveness::DOWN | Liveness::UNRESOLVED
        } else {
            Liveness::DOWN
        };
        self.down_reason = Some(reason.to_string());
        if was_up || self.down_since.is_none() {
            self.down_since = Some(current_timestamp());
        }
        (self.transport.take(), was_up)
    }
}

/// Which role a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// A compute-node agent.
    NodeAgent,
    /// Another coordinator in a multi-coordinator cluster.
    Coordinator,
}

/// Runtime data of a node agent.
#[derive(Debug, Clone, Default)]
pub struct NodeAgentData {
    /// Physical cpus reported by the agent.
    pub physical_cpus: u32,
    /// Cpus currently available.
    pub available_cpus: u32,
    /// Physical memory in kilobytes.
    pub physical_mem_kb: u64,
    /// Jobs running on the agent.
    pub job_count: u32,
    /// Architecture string.
    pub arch: Option<String>,
    /// Agent version string.
    pub version: Option<String>,
    /// Vnode pool the agent belongs to, 0 for none.
    pub pool: u32,
    /// Child vnodes hosted by the agent.
    pub children: Vec<Option<PeerHandle>>,
}

/// Runtime data of a peer coordinator.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorData {
    /// Unix time the handshake was sent.
    pub joined_at: Option<u64>,
}

/// Role specific data.
#[derive(Debug, Clone)]
pub enum RoleKind {
    /// See [`NodeAgentData`].
    NodeAgent(NodeAgentData),
    /// See [`CoordinatorData`].
    Coordinator(CoordinatorData),
}

impl RoleKind {
    /// The role tag.
    pub fn role(&self) -> PeerRole {
        match self {
            RoleKind::NodeAgent(_) => PeerRole::NodeAgent,
            RoleKind::Coordinator(_) => PeerRole::Coordinator,
        }
    }
}

/// Role data envelope shared by both roles.
#[derive(Debug)]
pub struct RoleData {
    /// Connection and liveness state.
    pub conn: ConnectionState,
    /// Addresses of the peer.
    pub addrs: AddressList,
    /// Role specific data.
    pub kind: RoleKind,
}

/// One remote entity.
#[derive(Debug)]
pub struct PeerRecord {
    host: String,
    port: u16,
    rm_port: u16,
    modified: u64,
    role: Option<RoleData>,
    actions: Vec<DeferredAction>,
}

impl PeerRecord {
    /// Host name as registered.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Service port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Management port; the tunnel transport connects here.
    pub fn rm_port(&self) -> u16 {
        self.rm_port
    }

    /// Unix time of the last modification.
    pub fn modified(&self) -> u64 {
        self.modified
    }

    /// Role data, once attached.
    pub fn role(&self) -> Option<&RoleData> {
        self.role.as_ref()
    }

    /// Mutable role data.
    pub fn role_mut(&mut self) -> Option<&mut RoleData> {
        self.role.as_mut()
    }

    /// Pending deferred actions in queue order.
    pub fn actions(&self) -> &[DeferredAction] {
        &self.actions
    }

    /// Liveness of the peer; records without role data are treated as never contacted.
    pub fn liveness(&self) -> Liveness {
        self.role
            .as_ref()
            .map_or(Liveness::INITIAL, |role| role.conn.liveness())
    }

    /// Returns `true` if this record names a peer coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.role
            .as_ref()
            .map_or(false, |role| role.kind.role() == PeerRole::Coordinator)
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }
}

/// Receives liveness transitions and owns scheduled work referencing peers.
///
/// Both callbacks run while the registry's write lock is held. An implementation
/// must not lock the [`SharedRegistry`] itself; hand the notification to another
/// task if it needs to look at peer records.
pub trait WorkScheduler: Send + Sync + fmt::Debug {
    /// Called after a peer changed liveness.
    fn liveness_changed(&self, peer: PeerHandle, host: &str, port: u16, liveness: Liveness) {
        let _ = (peer, host, port, liveness);
    }

    /// Called before a peer is deleted; cancel every task referencing it.
    fn cancel_peer_tasks(&self, peer: PeerHandle) {
        let _ = peer;
    }
}

/// Scheduler that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl WorkScheduler for NoopScheduler {}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    record: Option<PeerRecord>,
}

/// Slab of peer records with reverse indexes.
#[derive(Debug)]
pub struct PeerRegistry {
    slots: Vec<Slot>,
    free: BTreeSet<u32>,
    live: usize,
    grow_increment: usize,
    max_hostname_len: usize,
    initial_actions: Vec<DeferredAction>,
    by_addr: BTreeMap<(Ipv4Addr, u16), PeerHandle>,
    by_stream: BTreeMap<StreamId, PeerHandle>,
    scheduler: Arc<dyn WorkScheduler>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new(config: &ClusterConfig, scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            live: 0,
            grow_increment: config.registry_grow_increment.max(1),
            max_hostname_len: config.max_hostname_len,
            initial_actions: config.initial_peer_actions.clone(),
            by_addr: BTreeMap::new(),
            by_stream: BTreeMap::new(),
            scheduler,
        }
    }

    /// Wraps the registry for sharing.
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if no record is live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots, live or tombstoned.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the record for `(host, port)`, creating it if needed.
    pub fn create_or_get(&mut self, host: &str, port: u16) -> Result<PeerHandle> {
        self.entry(host, port).map(|(handle, _)| handle)
    }

    /// Like [`create_or_get`](Self::create_or_get), also reporting whether a record was created.
    pub fn entry(&mut self, host: &str, port: u16) -> Result<(PeerHandle, bool)> {
        if host.is_empty() {
            return Err(ClusterError::InvalidRequest("empty host name".into()));
        }
        if host.len() > self.max_hostname_len {
            return Err(ClusterError::InvalidRequest(format!(
                "host name longer than {} bytes",
                self.max_hostname_len
            )));
        }
        if let Some(handle) = self.find(host, port) {
            return Ok((handle, false));
        }

        let index = match self.free.pop_first() {
            Some(index) => index,
            None => {
                self.grow()?;
                self.free
                    .pop_first()
                    .ok_or_else(|| ClusterError::System("peer table growth yielded no slot".into()))?
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.record = Some(PeerRecord {
            host: host.to_string(),
            port,
            rm_port: port.saturating_add(1),
            modified: current_timestamp(),
            role: None,
            actions: self.initial_actions.clone(),
        });
        self.live += 1;

        let handle = PeerHandle {
            index,
            generation: slot.generation,
        };
        debug!(host = %host, port, peer = %handle, "created peer record");
        Ok((handle, true))
    }

    fn grow(&mut self) -> Result<()> {
        let start = self.slots.len();
        self.slots
            .try_reserve_exact(self.grow_increment)
            .map_err(|err| ClusterError::System(format!("cannot grow peer table: {err}")))?;
        let end = start + self.grow_increment;
        if end > u32::MAX as usize {
            return Err(ClusterError::System("peer table is full".into()));
        }
        self.slots.resize_with(end, Slot::default);
        self.free.extend(start as u32..end as u32);
        trace!(from = start, to = end, "grew peer table");
        Ok(())
    }

    /// Looks up `(host, port)`; the host is compared case-insensitively.
    pub fn find(&self, host: &str, port: u16) -> Option<PeerHandle> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.record
                .as_ref()
                .filter(|record| record.matches(host, port))
                .map(|_| PeerHandle {
                    index: index as u32,
                    generation: slot.generation,
                })
        })
    }

    /// Resolves a handle.
    pub fn get(&self, handle: PeerHandle) -> Option<&PeerRecord> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    /// Resolves a handle mutably.
    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerRecord> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    fn record_mut(&mut self, handle: PeerHandle) -> Result<&mut PeerRecord> {
        self.get_mut(handle).ok_or(ClusterError::StalePeer)
    }

    /// Iterates over live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (PeerHandle, &PeerRecord)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (
                    PeerHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    record,
                )
            })
        })
    }

    /// Liveness of a peer, `None` for a stale handle.
    pub fn liveness(&self, handle: PeerHandle) -> Option<Liveness> {
        self.get(handle).map(PeerRecord::liveness)
    }

    /// Deletes a record and returns it stripped of its role data.
    ///
    /// Scheduled work and pending actions are dropped first, then the transport is
    /// closed and every index entry pointing at the record is removed.
    pub fn delete(&mut self, handle: PeerHandle) -> Result<PeerRecord> {
        if self.get(handle).is_none() {
            return Err(ClusterError::StalePeer);
        }
        self.scheduler.cancel_peer_tasks(handle);

        let slot = &mut self.slots[handle.index as usize];
        let mut record = slot.record.take().ok_or(ClusterError::StalePeer)?;
        slot.generation = slot.generation.wrapping_add(1);

        record.actions.clear();
        if let Some(mut role) = record.role.take() {
            if let Some(transport) = role.conn.transport.take() {
                transport.close();
            }
            for addr in role.addrs.iter() {
                let key = (*addr, record.port);
                if self.by_addr.get(&key) == Some(&handle) {
                    self.by_addr.remove(&key);
                }
            }
        }
        self.by_stream.retain(|_, owner| *owner != handle);

        self.free.insert(handle.index);
        self.live -= 1;
        info!(host = %record.host, port = record.port, peer = %handle, "deleted peer record");
        Ok(record)
    }

    /// Attaches role data to a record and indexes its addresses.
    ///
    /// A record that already has role data keeps it and `addrs` is dropped. If the
    /// role data cannot be allocated the record is deleted.
    pub fn create_role_data(
        &mut self,
        handle: PeerHandle,
        role: PeerRole,
        addrs: AddressList,
    ) -> Result<()> {
        let record = self.record_mut(handle)?;
        if record.role.is_some() {
            trace!(peer = %handle, "role data already attached");
            return Ok(());
        }

        let kind = match role {
            PeerRole::NodeAgent => {
                let mut children = Vec::new();
                if let Err(err) = children.try_reserve_exact(1) {
                    let err = ClusterError::System(format!("cannot allocate node data: {err}"));
                    self.delete(handle)?;
                    return Err(err);
                }
                children.push(None);
                RoleKind::NodeAgent(NodeAgentData {
                    children,
                    ..Default::default()
                })
            }
            PeerRole::Coordinator => RoleKind::Coordinator(CoordinatorData::default()),
        };

        let port = record.port;
        record.role = Some(RoleData {
            conn: ConnectionState::default(),
            addrs: Arc::clone(&addrs),
            kind,
        });
        record.modified = current_timestamp();

        self.index_addresses(handle, port, &addrs);
        Ok(())
    }

    fn index_addresses(&mut self, handle: PeerHandle, port: u16, addrs: &[Ipv4Addr]) {
        for addr in addrs {
            match self.by_addr.get(&(*addr, port)) {
                Some(owner) if *owner != handle => {
                    warn!(addr = %addr, port, owner = %owner, "address already indexed for another peer");
                }
                _ => {
                    self.by_addr.insert((*addr, port), handle);
                }
            }
        }
    }

    /// Registers a node agent whose host does not resolve. The record has no
    /// addresses and stays DOWN and UNRESOLVED until [`set_addresses`](Self::set_addresses).
    pub fn create_unresolved_node_agent(&mut self, host: &str, port: u16) -> Result<PeerHandle> {
        let handle = self.create_node_agent(host, port, AddressList::from(Vec::new()))?;
        let record = self.record_mut(handle)?;
        if let Some(role) = record.role.as_mut().filter(|role| role.addrs.is_empty()) {
            role.conn.liveness = role.conn.liveness | Liveness::UNRESOLVED;
            debug!(host = %record.host, port, "node agent registered unresolved");
        }
        Ok(handle)
    }

    /// Gives an unresolved record its addresses and clears UNRESOLVED. A record that
    /// already has addresses keeps them.
    pub fn set_addresses(&mut self, handle: PeerHandle, addrs: AddressList) -> Result<()> {
        let record = self.record_mut(handle)?;
        let port = record.port;
        let role = record.role.as_mut().ok_or_else(|| {
            ClusterError::System(format!("{}:{port} has no role data", record.host))
        })?;
        if !role.addrs.is_empty() {
            return Ok(());
        }
        role.addrs = Arc::clone(&addrs);
        role.conn.liveness = role.conn.liveness.without(Liveness::UNRESOLVED);
        record.modified = current_timestamp();
        self.index_addresses(handle, port, &addrs);
        Ok(())
    }

    /// Creates (or returns) a node agent record with role data attached.
    pub fn create_node_agent(
        &mut self,
        host: &str,
        port: u16,
        addrs: AddressList,
    ) -> Result<PeerHandle> {
        let handle = self.create_or_get(host, port)?;
        self.create_role_data(handle, PeerRole::NodeAgent, addrs)?;
        Ok(handle)
    }

    /// Creates (or returns) a peer coordinator record. Its management port equals its port.
    pub fn create_coordinator(
        &mut self,
        host: &str,
        port: u16,
        addrs: AddressList,
    ) -> Result<PeerHandle> {
        let (handle, created) = self.entry(host, port)?;
        if created {
            self.record_mut(handle)?.rm_port = port;
        }
        self.create_role_data(handle, PeerRole::Coordinator, addrs)?;
        Ok(handle)
    }

    /// Finds the peer an `(address, port)` pair belongs to.
    pub fn find_by_address(&self, addr: Ipv4Addr, port: u16) -> Option<PeerHandle> {
        self.by_addr.get(&(addr, port)).copied()
    }

    /// Finds the peer owning a tunnel stream.
    pub fn find_by_stream(&self, stream: StreamId) -> Option<PeerHandle> {
        self.by_stream.get(&stream).copied()
    }

    /// Returns the peer coordinator at `(address, port)`, if that address is known
    /// and belongs to a coordinator.
    pub fn peer_coordinator(&self, addr: Ipv4Addr, port: u16) -> Option<PeerHandle> {
        self.find_by_address(addr, port).filter(|handle| {
            self.get(*handle)
                .map_or(false, |record| record.is_coordinator() && record.rm_port == record.port)
        })
    }

    /// Updates the modification time of a record.
    pub fn touch(&mut self, handle: PeerHandle) -> Result<()> {
        self.record_mut(handle)?.modified = current_timestamp();
        Ok(())
    }

    /// Queues a deferred action unless an identical one is already pending.
    pub fn push_action(&mut self, handle: PeerHandle, action: DeferredAction) -> Result<()> {
        let record = self.record_mut(handle)?;
        if !record.actions.contains(&action) {
            record.actions.push(action);
        }
        Ok(())
    }

    /// Takes every pending action, leaving the queue empty.
    pub fn take_actions(&mut self, handle: PeerHandle) -> Result<Vec<DeferredAction>> {
        Ok(std::mem::take(&mut self.record_mut(handle)?.actions))
    }

    /// Assigns a transport and marks the peer UP.
    pub fn mark_up(&mut self, handle: PeerHandle, transport: TransportHandle) -> Result<()> {
        let stream = transport.stream_id();
        let record = self.record_mut(handle)?;
        let (host, port) = (record.host.clone(), record.port);
        let role = record
            .role
            .as_mut()
            .ok_or_else(|| ClusterError::System(format!("{host}:{port} has no connection state")))?;

        let (previous, changed) = role.conn.set_up(transport);
        let liveness = role.conn.liveness();
        record.modified = current_timestamp();

        if let Some(previous) = previous {
            if let Some(old) = previous.stream_id() {
                self.by_stream.remove(&old);
            }
            previous.close();
        }
        if let Some(stream) = stream {
            self.by_stream.insert(stream, handle);
        }

        if changed {
            info!(host = %host, port, peer = %handle, "peer is up");
            self.scheduler.liveness_changed(handle, &host, port, liveness);
        }
        Ok(())
    }

    /// Marks the peer DOWN with `reason`, closing its transport.
    pub fn mark_down(&mut self, handle: PeerHandle, reason: &str) -> Result<()> {
        let record = self.record_mut(handle)?;
        let (host, port) = (record.host.clone(), record.port);
        let Some(role) = record.role.as_mut() else {
            return Ok(());
        };

        let (transport, changed) = role.conn.set_down(reason);
        let liveness = role.conn.liveness();
        record.modified = current_timestamp();

        if let Some(transport) = transport {
            if let Some(stream) = transport.stream_id() {
                self.by_stream.remove(&stream);
            }
            transport.close();
        }

        if changed {
            warn!(host = %host, port, peer = %handle, reason = %reason, "peer is down");
            self.scheduler.liveness_changed(handle, &host, port, liveness);
        } else {
            debug!(host = %host, port, reason = %reason, "peer still down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingScheduler;

    fn registry_with(increment: usize) -> PeerRegistry {
        let config = ClusterConfig {
            registry_grow_increment: increment,
            ..Default::default()
        };
        PeerRegistry::new(&config, Arc::new(NoopScheduler))
    }

    fn addrs(list: &[[u8; 4]]) -> AddressList {
        list.iter().map(|octets| Ipv4Addr::from(*octets)).collect()
    }

    #[test]
    fn create_or_get_is_idempotent() {
        let mut registry = registry_with(10);
        let first = registry.create_or_get("node01", 15002).unwrap();
        let second = registry.create_or_get("NODE01", 15002).unwrap();
        let other_port = registry.create_or_get("node01", 15003).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other_port);
        assert_eq!(registry.len(), 2);

        let record = registry.get(first).unwrap();
        assert_eq!(record.rm_port(), 15003);
        assert_eq!(record.liveness(), Liveness::UNKNOWN | Liveness::DOWN);
        assert_eq!(record.actions().len(), 4);
    }

    #[test]
    fn never_holds_duplicate_identities() {
        let mut registry = registry_with(3);
        let hosts = ["a", "b", "A", "c", "b", "B", "d", "a"];
        for (i, host) in hosts.iter().enumerate() {
            registry.create_or_get(host, 100 + (i % 2) as u16).unwrap();
        }

        let mut seen = BTreeSet::new();
        for (_, record) in registry.iter() {
            assert!(seen.insert((record.host().to_ascii_lowercase(), record.port())));
        }
        assert_eq!(seen.len(), registry.len());
    }

    #[test]
    fn growth_keeps_existing_records() {
        let mut registry = registry_with(4);
        let mut handles = Vec::new();
        for i in 0..4 {
            handles.push(registry.create_or_get(&format!("node{i}"), 15002).unwrap());
        }
        assert_eq!(registry.capacity(), 4);

        registry.create_or_get("node4", 15002).unwrap();
        assert_eq!(registry.capacity(), 8);

        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(registry.find(&format!("node{i}"), 15002), Some(*handle));
        }
    }

    #[test]
    fn tombstones_are_reused_lowest_first() {
        let mut registry = registry_with(10);
        let handles: Vec<_> = (0..5)
            .map(|i| registry.create_or_get(&format!("n{i}"), 1).unwrap())
            .collect();

        registry.delete(handles[3]).unwrap();
        registry.delete(handles[1]).unwrap();

        let reused = registry.create_or_get("fresh", 1).unwrap();
        assert_eq!(reused.index(), 1);
        assert_eq!(registry.capacity(), 10);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn stale_handle_never_resolves() {
        let mut registry = registry_with(10);
        let old = registry.create_or_get("node01", 1).unwrap();
        registry.delete(old).unwrap();
        let new = registry.create_or_get("node02", 1).unwrap();

        assert_eq!(old.index(), new.index());
        assert!(registry.get(old).is_none());
        assert!(matches!(registry.delete(old), Err(ClusterError::StalePeer)));
        assert_eq!(registry.get(new).unwrap().host(), "node02");
    }

    #[test]
    fn delete_clears_reverse_index() {
        let mut registry = registry_with(10);
        let list = addrs(&[[10, 0, 0, 1], [10, 0, 1, 1]]);
        let handle = registry
            .create_node_agent("node01", 15002, Arc::clone(&list))
            .unwrap();

        for addr in list.iter() {
            assert_eq!(registry.find_by_address(*addr, 15002), Some(handle));
        }

        let record = registry.delete(handle).unwrap();
        assert!(record.actions().is_empty());
        assert!(record.role().is_none());
        for addr in list.iter() {
            assert_eq!(registry.find_by_address(*addr, 15002), None);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn role_data_is_attached_once() {
        let mut registry = registry_with(10);
        let handle = registry
            .create_node_agent("node01", 15002, addrs(&[[10, 0, 0, 1]]))
            .unwrap();
        let again = registry
            .create_node_agent("node01", 15002, addrs(&[[10, 9, 9, 9]]))
            .unwrap();

        assert_eq!(handle, again);
        let role = registry.get(handle).unwrap().role().unwrap();
        assert_eq!(&*role.addrs, &[Ipv4Addr::new(10, 0, 0, 1)]);
        assert!(matches!(&role.kind, RoleKind::NodeAgent(data) if data.children.len() == 1));
        assert_eq!(registry.find_by_address(Ipv4Addr::new(10, 9, 9, 9), 15002), None);
    }

    #[test]
    fn coordinator_records_use_their_own_port() {
        let mut registry = registry_with(10);
        let addr = Ipv4Addr::new(10, 0, 0, 7);
        let handle = registry
            .create_coordinator("svr2", 15001, addrs(&[[10, 0, 0, 7]]))
            .unwrap();

        assert_eq!(registry.get(handle).unwrap().rm_port(), 15001);
        assert_eq!(registry.peer_coordinator(addr, 15001), Some(handle));

        let agent = registry
            .create_node_agent("node7", 15002, addrs(&[[10, 0, 0, 7]]))
            .unwrap();
        assert_eq!(registry.find_by_address(addr, 15002), Some(agent));
        assert_eq!(registry.peer_coordinator(addr, 15002), None);
    }

    #[test]
    fn rejects_bad_host_names() {
        let mut registry = registry_with(10);
        assert!(matches!(
            registry.create_or_get("", 1),
            Err(ClusterError::InvalidRequest(_))
        ));
        let long = "h".repeat(65);
        assert!(matches!(
            registry.create_or_get(&long, 1),
            Err(ClusterError::InvalidRequest(_))
        ));
        assert_eq!(registry.capacity(), 0);
    }

    #[test]
    fn deferred_actions_transfer_out() {
        let mut registry = registry_with(10);
        let handle = registry.create_or_get("node01", 1).unwrap();
        registry
            .push_action(handle, DeferredAction::SendCredentials)
            .unwrap();
        registry
            .push_action(handle, DeferredAction::SendConfig)
            .unwrap();

        let taken = registry.take_actions(handle).unwrap();
        assert_eq!(taken.len(), 5);
        assert_eq!(taken.last(), Some(&DeferredAction::SendCredentials));
        assert!(registry.get(handle).unwrap().actions().is_empty());
    }

    #[test]
    fn delete_cancels_scheduled_work() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut registry = PeerRegistry::new(&ClusterConfig::default(), scheduler.clone());
        let handle = registry
            .create_node_agent("node01", 15002, addrs(&[[10, 0, 0, 1]]))
            .unwrap();

        registry.mark_down(handle, "unreachable").unwrap();
        registry.delete(handle).unwrap();

        assert_eq!(scheduler.cancelled(), vec![handle]);
        // already DOWN from creation, so no transition was reported
        assert!(scheduler.transitions().is_empty());
    }

    #[test]
    fn mark_down_records_reason_and_time() {
        let mut registry = registry_with(10);
        let handle = registry
            .create_node_agent("node01", 15002, addrs(&[[10, 0, 0, 1]]))
            .unwrap();
        registry.mark_down(handle, "cannot open TCP stream").unwrap();

        let conn = &registry.get(handle).unwrap().role().unwrap().conn;
        assert_eq!(conn.liveness(), Liveness::DOWN);
        assert!(conn.down_since().is_some());
        assert_eq!(conn.down_reason(), Some("cannot open TCP stream"));
    }

    #[test]
    fn liveness_display() {
        assert_eq!(Liveness::INITIAL.to_string(), "unknown|down");
        assert_eq!(Liveness::UP.to_string(), "up");
        assert_eq!(Liveness::default().to_string(), "none");
    }

    #[test]
    fn unresolved_agent_is_down_until_it_gets_addresses() {
        let mut registry = registry_with(10);
        let handle = registry.create_unresolved_node_agent("node09", 15002).unwrap();
        let liveness = registry.liveness(handle).unwrap();
        assert!(liveness.is_down() && liveness.is_unresolved());
        assert!(registry.get(handle).unwrap().role().unwrap().addrs.is_empty());

        registry.mark_down(handle, "still unknown").unwrap();
        assert!(registry.liveness(handle).unwrap().is_unresolved());

        registry
            .set_addresses(handle, addrs(&[[10, 0, 0, 9]]))
            .unwrap();
        let liveness = registry.liveness(handle).unwrap();
        assert!(liveness.is_down() && !liveness.is_unresolved());
        assert_eq!(
            registry.find_by_address(Ipv4Addr::new(10, 0, 0, 9), 15002),
            Some(handle)
        );
        assert_eq!(
            (Liveness::DOWN | Liveness::UNRESOLVED).to_string(),
            "down|unresolved"
        );
    }
}
