//! Connection manager.
//!
//! Opens direct stream connections and tunnel streams to peers, keeps the set of
//! active direct connections, and drives each peer's liveness through the registry:
//! UNKNOWN|DOWN until the first successful connect, UP on success, DOWN again on a
//! connect failure, an I/O error, or the close of the peer's tunnel.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::address_cache::AddressCache;
use crate::codec::{FrameCodec, Reply, Request, RequestBody};
use crate::config::ClusterConfig;
use crate::error::{is_transient_io, ConnectCode};
use crate::registry::{PeerHandle, PeerRecord, PeerRegistry, SharedRegistry, TransportHandle};
use crate::tunnel::{StreamId, TunnelFrame, TunnelSender, TunnelTransport};
use crate::{ClusterError, Result};

/// Identifier of a direct connection in the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Opens the TCP streams behind direct connections.
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Connects to `target`. The connect timeout is applied by the caller.
    fn dial(&self, target: SocketAddrV4) -> BoxFuture<'_, io::Result<TcpStream>>;
}

/// Dialer backed by [`TcpStream::connect`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, target: SocketAddrV4) -> BoxFuture<'_, io::Result<TcpStream>> {
        Box::pin(TcpStream::connect(target))
    }
}

/// Transport discipline requested from [`ConnectionManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// A short lived stream connection.
    Direct,
    /// A stream on the peer's persistent tunnel.
    Tunnel,
}

/// Result of a successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connected {
    /// The endpoint is this coordinator; no socket was opened.
    Local,
    /// A direct connection registered in the active set.
    Direct(ConnectionId),
    /// A tunnel stream owned by the peer record.
    Tunnel(StreamId),
}

impl Connected {
    /// Connect result code for this outcome.
    pub fn code(&self) -> ConnectCode {
        match self {
            Connected::Local => ConnectCode::Local,
            Connected::Direct(id) => ConnectCode::Handle(id.0),
            Connected::Tunnel(stream) => ConnectCode::Handle(stream.get()),
        }
    }
}

/// How [`ConnectionManager::disconnect`] closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Send a disconnect request first. With `wait` the call blocks until the far
    /// end closes; otherwise the connection closes on its next inbound EOF.
    Graceful {
        /// Block until the remote close.
        wait: bool,
    },
    /// Close immediately.
    Forced,
}

/// A direct stream connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddrV4,
    peer: Option<PeerHandle>,
    authenticated: AtomicBool,
    close_on_eof: AtomicBool,
    closed: AtomicBool,
    // wakes an idle reader so it releases the stream lock
    wake: Notify,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

impl Connection {
    fn new(id: ConnectionId, remote: SocketAddrV4, peer: Option<PeerHandle>, stream: TcpStream) -> Self {
        Self {
            id,
            remote,
            peer,
            authenticated: AtomicBool::new(false),
            close_on_eof: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            stream: tokio::sync::Mutex::new(Some(stream)),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote endpoint.
    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    /// Peer the connection belongs to, if the endpoint is a registered peer.
    pub fn peer(&self) -> Option<PeerHandle> {
        self.peer
    }

    /// Returns `true` once the connection is marked authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Returns `true` if the connection closes on its next inbound EOF.
    pub fn closes_on_eof(&self) -> bool {
        self.close_on_eof.load(Ordering::Acquire)
    }

    /// Returns `true` once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the connection. A round trip in flight keeps the socket until it
    /// finishes and then finds the connection closed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
        self.wake.notify_one();
        trace!(conn = %self.id, "closed connection");
    }

    /// Sends `request` and waits for its reply while holding the connection lock.
    async fn round_trip(
        &self,
        codec: &FrameCodec,
        request: &Request,
        reply_timeout: std::time::Duration,
    ) -> Result<Reply> {
        self.wake.notify_one();
        let mut guard = self.stream.lock().await;
        if self.is_closed() {
            guard.take();
        }
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;

        let result = async {
            codec.write_request(stream, request).await?;
            let reply = timeout(reply_timeout, codec.read_reply(stream)).await??;
            Ok::<_, ClusterError>(reply)
        }
        .await;

        if matches!(&result, Err(err) if err.is_link_failure()) {
            guard.take();
            self.closed.store(true, Ordering::Release);
        }
        result
    }
}

/// Inbound tunnel frames matched back to their peer.
#[derive(Debug)]
pub struct InboundFrames {
    rx: mpsc::UnboundedReceiver<TunnelFrame>,
    registry: SharedRegistry,
}

impl InboundFrames {
    /// Waits for the next frame. The peer is `None` if its stream is no longer indexed.
    pub async fn recv(&mut self) -> Option<(Option<PeerHandle>, TunnelFrame)> {
        let frame = self.rx.recv().await?;
        let peer = self.registry.read().find_by_stream(frame.stream);
        if peer.is_none() {
            debug!(stream = %frame.stream, endpoint = %frame.endpoint, "frame for unknown stream");
        }
        Some((peer, frame))
    }
}

/// Opens, tracks and closes connections to peers.
pub struct ConnectionManager {
    config: Arc<ClusterConfig>,
    registry: SharedRegistry,
    cache: Arc<AddressCache>,
    tunnel: Arc<TunnelTransport>,
    dialer: Arc<dyn Dialer>,
    codec: FrameCodec,
    active: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.config.local_endpoint())
            .field("active", &self.active.len())
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager over `registry` and `cache`.
    ///
    /// Peers whose tunnel is closed by the remote end are marked DOWN as soon as
    /// the tunnel reader stops.
    pub fn new(config: Arc<ClusterConfig>, registry: SharedRegistry, cache: Arc<AddressCache>) -> Self {
        let tunnel = Arc::new(TunnelTransport::new(&config));
        let weak = Arc::downgrade(&registry);
        tunnel.set_close_handler(Arc::new(move |endpoint: SocketAddrV4| {
            mark_tunnel_peers_down(&weak, endpoint)
        }));
        let codec = FrameCodec::new(&config);
        Self {
            config,
            registry,
            cache,
            tunnel,
            dialer: Arc::new(TcpDialer),
            codec,
            active: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Replaces the dialer used for direct connections.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The shared registry.
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// The address cache.
    pub fn cache(&self) -> &Arc<AddressCache> {
        &self.cache
    }

    /// The tunnel transport.
    pub fn tunnel(&self) -> &Arc<TunnelTransport> {
        &self.tunnel
    }

    /// Frame codec configured for this cluster.
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Looks up an active direct connection.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.active.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of active direct connections.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Takes the inbound tunnel frames. Only the first call gets them.
    pub fn inbound(&self) -> Option<InboundFrames> {
        self.tunnel.take_inbound().map(|rx| InboundFrames {
            rx,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Connects to `(addr, port)` with the requested transport.
    ///
    /// The local coordinator endpoint yields [`Connected::Local`]. A registered peer
    /// that is DOWN first gets its tunnel stream reopened; if that fails the connect is
    /// fatal. Direct connects refused by the remote are retried once.
    pub async fn connect(&self, addr: Ipv4Addr, port: u16, kind: TransportKind) -> Result<Connected> {
        if self.config.is_local(addr, port) {
            trace!(addr = %addr, port, "connect to self");
            return Ok(Connected::Local);
        }

        let known = self.registry.read().find_by_address(addr, port);
        if let Some(peer) = known {
            let down = self
                .registry
                .read()
                .liveness(peer)
                .map_or(false, |liveness| liveness.is_down());
            if down {
                if let Err(err) = self.open_tunnel(peer).await {
                    return Err(ClusterError::ConnectFatal {
                        addr: SocketAddrV4::new(addr, port).to_string(),
                        reason: format!("peer unreachable: {err}"),
                    });
                }
            }
        }

        match kind {
            TransportKind::Tunnel => {
                let Some(peer) = known else {
                    return Err(ClusterError::ConnectRetry {
                        addr: SocketAddrV4::new(addr, port).to_string(),
                        reason: "no registered peer for tunnel".into(),
                    });
                };
                let sender = self.open_tunnel(peer).await?;
                Ok(Connected::Tunnel(sender.id()))
            }
            TransportKind::Direct => self.connect_direct(SocketAddrV4::new(addr, port), known).await,
        }
    }

    async fn dial(&self, target: SocketAddrV4) -> io::Result<TcpStream> {
        match timeout(self.config.connect_timeout, self.dialer.dial(target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    async fn connect_direct(&self, target: SocketAddrV4, peer: Option<PeerHandle>) -> Result<Connected> {
        let mut attempt = self.dial(target).await;
        if matches!(&attempt, Err(err) if err.kind() == io::ErrorKind::ConnectionRefused) {
            debug!(addr = %target, "connection refused, retrying once");
            attempt = self.dial(target).await;
        }

        let stream = match attempt {
            Ok(stream) => stream,
            Err(err) => {
                let reason = format!("cannot open TCP stream: {err}");
                if let Some(peer) = peer {
                    self.mark_down(peer, &reason);
                }
                warn!(addr = %target, error = %err, "connect failed");
                return Err(if is_transient_io(&err) {
                    ClusterError::ConnectRetry {
                        addr: target.to_string(),
                        reason,
                    }
                } else {
                    ClusterError::ConnectFatal {
                        addr: target.to_string(),
                        reason,
                    }
                });
            }
        };
        let _ = stream.set_nodelay(true);

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(id, target, peer, stream));
        conn.authenticated.store(true, Ordering::Release);
        self.active.insert(id, Arc::clone(&conn));

        if let Some(peer) = peer {
            let mut registry = self.registry.write();
            let up = registry.liveness(peer).map_or(false, |liveness| liveness.is_up());
            let result = if up {
                registry.touch(peer)
            } else {
                registry.mark_up(peer, TransportHandle::Direct(Arc::clone(&conn)))
            };
            if let Err(err) = result {
                warn!(peer = %peer, error = %err, "could not record connection on peer");
            }
        }
        debug!(addr = %target, conn = %id, "connected");
        Ok(Connected::Direct(id))
    }

    /// Opens the peer's tunnel stream, or returns the open one.
    pub async fn open_tunnel(&self, peer: PeerHandle) -> Result<TunnelSender> {
        let endpoint = {
            let registry = self.registry.read();
            let record = registry.get(peer).ok_or(ClusterError::StalePeer)?;
            if let Some(sender) = open_tunnel_sender(record) {
                return Ok(sender);
            }
            let role = record.role().ok_or_else(|| {
                ClusterError::System(format!("{}:{} has no connection state", record.host(), record.port()))
            })?;
            let addr = role
                .addrs
                .first()
                .copied()
                .ok_or_else(|| ClusterError::AddressNotFound(record.host().to_string()))?;
            SocketAddrV4::new(addr, record.rm_port())
        };

        match self.tunnel.open(endpoint).await {
            Ok(stream) => {
                let sender = stream.sender();
                self.registry
                    .write()
                    .mark_up(peer, TransportHandle::Tunnel(stream))?;
                Ok(sender)
            }
            Err(err) => {
                self.mark_down(peer, &format!("cannot open tunnel stream: {err}"));
                Err(err)
            }
        }
    }

    /// Encodes `request` and sends it on the peer's tunnel stream, opening one if needed.
    pub async fn send_tunnel(&self, peer: PeerHandle, request: &Request) -> Result<()> {
        let sender = self.open_tunnel(peer).await?;
        let frame = self.codec.encode_request(request)?;
        if let Err(err) = sender.send(&frame).await {
            self.mark_down(peer, &format!("tunnel write failed: {err}"));
            return Err(err);
        }
        Ok(())
    }

    /// One request/reply round trip on a direct connection.
    ///
    /// A failure that leaves the stream unusable (see
    /// [`ClusterError::is_link_failure`]) drops the connection and marks its peer DOWN.
    pub async fn request(&self, id: ConnectionId, request: &Request) -> Result<Reply> {
        let conn = self.connection(id).ok_or(ClusterError::UnknownConnection(id.0))?;
        let result = conn
            .round_trip(&self.codec, request, self.config.reply_timeout)
            .await;
        if let Some(err) = result.as_ref().err().filter(|err| err.is_link_failure()) {
            if let Some(peer) = conn.peer() {
                self.mark_down(peer, &format!("connection failed: {err}"));
            }
            self.active.remove(&id);
        }
        result
    }

    /// Services one inbound read on a direct connection.
    ///
    /// Returns the number of bytes read; `0` means the remote closed and the
    /// connection was removed. Data arriving on a connection that is waiting for its
    /// close is discarded. While idle the wait gives way to round trips and
    /// disconnects on the same connection.
    pub async fn poll_readable(&self, id: ConnectionId) -> Result<usize> {
        let conn = self.connection(id).ok_or(ClusterError::UnknownConnection(id.0))?;
        let mut buf = [0u8; 1024];
        loop {
            let mut guard = conn.stream.lock().await;
            if conn.is_closed() {
                guard.take();
            }
            let Some(stream) = guard.as_mut() else {
                drop(guard);
                self.active.remove(&id);
                return Ok(0);
            };

            let ready = tokio::select! {
                ready = stream.readable() => Some(ready),
                _ = conn.wake.notified() => None,
            };
            let read = match ready {
                None => continue,
                Some(Ok(())) => match stream.try_read(&mut buf) {
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    read => read,
                },
                Some(Err(err)) => Err(err),
            };

            return match read {
                Ok(0) => {
                    guard.take();
                    drop(guard);
                    conn.closed.store(true, Ordering::Release);
                    self.active.remove(&id);
                    debug!(conn = %id, armed = conn.closes_on_eof(), "connection closed by remote");
                    Ok(0)
                }
                Ok(n) => {
                    if conn.closes_on_eof() {
                        trace!(conn = %id, bytes = n, "discarding data while closing");
                    }
                    Ok(n)
                }
                Err(err) => {
                    guard.take();
                    drop(guard);
                    conn.closed.store(true, Ordering::Release);
                    self.active.remove(&id);
                    if let Some(peer) = conn.peer() {
                        self.mark_down(peer, &format!("I/O error: {err}"));
                    }
                    Err(err.into())
                }
            };
        }
    }

    /// Closes a direct connection.
    pub async fn disconnect(&self, id: ConnectionId, mode: DisconnectMode) -> Result<()> {
        let conn = self.connection(id).ok_or(ClusterError::UnknownConnection(id.0))?;

        let wait = match mode {
            DisconnectMode::Forced => {
                self.active.remove(&id);
                conn.close();
                debug!(conn = %id, "forced disconnect");
                return Ok(());
            }
            DisconnectMode::Graceful { wait } => wait,
        };

        let request = Request::new(self.config.requester.clone(), RequestBody::Disconnect);
        let frame = self.codec.encode_request(&request)?;

        conn.wake.notify_one();
        let mut guard = conn.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            drop(guard);
            self.active.remove(&id);
            return Ok(());
        };

        let sent = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        }
        .await;
        if let Err(err) = sent {
            debug!(conn = %id, error = %err, "disconnect request not sent, closing");
            guard.take();
            drop(guard);
            conn.closed.store(true, Ordering::Release);
            self.active.remove(&id);
            return Ok(());
        }

        if wait {
            let drain = async {
                let mut sink = [0u8; 256];
                loop {
                    match stream.read(&mut sink).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if timeout(self.config.disconnect_wait, drain).await.is_err() {
                warn!(conn = %id, "remote did not close in time");
            }
            guard.take();
            drop(guard);
            conn.closed.store(true, Ordering::Release);
            self.active.remove(&id);
        } else {
            conn.close_on_eof.store(true, Ordering::Release);
        }
        debug!(conn = %id, wait, "graceful disconnect");
        Ok(())
    }

    /// Marks a peer DOWN, logging instead of failing for a stale handle.
    pub fn mark_down(&self, peer: PeerHandle, reason: &str) {
        if let Err(err) = self.registry.write().mark_down(peer, reason) {
            debug!(peer = %peer, error = %err, "cannot mark peer down");
        }
    }

    /// Deletes a peer: its record, its direct connections and its cached addresses.
    pub fn delete_peer(&self, peer: PeerHandle) -> Result<PeerRecord> {
        let record = self.registry.write().delete(peer)?;
        self.active.retain(|_, conn| {
            if conn.peer() == Some(peer) {
                conn.close();
                false
            } else {
                true
            }
        });
        self.cache.invalidate(record.host());
        info!(host = %record.host(), port = record.port(), "removed peer");
        Ok(record)
    }

    /// Closes every connection and tunnel.
    pub fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().close();
        }
        self.active.clear();
        self.tunnel.shutdown();
    }
}

fn mark_tunnel_peers_down(registry: &Weak<RwLock<PeerRegistry>>, endpoint: SocketAddrV4) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let mut registry = registry.write();
    // streams on a replacement tunnel to the same endpoint are still open
    let peers: Vec<PeerHandle> = registry
        .iter()
        .filter(|(_, record)| {
            matches!(
                record.role().and_then(|role| role.conn.transport()),
                Some(TransportHandle::Tunnel(stream)) if stream.endpoint() == endpoint && !stream.is_open()
            )
        })
        .map(|(peer, _)| peer)
        .collect();
    for peer in peers {
        if let Err(err) = registry.mark_down(peer, "tunnel closed") {
            debug!(peer = %peer, error = %err, "cannot mark peer down");
        }
    }
}

fn open_tunnel_sender(record: &PeerRecord) -> Option<TunnelSender> {
    let role = record.role()?;
    if !role.conn.liveness().is_up() {
        return None;
    }
    match role.conn.transport() {
        Some(TransportHandle::Tunnel(stream)) if stream.is_open() => Some(stream.sender()),
        _ => None,
    }
}
