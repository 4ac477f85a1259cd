//! Test doubles shared by unit and integration tests.
//!
//! Everything here binds to loopback on an ephemeral port and records what it
//! sees, so tests can assert on the exact requests the crate put on the wire.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::address_cache::Resolver;
use crate::codec::{FrameCodec, Opcode, Reply, Request};
use crate::connection::Dialer;
use crate::registry::{Liveness, PeerHandle, WorkScheduler};
use crate::router::{CoordinatorLink, InstanceId};
use crate::tunnel::{read_tunnel_frame, StreamId};
use crate::{ClusterError, Result};

/// Grace period after stopping a server so clients observe the closed sockets.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Resolver answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
    calls: Mutex<usize>,
}

impl StaticResolver {
    /// Adds `host` resolving to `addrs`.
    pub fn with_host(mut self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.hosts.get_mut().insert(host.to_ascii_lowercase(), addrs);
        self
    }

    /// Adds `host` to a resolver that is already in use.
    pub fn add_host(&self, host: &str, addrs: Vec<IpAddr>) {
        self.hosts.lock().insert(host.to_ascii_lowercase(), addrs);
    }

    /// Number of lookups performed.
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl Resolver for StaticResolver {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        *self.calls.lock() += 1;
        let found = self.hosts.lock().get(&host.to_ascii_lowercase()).cloned();
        Box::pin(async move {
            found.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}")))
        })
    }
}

/// Dialer refusing its first attempts, then connecting for real.
#[derive(Debug)]
pub struct RefusingDialer {
    refusals: usize,
    attempts: AtomicUsize,
}

impl RefusingDialer {
    /// Refuses the first `refusals` attempts with `ConnectionRefused`.
    pub fn new(refusals: usize) -> Self {
        Self {
            refusals,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of dial attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Dialer for RefusingDialer {
    fn dial(&self, target: SocketAddrV4) -> BoxFuture<'_, io::Result<TcpStream>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.refusals {
            trace!(addr = %target, attempt, "refusing dial");
            Box::pin(async { Err(io::Error::from(io::ErrorKind::ConnectionRefused)) })
        } else {
            Box::pin(TcpStream::connect(target))
        }
    }
}

/// A liveness transition seen by [`RecordingScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Peer that changed.
    pub peer: PeerHandle,
    /// Host of the peer.
    pub host: String,
    /// Port of the peer.
    pub port: u16,
    /// New liveness.
    pub liveness: Liveness,
}

/// Scheduler recording every notification.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    transitions: Mutex<Vec<Transition>>,
    cancelled: Mutex<Vec<PeerHandle>>,
}

impl RecordingScheduler {
    /// Liveness transitions in order.
    pub fn transitions(&self) -> Vec<Transition> {
        self.transitions.lock().clone()
    }

    /// Peers whose tasks were cancelled, in order.
    pub fn cancelled(&self) -> Vec<PeerHandle> {
        self.cancelled.lock().clone()
    }
}

impl WorkScheduler for RecordingScheduler {
    fn liveness_changed(&self, peer: PeerHandle, host: &str, port: u16, liveness: Liveness) {
        self.transitions.lock().push(Transition {
            peer,
            host: host.to_string(),
            port,
            liveness,
        });
    }

    fn cancel_peer_tasks(&self, peer: PeerHandle) {
        self.cancelled.lock().push(peer);
    }
}

type Responder = Arc<dyn Fn(&Request) -> Option<Reply> + Send + Sync>;

/// Coordinator stand-in speaking the request/reply framing.
///
/// Every request is recorded. The responder's reply is written back; `None` makes
/// the server hang up instead. A disconnect request closes the connection without
/// a reply.
#[derive(Debug)]
pub struct MockCoordinator {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Request>>>,
    accept: JoinHandle<()>,
}

impl MockCoordinator {
    /// Binds to an ephemeral loopback port and starts serving.
    pub async fn start<F>(responder: F) -> io::Result<Self>
    where
        F: Fn(&Request) -> Option<Reply> + Send + Sync + 'static,
    {
        Self::start_at(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), responder).await
    }

    /// Binds to `addr` and starts serving. Used to bring a stopped coordinator
    /// back on its old port.
    pub async fn start_at<F>(addr: SocketAddr, responder: F) -> io::Result<Self>
    where
        F: Fn(&Request) -> Option<Reply> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let responder: Responder = Arc::new(responder);

        let accept = tokio::spawn({
            let requests = Arc::clone(&requests);
            async move {
                let mut connections = JoinSet::new();
                loop {
                    let Ok((socket, remote)) = listener.accept().await else {
                        break;
                    };
                    trace!(remote = %remote, "mock coordinator accepted");
                    connections.spawn(serve_requests(
                        socket,
                        Arc::clone(&requests),
                        Arc::clone(&responder),
                    ));
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            accept,
        })
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// Stops accepting and drops every open connection.
    pub async fn shutdown(self) {
        self.accept.abort();
        let _ = self.accept.await;
        sleep(SHUTDOWN_GRACE).await;
    }
}

async fn serve_requests(mut socket: TcpStream, requests: Arc<Mutex<Vec<Request>>>, responder: Responder) {
    let codec = FrameCodec::default();
    loop {
        let request = match codec.read_request(&mut socket).await {
            Ok(request) => request,
            Err(err) => {
                trace!(error = %err, "mock coordinator connection ended");
                return;
            }
        };
        let reply = responder(&request);
        let disconnect = request.opcode() == Opcode::Disconnect;
        requests.lock().push(request);

        match reply {
            Some(reply) if !disconnect => {
                if let Err(err) = codec.write_reply(&mut socket, &reply).await {
                    debug!(error = %err, "mock coordinator reply failed");
                    return;
                }
            }
            _ => return,
        }
    }
}

/// Tunnel endpoint recording every request carried over it.
#[derive(Debug)]
pub struct TunnelSink {
    addr: SocketAddr,
    frames: Arc<Mutex<Vec<(StreamId, Request)>>>,
    notify: Arc<Notify>,
    accept: JoinHandle<()>,
}

impl TunnelSink {
    /// Binds to an ephemeral loopback port and starts recording.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let frames = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());

        let accept = tokio::spawn({
            let frames = Arc::clone(&frames);
            let notify = Arc::clone(&notify);
            async move {
                let mut connections = JoinSet::new();
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    connections.spawn(record_frames(socket, Arc::clone(&frames), Arc::clone(&notify)));
                }
            }
        });

        Ok(Self {
            addr,
            frames,
            notify,
            accept,
        })
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Frames received so far.
    pub fn frames(&self) -> Vec<(StreamId, Request)> {
        self.frames.lock().clone()
    }

    /// Waits until at least `count` frames arrived or `timeout` passes, then
    /// returns what was received.
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<(StreamId, Request)> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let frames = self.frames();
            if frames.len() >= count || Instant::now() >= deadline {
                return frames;
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// Stops accepting and drops every open connection.
    pub async fn shutdown(self) {
        self.accept.abort();
        let _ = self.accept.await;
        sleep(SHUTDOWN_GRACE).await;
    }
}

async fn record_frames(mut socket: TcpStream, frames: Arc<Mutex<Vec<(StreamId, Request)>>>, notify: Arc<Notify>) {
    let codec = FrameCodec::default();
    loop {
        let (stream, payload) = match read_tunnel_frame(&mut socket, 1 << 20).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        match codec.decode_request(&payload) {
            Ok(request) => {
                frames.lock().push((stream, request));
                notify.notify_waiters();
            }
            Err(err) => debug!(stream = %stream, error = %err, "tunnel sink dropped frame"),
        }
    }
}

type Script = Box<dyn Fn(&Request) -> Result<Reply> + Send + Sync>;

/// In-process [`CoordinatorLink`] answering from a closure.
pub struct ScriptedLink {
    instance: InstanceId,
    up: bool,
    log: Option<Arc<Mutex<Vec<InstanceId>>>>,
    script: Script,
}

impl std::fmt::Debug for ScriptedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedLink")
            .field("instance", &self.instance)
            .field("up", &self.up)
            .finish()
    }
}

impl ScriptedLink {
    /// A link for instance `id`.
    pub fn new<F>(id: u32, up: bool, script: F) -> Arc<dyn CoordinatorLink>
    where
        F: Fn(&Request) -> Result<Reply> + Send + Sync + 'static,
    {
        Arc::new(Self {
            instance: InstanceId(id),
            up,
            log: None,
            script: Box::new(script),
        })
    }

    /// A link that appends its instance to `log` on every call.
    pub fn logged<F>(id: u32, up: bool, log: &Arc<Mutex<Vec<InstanceId>>>, script: F) -> Arc<dyn CoordinatorLink>
    where
        F: Fn(&Request) -> Result<Reply> + Send + Sync + 'static,
    {
        Arc::new(Self {
            instance: InstanceId(id),
            up,
            log: Some(Arc::clone(log)),
            script: Box::new(script),
        })
    }
}

impl CoordinatorLink for ScriptedLink {
    fn instance(&self) -> InstanceId {
        self.instance
    }

    fn is_up(&self) -> bool {
        self.up
    }

    fn call<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Reply>> {
        if let Some(log) = &self.log {
            log.lock().push(self.instance);
        }
        let outcome = if self.up {
            (self.script)(request)
        } else {
            Err(ClusterError::Io(io::Error::new(io::ErrorKind::NotConnected, "link down")))
        };
        Box::pin(async move { outcome })
    }
}
