//! Multiplexed tunnel transport.
//!
//! One persistent TCP connection is kept per peer endpoint and carries any number
//! of logical streams. Each tunnel frame is
//!
//! ```text
//! u32 length | u64 stream id | payload
//! ```
//!
//! where `length` covers the stream id and the payload. Frames arriving on any
//! tunnel are pushed to a single inbound channel tagged with their stream id; the
//! registry's stream index maps them back to a peer. When a tunnel's reader stops
//! on EOF or a read error, the transport's close handler is told the endpoint.

use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::ClusterConfig;
use crate::{ClusterError, Result};

const TUNNEL_HEADER_LEN: usize = 12;

/// Identifier of a logical stream, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

impl StreamId {
    /// Raw id as carried on the wire.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        StreamId(id)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Called with the endpoint of a tunnel whose reader stopped.
pub type CloseHandler = Arc<dyn Fn(SocketAddrV4) + Send + Sync>;

/// A frame received on a tunnel.
#[derive(Debug, Clone)]
pub struct TunnelFrame {
    /// Stream the frame was sent on.
    pub stream: StreamId,
    /// Endpoint it arrived from.
    pub endpoint: SocketAddrV4,
    /// Frame payload.
    pub payload: Bytes,
}

#[derive(Debug)]
struct TunnelLink {
    endpoint: SocketAddrV4,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    streams: DashSet<StreamId>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl TunnelLink {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send(&self, stream: StreamId, payload: &[u8], max_frame_len: usize) -> Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed").into());
        }
        if !self.streams.contains(&stream) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel stream closed").into());
        }
        let len = 8 + payload.len();
        if len > max_frame_len {
            return Err(ClusterError::Protocol(format!(
                "tunnel frame of {len} bytes exceeds limit of {max_frame_len}"
            )));
        }

        let mut header = [0u8; TUNNEL_HEADER_LEN];
        header[..4].copy_from_slice(&(len as u32).to_be_bytes());
        header[4..].copy_from_slice(&stream.0.to_be_bytes());

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&header).await?;
            writer.write_all(payload).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = result {
            self.closed.store(true, Ordering::Release);
            debug!(endpoint = %self.endpoint, error = %err, "tunnel write failed");
            return Err(err.into());
        }
        Ok(())
    }
}

impl Drop for TunnelLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Tunnel transport shared by every peer.
pub struct TunnelTransport {
    links: DashMap<SocketAddrV4, Arc<TunnelLink>>,
    next_stream: AtomicU64,
    inbound_tx: mpsc::UnboundedSender<TunnelFrame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<TunnelFrame>>>,
    on_close: Mutex<Option<CloseHandler>>,
    connect_timeout: Duration,
    max_frame_len: usize,
}

impl fmt::Debug for TunnelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelTransport")
            .field("links", &self.links.len())
            .field("next_stream", &self.next_stream)
            .finish()
    }
}

impl TunnelTransport {
    /// Creates a transport with no open tunnels.
    pub fn new(config: &ClusterConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            links: DashMap::new(),
            next_stream: AtomicU64::new(1),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            on_close: Mutex::new(None),
            connect_timeout: config.connect_timeout,
            max_frame_len: config.max_frame_len,
        }
    }

    /// Installs the handler told about tunnels whose reader stopped. Tunnels opened
    /// before the call keep the previous handler.
    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self.on_close.lock() = Some(handler);
    }

    /// Opens a new stream to `endpoint`, reusing its tunnel when one is open.
    pub async fn open(&self, endpoint: SocketAddrV4) -> Result<TunnelStream> {
        let link = self.link(endpoint).await?;
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        link.streams.insert(id);
        trace!(endpoint = %endpoint, stream = %id, "opened tunnel stream");
        Ok(TunnelStream {
            sender: TunnelSender {
                id,
                link,
                max_frame_len: self.max_frame_len,
            },
        })
    }

    async fn link(&self, endpoint: SocketAddrV4) -> Result<Arc<TunnelLink>> {
        if let Some(link) = self.live_link(endpoint) {
            return Ok(link);
        }

        let stream = timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tunnel connect timed out"))??;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            read_half,
            endpoint,
            Arc::clone(&closed),
            self.inbound_tx.clone(),
            self.on_close.lock().clone(),
            self.max_frame_len,
        ));
        let link = Arc::new(TunnelLink {
            endpoint,
            writer: tokio::sync::Mutex::new(write_half),
            streams: DashSet::new(),
            closed,
            reader,
        });

        // a concurrent open may have won the race
        let entry = self
            .links
            .entry(endpoint)
            .and_modify(|existing| {
                if existing.is_closed() {
                    *existing = Arc::clone(&link);
                }
            })
            .or_insert_with(|| Arc::clone(&link));
        let winner = Arc::clone(entry.value());
        drop(entry);
        debug!(endpoint = %endpoint, "tunnel connected");
        Ok(winner)
    }

    fn live_link(&self, endpoint: SocketAddrV4) -> Option<Arc<TunnelLink>> {
        let link = self.links.get(&endpoint).map(|link| Arc::clone(link.value()))?;
        if link.is_closed() {
            self.links
                .remove_if(&endpoint, |_, current| Arc::ptr_eq(current, &link));
            None
        } else {
            Some(link)
        }
    }

    /// Takes the receiver of inbound frames. Only the first call gets it.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<TunnelFrame>> {
        self.inbound_rx.lock().take()
    }

    /// Starts an aggregate channel for fanning one payload out to many streams.
    pub fn multicast(&self) -> MulticastGroup {
        MulticastGroup {
            members: Vec::new(),
        }
    }

    /// Number of tunnels currently tracked.
    pub fn tunnel_count(&self) -> usize {
        self.links.len()
    }

    /// Drops every tunnel. Streams still held fail on their next send.
    pub fn shutdown(&self) {
        for entry in self.links.iter() {
            entry.value().closed.store(true, Ordering::Release);
        }
        self.links.clear();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    endpoint: SocketAddrV4,
    closed: Arc<AtomicBool>,
    inbound: mpsc::UnboundedSender<TunnelFrame>,
    on_close: Option<CloseHandler>,
    max_frame_len: usize,
) {
    loop {
        match read_tunnel_frame(&mut reader, max_frame_len).await {
            Ok((stream, payload)) => {
                let frame = TunnelFrame {
                    stream,
                    endpoint,
                    payload,
                };
                if inbound.send(frame).is_err() {
                    trace!(endpoint = %endpoint, "inbound receiver gone, dropping frame");
                }
            }
            Err(err) => {
                debug!(endpoint = %endpoint, error = %err, "tunnel reader stopped");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    if let Some(on_close) = on_close {
        on_close(endpoint);
    }
}

/// Reads one tunnel frame from `reader`.
pub async fn read_tunnel_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<(StreamId, Bytes)>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; TUNNEL_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if !(8..=max_frame_len).contains(&len) {
        return Err(ClusterError::Protocol(format!("invalid tunnel frame length {len}")));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&header[4..]);

    let mut payload = BytesMut::zeroed(len - 8);
    reader.read_exact(&mut payload).await?;
    Ok((StreamId(u64::from_be_bytes(id)), payload.freeze()))
}

/// Encodes one tunnel frame.
pub fn encode_tunnel_frame(stream: StreamId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TUNNEL_HEADER_LEN + payload.len());
    buf.put_u32((8 + payload.len()) as u32);
    buf.put_u64(stream.0);
    buf.put_slice(payload);
    buf.freeze()
}

/// Cloneable sending side of a tunnel stream.
#[derive(Debug, Clone)]
pub struct TunnelSender {
    id: StreamId,
    link: Arc<TunnelLink>,
    max_frame_len: usize,
}

impl TunnelSender {
    /// Stream this sender writes to.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Remote endpoint of the tunnel.
    pub fn endpoint(&self) -> SocketAddrV4 {
        self.link.endpoint
    }

    /// Returns `true` while the stream and its tunnel are open.
    pub fn is_open(&self) -> bool {
        !self.link.is_closed() && self.link.streams.contains(&self.id)
    }

    /// Sends one payload on the stream.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.link.send(self.id, payload, self.max_frame_len).await
    }
}

/// An open tunnel stream. Dropping it closes the stream.
#[derive(Debug)]
pub struct TunnelStream {
    sender: TunnelSender,
}

impl TunnelStream {
    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.sender.id
    }

    /// Remote endpoint of the tunnel.
    pub fn endpoint(&self) -> SocketAddrV4 {
        self.sender.endpoint()
    }

    /// Returns `true` while the stream and its tunnel are open.
    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// A sender that does not own the stream.
    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    /// Sends one payload on the stream.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.sender.send(payload).await
    }

    /// Closes the stream.
    pub fn close(self) {}
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.sender.link.streams.remove(&self.sender.id);
        trace!(stream = %self.sender.id, "closed tunnel stream");
    }
}

/// Aggregate channel used for one fan-out. Closed by [`MulticastGroup::close`].
#[derive(Debug)]
pub struct MulticastGroup {
    members: Vec<TunnelSender>,
}

impl MulticastGroup {
    /// Adds a stream to the group.
    pub fn add(&mut self, sender: TunnelSender) {
        self.members.push(sender);
    }

    /// Number of streams in the group.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the group has no member.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Sends `payload` to every member concurrently, returning one result per member.
    pub async fn send(&self, payload: &[u8]) -> Vec<(StreamId, Result<()>)> {
        let sends = self.members.iter().map(|member| async move {
            let result = member.send(payload).await;
            if let Err(err) = &result {
                warn!(stream = %member.id, endpoint = %member.endpoint(), error = %err, "multicast send failed");
            }
            (member.id, result)
        });
        join_all(sends).await
    }

    /// Closes the group, releasing its member senders.
    pub fn close(self) -> usize {
        let count = self.members.len();
        trace!(members = count, "closed multicast group");
        count
    }
}
