//! Client library surface.
//!
//! A [`ClusterClient`] owns one [`CoordinatorClient`] per coordinator. Each of them
//! serializes round trips on its own lock, so callers sharing a coordinator wait for
//! each other while requests to different coordinators run in parallel.
//!
//! A coordinator whose connection fails is left alone for the configured reconnect
//! backoff; the next request routed past it after that reconnects.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::codec::{Attribute, BatchOp, FrameCodec, Reply, ReplyBody, Request, RequestBody};
use crate::config::ClusterConfig;
use crate::router::{policy_for, CoordinatorLink, FailoverRouter, InstanceId};
use crate::{ClusterError, Result};

/// Connection from a client to one coordinator.
pub struct CoordinatorClient {
    instance: InstanceId,
    addr: SocketAddr,
    codec: FrameCodec,
    connect_timeout: Duration,
    reply_timeout: Duration,
    reconnect_backoff: Duration,
    up: AtomicBool,
    retry_at: parking_lot::Mutex<Option<Instant>>,
    stream: Mutex<Option<TcpStream>>,
}

impl fmt::Debug for CoordinatorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorClient")
            .field("instance", &self.instance)
            .field("addr", &self.addr)
            .field("up", &self.is_up())
            .finish()
    }
}

impl CoordinatorClient {
    /// Creates a client for `addr` and tries to connect. A coordinator that cannot
    /// be reached starts out down.
    pub async fn connect(instance: InstanceId, addr: SocketAddr, config: &ClusterConfig) -> Self {
        let client = Self {
            instance,
            addr,
            codec: FrameCodec::new(config),
            connect_timeout: config.connect_timeout,
            reply_timeout: config.reply_timeout,
            reconnect_backoff: config.reconnect_backoff,
            up: AtomicBool::new(false),
            retry_at: parking_lot::Mutex::new(None),
            stream: Mutex::new(None),
        };
        if let Err(err) = client.reconnect().await {
            warn!(coordinator = %instance, addr = %addr, error = %err, "coordinator unreachable");
        }
        client
    }

    /// Coordinator address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replaces the connection with a fresh one.
    pub async fn reconnect(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        guard.take();
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        match stream {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                *guard = Some(stream);
                self.up.store(true, Ordering::Release);
                *self.retry_at.lock() = None;
                debug!(coordinator = %self.instance, addr = %self.addr, "connected to coordinator");
                Ok(())
            }
            Ok(Err(err)) | Err(err) => {
                self.went_down();
                Err(err.into())
            }
        }
    }

    fn went_down(&self) {
        self.up.store(false, Ordering::Release);
        *self.retry_at.lock() = Some(Instant::now() + self.reconnect_backoff);
    }

    async fn reconnect_when_due(&self) -> bool {
        if self.is_up() {
            return true;
        }
        let retry_at = *self.retry_at.lock();
        if retry_at.map_or(false, |at| Instant::now() < at) {
            return false;
        }
        match self.reconnect().await {
            Ok(()) => true,
            Err(err) => {
                debug!(coordinator = %self.instance, addr = %self.addr, error = %err, "reconnect failed");
                false
            }
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Reply> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            self.went_down();
            return Err(io::Error::new(io::ErrorKind::NotConnected, "coordinator not connected").into());
        };

        let result = async {
            self.codec.write_request(stream, request).await?;
            let reply = timeout(self.reply_timeout, self.codec.read_reply(stream)).await??;
            Ok::<_, ClusterError>(reply)
        }
        .await;

        if let Some(err) = result.as_ref().err().filter(|err| err.is_link_failure()) {
            warn!(coordinator = %self.instance, error = %err, "coordinator connection lost");
            guard.take();
            self.went_down();
        }
        result
    }
}

impl CoordinatorLink for CoordinatorClient {
    fn instance(&self) -> InstanceId {
        self.instance
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn ready(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.reconnect_when_due())
    }

    fn call<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Reply>> {
        Box::pin(self.round_trip(request))
    }
}

/// Batch client routing requests across a multi-coordinator cluster.
#[derive(Debug)]
pub struct ClusterClient {
    router: FailoverRouter,
    requester: String,
    held: Option<InstanceId>,
}

impl ClusterClient {
    /// Connects to every coordinator in `addrs`; their order is the failover order.
    pub async fn connect(addrs: &[SocketAddr], config: &ClusterConfig) -> Result<Self> {
        if addrs.is_empty() {
            return Err(ClusterError::InvalidRequest("no coordinator addresses".into()));
        }
        let mut links: Vec<Arc<dyn CoordinatorLink>> = Vec::with_capacity(addrs.len());
        for (index, addr) in addrs.iter().enumerate() {
            let client = CoordinatorClient::connect(InstanceId(index as u32), *addr, config).await;
            links.push(Arc::new(client));
        }
        Ok(Self::from_links(links, config.requester.clone()))
    }

    /// Builds a client over existing links.
    pub fn from_links(links: Vec<Arc<dyn CoordinatorLink>>, requester: impl Into<String>) -> Self {
        Self {
            router: FailoverRouter::new(links),
            requester: requester.into(),
            held: None,
        }
    }

    /// Marks `instance` as the coordinator the caller already holds; requests that
    /// reach it are answered there without further failover.
    pub fn hold(mut self, instance: InstanceId) -> Self {
        self.held = Some(instance);
        self
    }

    /// The underlying router.
    pub fn router(&self) -> &FailoverRouter {
        &self.router
    }

    fn request(&self, body: RequestBody, extension: Option<&str>) -> Request {
        Request::new(self.requester.clone(), body).with_extension(extension.map(str::to_string))
    }

    async fn send(&self, target: &str, request: Request) -> Result<Vec<Reply>> {
        let policy = policy_for(request.opcode());
        self.router.dispatch(policy, target, &request, self.held).await
    }

    /// Sends `signal` to a job.
    pub async fn signal_job(&self, job_id: &str, signal: &str, extension: Option<&str>) -> Result<()> {
        if job_id.is_empty() {
            return Err(ClusterError::InvalidRequest("empty job id".into()));
        }
        let request = self.request(
            RequestBody::SignalJob {
                job_id: job_id.to_string(),
                signal: signal.to_string(),
            },
            extension,
        );
        self.send(job_id, request).await.map(|_| ())
    }

    /// Modifies a reservation. Every attribute is sent with the set operator.
    /// Returns the coordinator's reply text, if any.
    pub async fn modify_reservation(
        &self,
        resv_id: &str,
        attrs: Vec<Attribute>,
        extension: Option<&str>,
    ) -> Result<Option<String>> {
        if resv_id.is_empty() {
            return Err(ClusterError::InvalidRequest("empty reservation id".into()));
        }
        let attrs = attrs
            .into_iter()
            .map(|attr| Attribute {
                op: BatchOp::Set,
                ..attr
            })
            .collect();
        let request = self.request(
            RequestBody::ModifyReservation {
                resv_id: resv_id.to_string(),
                attrs,
            },
            extension,
        );
        let replies = self.send(resv_id, request).await?;
        Ok(replies.into_iter().find_map(|reply| match reply.body {
            ReplyBody::Text(text) => Some(text),
            _ => None,
        }))
    }

    /// Selects jobs matching `attrs` on every reachable coordinator.
    pub async fn select_jobs(&self, attrs: Vec<Attribute>, extension: Option<&str>) -> Result<Vec<String>> {
        let request = self.request(RequestBody::SelectJobs { attrs }, extension);
        let replies = self.send("", request).await?;
        let mut ids = Vec::new();
        for reply in replies {
            match reply.body {
                ReplyBody::Select(mut found) => ids.append(&mut found),
                ReplyBody::Null => {}
                ReplyBody::Text(text) => {
                    return Err(ClusterError::Protocol(format!(
                        "unexpected text reply to select: {text}"
                    )))
                }
            }
        }
        Ok(ids)
    }
}
