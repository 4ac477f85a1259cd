//! Client side failover across coordinators.
//!
//! [`FailoverRouter::route`] walks the coordinator list circularly from a start
//! index, at most once around:
//!
//! - coordinators that are not ready (see [`CoordinatorLink::ready`]) are skipped;
//! - the coordinator the caller already holds is sent to once and its answer is final;
//! - a success ends the walk;
//! - [`ClusterError::TargetNotRecognized`] moves on to the next coordinator;
//! - any other error ends the walk and is returned.
//!
//! An exhausted walk returns the last error seen, or
//! [`ClusterError::NoReachablePeer`] if no coordinator was reachable.
//! [`FailoverRouter::gather`] instead sends to every ready coordinator.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::{debug, trace, warn};

use crate::codec::{Opcode, Reply, Request};
use crate::{ClusterError, Result};

/// Identity of a coordinator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coordinator#{}", self.0)
    }
}

/// A connection to one coordinator.
pub trait CoordinatorLink: Send + Sync + fmt::Debug {
    /// Instance the link talks to.
    fn instance(&self) -> InstanceId;

    /// Returns `true` if the link is usable.
    fn is_up(&self) -> bool;

    /// Returns `true` if the link can take a call now. A link that is down may
    /// reconnect here; by default this reports [`is_up`](Self::is_up).
    fn ready(&self) -> BoxFuture<'_, bool> {
        let up = self.is_up();
        Box::pin(async move { up })
    }

    /// Sends `request` and waits for the reply. Implementations hold the link's
    /// exclusive lock for the whole round trip.
    fn call<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Reply>>;
}

/// Whether a request stops at the first success or goes to every coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePolicy {
    /// Stop at the first coordinator that answers successfully.
    FirstSuccess,
    /// Send to every UP coordinator and merge the answers.
    Gather,
}

/// Routing policy of each request type.
pub fn policy_for(opcode: Opcode) -> RoutePolicy {
    match opcode {
        Opcode::SelectJobs => RoutePolicy::Gather,
        Opcode::SignalJob
        | Opcode::ModifyReservation
        | Opcode::Disconnect
        | Opcode::Handshake
        | Opcode::ResourceUpdate => RoutePolicy::FirstSuccess,
    }
}

/// Visit order over `len` coordinators: each index once, circularly from the start.
#[derive(Debug, Clone)]
pub struct FailoverCursor {
    start: usize,
    visited: usize,
    len: usize,
}

impl FailoverCursor {
    /// Starts at `hint` when it is a valid index, otherwise at 0.
    pub fn new(hint: Option<usize>, len: usize) -> Self {
        Self {
            start: hint.filter(|hint| *hint < len).unwrap_or(0),
            visited: 0,
            len,
        }
    }

    /// First index visited.
    pub fn start(&self) -> usize {
        self.start
    }
}

impl Iterator for FailoverCursor {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.visited >= self.len {
            return None;
        }
        let index = (self.start + self.visited) % self.len;
        self.visited += 1;
        Some(index)
    }
}

/// Remembers which coordinator last owned a target.
#[derive(Debug, Default)]
pub struct LocationCache {
    entries: RwLock<FxHashMap<String, usize>>,
}

impl LocationCache {
    /// Index recorded for `target`.
    pub fn get(&self, target: &str) -> Option<usize> {
        self.entries.read().get(target).copied()
    }

    /// Records that `index` answered for `target`.
    pub fn record(&self, target: &str, index: usize) {
        self.entries.write().insert(target.to_string(), index);
    }

    /// Forgets `target` if it is recorded at `index`.
    pub fn forget(&self, target: &str, index: usize) {
        let mut entries = self.entries.write();
        if entries.get(target) == Some(&index) {
            entries.remove(target);
        }
    }
}

/// Stable hash of `target` onto `len` coordinators.
pub fn stable_hint(target: &str, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let mut hasher = FxHasher::default();
    target.hash(&mut hasher);
    Some((hasher.finish() % len as u64) as usize)
}

/// Routes requests across an ordered set of coordinators.
#[derive(Debug)]
pub struct FailoverRouter {
    links: Vec<Arc<dyn CoordinatorLink>>,
    locations: LocationCache,
}

impl FailoverRouter {
    /// Creates a router over `links`; their order is the failover order.
    pub fn new(links: Vec<Arc<dyn CoordinatorLink>>) -> Self {
        Self {
            links,
            locations: LocationCache::default(),
        }
    }

    /// Coordinators in failover order.
    pub fn links(&self) -> &[Arc<dyn CoordinatorLink>] {
        &self.links
    }

    /// Number of coordinators.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns `true` if there is no coordinator.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Location cache fed by successful routes.
    pub fn locations(&self) -> &LocationCache {
        &self.locations
    }

    /// Start index for `target`: the coordinator that last answered for it, else a
    /// stable hash of the id.
    pub fn hint_for(&self, target: &str) -> Option<usize> {
        self.locations
            .get(target)
            .filter(|index| *index < self.links.len())
            .or_else(|| stable_hint(target, self.links.len()))
    }

    /// Routes a single-target request.
    pub async fn route(
        &self,
        target: &str,
        request: &Request,
        hint: Option<usize>,
        held: Option<InstanceId>,
    ) -> Result<Reply> {
        let mut last_error = None;

        for index in FailoverCursor::new(hint, self.links.len()) {
            let link = &self.links[index];
            if !link.ready().await {
                trace!(coordinator = %link.instance(), "skipping coordinator that is not up");
                continue;
            }

            let outcome = link
                .call(request)
                .await
                .and_then(|reply| reply.into_result(target));

            if held == Some(link.instance()) {
                if outcome.is_ok() {
                    self.locations.record(target, index);
                }
                return outcome;
            }

            match outcome {
                Ok(reply) => {
                    self.locations.record(target, index);
                    return Ok(reply);
                }
                Err(err @ ClusterError::TargetNotRecognized(_)) => {
                    debug!(coordinator = %link.instance(), target = %target, "target not here, trying next coordinator");
                    self.locations.forget(target, index);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or(ClusterError::NoReachablePeer))
    }

    /// Sends `request` to every ready coordinator concurrently and returns the
    /// replies in coordinator order.
    ///
    /// Coordinators that do not recognize `target` contribute nothing, and so do
    /// coordinators lost during the call. Any other error is returned, as is the
    /// link failure when no coordinator answered at all.
    pub async fn gather(&self, target: &str, request: &Request) -> Result<Vec<Reply>> {
        let ready = join_all(self.links.iter().map(|link| link.ready())).await;
        let up: Vec<&Arc<dyn CoordinatorLink>> = self
            .links
            .iter()
            .zip(ready)
            .filter_map(|(link, ready)| ready.then_some(link))
            .collect();
        if up.is_empty() {
            return Err(ClusterError::NoReachablePeer);
        }

        let outcomes = join_all(up.iter().map(|link| async move {
            let outcome = link
                .call(request)
                .await
                .and_then(|reply| reply.into_result(target));
            (link.instance(), outcome)
        }))
        .await;

        let mut replies = Vec::with_capacity(outcomes.len());
        let mut answered = 0;
        let mut lost = None;
        for (instance, outcome) in outcomes {
            match outcome {
                Ok(reply) => {
                    answered += 1;
                    replies.push(reply);
                }
                Err(ClusterError::TargetNotRecognized(_)) => {
                    answered += 1;
                    trace!(coordinator = %instance, "no match on coordinator");
                }
                Err(err) if err.is_link_failure() => {
                    warn!(coordinator = %instance, error = %err, "coordinator lost during gather");
                    lost = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        match lost {
            Some(err) if answered == 0 => Err(err),
            _ => Ok(replies),
        }
    }

    /// Applies `policy` to `request`.
    pub async fn dispatch(
        &self,
        policy: RoutePolicy,
        target: &str,
        request: &Request,
        held: Option<InstanceId>,
    ) -> Result<Vec<Reply>> {
        match policy {
            RoutePolicy::FirstSuccess => {
                let hint = self.hint_for(target);
                self.route(target, request, hint, held)
                    .await
                    .map(|reply| vec![reply])
            }
            RoutePolicy::Gather => self.gather(target, request).await,
        }
    }
}
