#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod address_cache;
mod builder;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
mod coordinator;
pub mod error;
pub mod membership;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod tunnel;
#[cfg(any(test, feature = "test-helpers", debug_assertions))]
pub mod test_helpers;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use address_cache::{AddressCache, AddressList, DnsResolver, Resolver};
pub use builder::CoordinatorBuilder;
pub use client::{ClusterClient, CoordinatorClient};
pub use codec::{Attribute, BatchOp, FrameCodec, Opcode, Reply, ReplyBody, Request, RequestBody};
pub use config::ClusterConfig;
pub use connection::{Connected, ConnectionId, ConnectionManager, DisconnectMode, TransportKind};
pub use coordinator::Coordinator;
pub use error::{ClusterError, ConnectCode, Result};
pub use membership::{BroadcastReport, ClusterMembership, ResourceUpdate};
pub use persistence::{FileStore, MemoryStore, PeerIdentity, PeerStore};
pub use registry::{Liveness, PeerHandle, PeerRegistry, PeerRole, SharedRegistry, WorkScheduler};
pub use router::{CoordinatorLink, FailoverRouter, InstanceId, RoutePolicy};
pub use tunnel::{StreamId, TunnelTransport};

/// Get current timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
