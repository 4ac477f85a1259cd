//! Tunables for the registry, connection manager and router.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::DeferredAction;

/// Number of slots the peer table grows by when no tombstoned slot is free.
pub const DEFAULT_REGISTRY_GROW_INCREMENT: usize = 10;

/// Longest accepted peer host name, in bytes.
pub const DEFAULT_MAX_HOSTNAME_LEN: usize = 64;

/// Default timeout for a single TCP connect attempt
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default timeout waiting for a reply frame
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 30_000;

/// Default timeout for the graceful disconnect wait
pub const DEFAULT_DISCONNECT_WAIT_MS: u64 = 10_000;

/// Default wait before a client retries a coordinator it lost
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 5_000;

/// Largest frame body accepted by the codec (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest single string accepted by the codec (1 MiB).
pub const DEFAULT_MAX_STRING_LEN: usize = 1024 * 1024;

/// Largest attribute count accepted by the codec.
pub const DEFAULT_MAX_ATTR_COUNT: usize = 4_096;

/// Default port a coordinator listens on for batch requests.
pub const DEFAULT_COORDINATOR_PORT: u16 = 15001;

/// Configuration for a coordinator's cluster layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address this coordinator is reachable on; connects to it short-circuit to a local handle
    pub local_addr: Ipv4Addr,
    /// Port this coordinator serves batch requests on
    pub local_port: u16,
    /// Identity sent in every request header
    pub requester: String,
    /// Slots added to the peer table per growth step
    pub registry_grow_increment: usize,
    /// Host name length bound
    pub max_hostname_len: usize,
    /// Timeout for one connect attempt
    pub connect_timeout: Duration,
    /// Timeout waiting for a reply
    pub reply_timeout: Duration,
    /// Upper bound on a graceful disconnect that waits for the remote close
    pub disconnect_wait: Duration,
    /// How long a client leaves a lost coordinator alone before reconnecting
    pub reconnect_backoff: Duration,
    /// Codec frame bound
    pub max_frame_len: usize,
    /// Codec string bound
    pub max_string_len: usize,
    /// Codec attribute count bound
    pub max_attr_count: usize,
    /// Actions queued on every freshly created peer record
    pub initial_peer_actions: Vec<DeferredAction>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            local_addr: Ipv4Addr::LOCALHOST,
            local_port: DEFAULT_COORDINATOR_PORT,
            requester: String::from("drover"),
            registry_grow_increment: DEFAULT_REGISTRY_GROW_INCREMENT,
            max_hostname_len: DEFAULT_MAX_HOSTNAME_LEN,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            reply_timeout: Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS),
            disconnect_wait: Duration::from_millis(DEFAULT_DISCONNECT_WAIT_MS),
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_string_len: DEFAULT_MAX_STRING_LEN,
            max_attr_count: DEFAULT_MAX_ATTR_COUNT,
            initial_peer_actions: vec![
                DeferredAction::SendAttributes,
                DeferredAction::SendConfig,
                DeferredAction::SendScript,
                DeferredAction::SendResourceDefs,
            ],
        }
    }
}

impl ClusterConfig {
    /// Socket address of this coordinator.
    pub fn local_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.local_addr, self.local_port)
    }

    /// Returns `true` if `(addr, port)` names this coordinator.
    pub fn is_local(&self, addr: Ipv4Addr, port: u16) -> bool {
        addr == self.local_addr && port == self.local_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.registry_grow_increment, DEFAULT_REGISTRY_GROW_INCREMENT);
        assert_eq!(config.max_hostname_len, 64);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(config.local_port, DEFAULT_COORDINATOR_PORT);
        assert_eq!(config.initial_peer_actions.len(), 4);
    }

    #[test]
    fn test_custom_config() {
        let config = ClusterConfig {
            local_addr: Ipv4Addr::new(10, 1, 2, 3),
            registry_grow_increment: 2,
            initial_peer_actions: Vec::new(),
            ..Default::default()
        };
        assert!(config.is_local(Ipv4Addr::new(10, 1, 2, 3), DEFAULT_COORDINATOR_PORT));
        assert!(!config.is_local(Ipv4Addr::new(10, 1, 2, 3), 15002));
        assert_eq!(config.registry_grow_increment, 2);
        assert!(config.initial_peer_actions.is_empty());
    }
}
