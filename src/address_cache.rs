//! Hostname to IPv4 address cache.
//!
//! Entries are published as `Arc<[Ipv4Addr]>` and never mutated afterwards, so a
//! list handed out by [`AddressCache::resolve`] stays valid for as long as the
//! caller holds it. Only the map itself is locked.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::{ClusterError, Result};

/// Immutable, shared list of a host's IPv4 addresses in resolver order.
pub type AddressList = Arc<[Ipv4Addr]>;

/// External name resolution.
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Resolves `host` to every address the system knows for it.
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;
}

/// Resolver backed by the system resolver through [`tokio::net::lookup_host`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, 0)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        })
    }
}

/// Memoizing hostname resolver.
pub struct AddressCache {
    resolver: Arc<dyn Resolver>,
    entries: RwLock<HashMap<String, AddressList>>,
}

impl fmt::Debug for AddressCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressCache")
            .field("resolver", &self.resolver)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new(Arc::new(DnsResolver))
    }
}

impl AddressCache {
    /// Creates an empty cache that resolves misses through `resolver`.
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the IPv4 addresses of `host`, resolving them on first use.
    ///
    /// Host names are matched case-insensitively. When two callers miss on the same
    /// host concurrently both resolve, but only the first result is published and
    /// both receive it.
    pub async fn resolve(&self, host: &str) -> Result<AddressList> {
        if host.is_empty() {
            return Err(ClusterError::InvalidRequest("empty host name".into()));
        }
        let key = host.to_ascii_lowercase();
        let cached = self.entries.read().get(&key).cloned();
        if let Some(list) = cached {
            trace!(host = %host, "address cache hit");
            return Ok(list);
        }

        let resolved = self.resolver.lookup(host).await.map_err(|err| {
            debug!(host = %host, error = %err, "name resolution failed");
            ClusterError::AddressNotFound(host.to_string())
        })?;

        let mut addrs: Vec<Ipv4Addr> = Vec::with_capacity(resolved.len());
        for ip in resolved {
            if let IpAddr::V4(v4) = ip {
                if !addrs.contains(&v4) {
                    addrs.push(v4);
                }
            }
        }
        if addrs.is_empty() {
            return Err(ClusterError::AddressNotFound(host.to_string()));
        }

        let mut entries = self.entries.write();
        let list = entries.entry(key).or_insert_with(|| Arc::from(addrs));
        debug!(host = %host, count = list.len(), "cached host addresses");
        Ok(Arc::clone(list))
    }

    /// Drops the entry for `host`. Returns `true` if one was cached.
    pub fn invalidate(&self, host: &str) -> bool {
        self.entries
            .write()
            .remove(&host.to_ascii_lowercase())
            .is_some()
    }

    /// Returns `true` if `host` has a cached entry.
    pub fn contains(&self, host: &str) -> bool {
        self.entries
            .read()
            .contains_key(&host.to_ascii_lowercase())
    }

    /// Number of cached hosts.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::StaticResolver;
    use std::net::Ipv6Addr;

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let resolver = Arc::new(StaticResolver::default().with_host(
            "node01",
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
        ));
        let cache = AddressCache::new(resolver.clone());

        let first = cache.resolve("node01").await.unwrap();
        let second = cache.resolve("NODE01").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn keeps_only_ipv4_without_duplicates() {
        let resolver = Arc::new(StaticResolver::default().with_host(
            "node02",
            vec![
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            ],
        ));
        let cache = AddressCache::new(resolver);

        let list = cache.resolve("node02").await.unwrap();
        assert_eq!(
            &*list,
            &[Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 1, 2)]
        );
    }

    #[tokio::test]
    async fn ipv6_only_host_is_not_found() {
        let resolver = Arc::new(
            StaticResolver::default().with_host("v6only", vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]),
        );
        let cache = AddressCache::new(resolver);

        let err = cache.resolve("v6only").await.unwrap_err();
        assert!(matches!(err, ClusterError::AddressNotFound(host) if host == "v6only"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unknown_host_is_not_found() {
        let cache = AddressCache::new(Arc::new(StaticResolver::default()));
        let err = cache.resolve("missing").await.unwrap_err();
        assert!(matches!(err, ClusterError::AddressNotFound(_)));
    }

    #[tokio::test]
    async fn invalidate_forces_new_lookup() {
        let resolver = Arc::new(StaticResolver::default().with_host(
            "node03",
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))],
        ));
        let cache = AddressCache::new(resolver.clone());

        let first = cache.resolve("node03").await.unwrap();
        assert!(cache.invalidate("Node03"));
        assert!(!cache.contains("node03"));
        let second = cache.resolve("node03").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first, second);
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn empty_host_is_rejected() {
        let cache = AddressCache::new(Arc::new(StaticResolver::default()));
        assert!(matches!(
            cache.resolve("").await,
            Err(ClusterError::InvalidRequest(_))
        ));
    }
}
