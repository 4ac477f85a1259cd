use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use drover::test_helpers::StaticResolver;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Resolver mapping every host to loopback.
#[allow(dead_code)]
pub fn loopback_resolver(hosts: &[&str]) -> Arc<StaticResolver> {
    Arc::new(hosts.iter().fold(StaticResolver::default(), |resolver, host| {
        resolver.with_host(host, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }))
}

#[allow(dead_code)]
pub async fn wait_for_condition<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}
