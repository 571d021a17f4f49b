//! Address-to-owner lookups for `GET /whois`, memoized per address.
//!
//! Resolution itself is delegated to a [`WhoisResolver`]; the cache only
//! guarantees each address is resolved once while it is running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait WhoisCache: Send + Sync {
    /// Resolved name for `address`, resolving and caching on first use.
    async fn lookup(&self, address: &str) -> String;

    async fn stop(&self);
}

#[async_trait]
pub trait WhoisResolver: Send + Sync {
    async fn resolve(&self, address: &str) -> Option<String>;
}

/// Resolver that knows nothing; every address maps to an empty name.
pub struct NoopResolver;

#[async_trait]
impl WhoisResolver for NoopResolver {
    async fn resolve(&self, _address: &str) -> Option<String> {
        None
    }
}

pub struct CachedWhois<R> {
    resolver: R,
    cache: DashMap<String, String>,
    stopped: AtomicBool,
}

impl<R: WhoisResolver> CachedWhois<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            cache: DashMap::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl CachedWhois<NoopResolver> {
    pub fn noop() -> Arc<Self> {
        Arc::new(Self::new(NoopResolver))
    }
}

#[async_trait]
impl<R: WhoisResolver> WhoisCache for CachedWhois<R> {
    async fn lookup(&self, address: &str) -> String {
        if let Some(name) = self.cache.get(address) {
            return name.clone();
        }
        if self.is_stopped() {
            return String::new();
        }

        let name = self.resolver.resolve(address).await.unwrap_or_default();
        tracing::debug!(%address, %name, "Resolved whois entry");
        self.cache.insert(address.to_string(), name.clone());
        name
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(entries = self.cache.len(), "Whois cache stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WhoisResolver for CountingResolver {
        async fn resolve(&self, address: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(format!("owner-of-{address}"))
        }
    }

    #[tokio::test]
    async fn resolves_once_per_address() {
        let whois = CachedWhois::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });

        assert_eq!(whois.lookup("10.0.0.1").await, "owner-of-10.0.0.1");
        assert_eq!(whois.lookup("10.0.0.1").await, "owner-of-10.0.0.1");
        assert_eq!(whois.lookup("10.0.0.2").await, "owner-of-10.0.0.2");

        assert_eq!(whois.resolver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(whois.cached(), 2);
    }

    #[tokio::test]
    async fn stopped_cache_serves_only_cached() {
        let whois = CachedWhois::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        whois.lookup("10.0.0.1").await;
        whois.stop().await;
        whois.stop().await;

        assert_eq!(whois.lookup("10.0.0.1").await, "owner-of-10.0.0.1");
        assert_eq!(whois.lookup("10.0.0.9").await, "");
        assert!(whois.is_stopped());
    }
}
