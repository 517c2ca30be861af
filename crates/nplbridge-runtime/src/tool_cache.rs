//! Per-package cache of compiled tools.
//!
//! Entries live for a TTL and are bound to the credential identity they
//! were compiled under; an identity change drops the whole package entry.
//! A miss is single-flight per package: the first caller compiles while the
//! others wait on the package gate and then reuse the stored result. Hits
//! take no lock beyond the `DashMap` shard read.

use crate::compiler::ToolCompiler;
use crate::credentials::CredentialManager;
use crate::discovery::PackageDiscovery;
use crate::tool::CompiledTool;
use crate::transport::ResilientTransport;
use async_trait::async_trait;
use dashmap::DashMap;
use nplbridge_types::error::{BridgeError, BridgeResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Produces the compiled tools of one package.
#[async_trait]
pub trait ToolSource: Send + Sync {
    async fn compile_package(
        &self,
        package: &str,
        cancel: &CancellationToken,
    ) -> BridgeResult<Vec<CompiledTool>>;
}

/// Fetches a package's spec and compiles it.
pub struct SpecToolSource {
    discovery: Arc<PackageDiscovery>,
    compiler: ToolCompiler,
    transport: Arc<ResilientTransport>,
}

impl SpecToolSource {
    pub fn new(
        discovery: Arc<PackageDiscovery>,
        compiler: ToolCompiler,
        transport: Arc<ResilientTransport>,
    ) -> Self {
        Self {
            discovery,
            compiler,
            transport,
        }
    }
}

#[async_trait]
impl ToolSource for SpecToolSource {
    async fn compile_package(
        &self,
        package: &str,
        cancel: &CancellationToken,
    ) -> BridgeResult<Vec<CompiledTool>> {
        let (descriptor, doc) = self.discovery.fetch_spec(package, cancel).await?;
        let compiled = self.compiler.compile(&doc);
        info!(
            package,
            spec_url = %descriptor.spec_url,
            tools = compiled.operations.len(),
            skipped = compiled.skipped.len(),
            "Compiled package"
        );
        let engine_url = self.discovery.engine_url();
        Ok(compiled
            .operations
            .into_iter()
            .map(|spec| CompiledTool::new(spec, self.transport.clone(), engine_url))
            .collect())
    }
}

/// A cached tool set with its compile time and identity.
struct CacheEntry {
    tools: Arc<Vec<CompiledTool>>,
    computed_at: Instant,
    identity: String,
}

/// Thread-safe TTL cache of compiled tools, keyed by package.
pub struct ToolCache {
    source: Arc<dyn ToolSource>,
    credentials: Arc<CredentialManager>,
    entries: DashMap<String, CacheEntry>,
    gates: DashMap<String, Arc<Mutex<()>>>,
    ttl: Duration,
}

impl ToolCache {
    /// A TTL of `Duration::ZERO` disables storage; misses stay single-flight.
    pub fn new(
        source: Arc<dyn ToolSource>,
        credentials: Arc<CredentialManager>,
        ttl: Duration,
    ) -> Self {
        Self {
            source,
            credentials,
            entries: DashMap::new(),
            gates: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Tools of `package`, compiled on first access, expiry, identity change
    /// or `force_refresh`.
    pub async fn get_tools(
        &self,
        package: &str,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> BridgeResult<Arc<Vec<CompiledTool>>> {
        let identity = self.credentials.identity();
        if !force_refresh {
            if let Some(tools) = self.fresh(package, &identity) {
                debug!(package, "Tool cache hit");
                return Ok(tools);
            }
        }

        let gate = self
            .gates
            .entry(package.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = tokio::select! {
            guard = gate.lock() => guard,
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
        };

        // Another caller may have filled the entry while we waited.
        if !force_refresh {
            if let Some(tools) = self.fresh(package, &identity) {
                return Ok(tools);
            }
        }

        debug!(package, force_refresh, "Tool cache miss, compiling");
        let tools = Arc::new(self.source.compile_package(package, cancel).await?);
        if !self.ttl.is_zero() {
            self.entries.insert(
                package.to_string(),
                CacheEntry {
                    tools: tools.clone(),
                    computed_at: Instant::now(),
                    // Compiling may have logged in and fixed the subject.
                    identity: self.credentials.identity(),
                },
            );
        }
        Ok(tools)
    }

    /// Cached tools if present, unexpired and compiled under `identity`.
    fn fresh(&self, package: &str, identity: &str) -> Option<Arc<Vec<CompiledTool>>> {
        let entry = self.entries.get(package)?;
        if entry.computed_at.elapsed() <= self.ttl && entry.identity == identity {
            return Some(entry.tools.clone());
        }
        let stale_identity = entry.identity != identity;
        let seen_at = entry.computed_at;
        drop(entry); // release read lock before removing
        if stale_identity {
            info!(package, "Credential identity changed, invalidating tools");
        }
        self.evict_if_unchanged(package, seen_at);
        None
    }

    /// Remove `package`'s entry only if it is still the one compiled at
    /// `seen_at`; a concurrent recompile is left in place.
    fn evict_if_unchanged(&self, package: &str, seen_at: Instant) -> bool {
        self.entries
            .remove_if(package, |_, e| e.computed_at == seen_at)
            .is_some()
    }

    /// Drop one package's entry.
    pub fn invalidate(&self, package: &str) {
        self.entries.remove(package);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Packages with a stored entry (possibly expired).
    pub fn cached_packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        packages.sort();
        packages
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::IdentityProvider;
    use nplbridge_types::credential::Credential;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        compiles: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new(delay: Duration) -> Self {
            Self {
                compiles: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }

        fn count(&self) -> usize {
            self.compiles.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolSource for CountingSource {
        async fn compile_package(
            &self,
            package: &str,
            _cancel: &CancellationToken,
        ) -> BridgeResult<Vec<CompiledTool>> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(BridgeError::SpecUnparseable {
                    package: package.to_string(),
                    reason: "bad".to_string(),
                });
            }
            Ok(Vec::new())
        }
    }

    struct SwitchableIdentity {
        identity: std::sync::Mutex<String>,
    }

    #[async_trait]
    impl IdentityProvider for SwitchableIdentity {
        fn name(&self) -> &'static str {
            "switchable"
        }
        fn identity(&self) -> String {
            self.identity.lock().unwrap().clone()
        }
        async fn obtain(&self) -> BridgeResult<Credential> {
            Ok(Credential::anonymous())
        }
        async fn refresh(&self, _refresh_token: &str) -> BridgeResult<Credential> {
            Ok(Credential::anonymous())
        }
        fn can_reauthenticate(&self) -> bool {
            true
        }
    }

    fn cache(source: Arc<CountingSource>, ttl: Duration) -> (ToolCache, Arc<SwitchableIdentity>) {
        let provider = Arc::new(SwitchableIdentity {
            identity: std::sync::Mutex::new("alice".to_string()),
        });
        let credentials = Arc::new(CredentialManager::new(provider.clone(), 30));
        (ToolCache::new(source, credentials, ttl), provider)
    }

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let (cache, _) = cache(source.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cache.get_tools("commerce", false, &cancel).await.unwrap();
        cache.get_tools("commerce", false, &cancel).await.unwrap();
        assert_eq!(source.count(), 1);
        assert_eq!(cache.cached_packages(), vec!["commerce"]);
    }

    #[tokio::test]
    async fn test_single_flight_on_miss() {
        let source = Arc::new(CountingSource::new(Duration::from_millis(50)));
        let (cache, _) = cache(source.clone(), Duration::from_secs(60));
        let cache = Arc::new(cache);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_tools("commerce", false, &CancellationToken::new())
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(source.count(), 1);
    }

    #[tokio::test]
    async fn test_expiry_force_refresh_and_invalidate() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let (cache, _) = cache(source.clone(), Duration::from_millis(20));
        let cancel = CancellationToken::new();
        cache.get_tools("commerce", false, &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.get_tools("commerce", false, &cancel).await.unwrap();
        assert_eq!(source.count(), 2);

        cache.get_tools("commerce", true, &cancel).await.unwrap();
        assert_eq!(source.count(), 3);

        cache.invalidate("commerce");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_identity_change_invalidates() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let (cache, provider) = cache(source.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cache.get_tools("commerce", false, &cancel).await.unwrap();
        *provider.identity.lock().unwrap() = "bob".to_string();
        cache.get_tools("commerce", false, &cancel).await.unwrap();
        assert_eq!(source.count(), 2);
        cache.get_tools("commerce", false, &cancel).await.unwrap();
        assert_eq!(source.count(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let source = Arc::new(CountingSource {
            compiles: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
        });
        let (cache, _) = cache(source.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        assert!(cache.get_tools("bad", false, &cancel).await.is_err());
        assert!(cache.get_tools("bad", false, &cancel).await.is_err());
        assert_eq!(source.count(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() {
        let source = Arc::new(CountingSource::new(Duration::from_millis(200)));
        let (cache, _) = cache(source, Duration::from_secs(60));
        let cache = Arc::new(cache);
        let first = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_tools("commerce", false, &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache.get_tools("commerce", false, &cancel).await.unwrap_err();
        assert_eq!(err, BridgeError::Cancelled);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_eviction_spares_recompiled_entry() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let (cache, _) = cache(source.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cache.get_tools("commerce", false, &cancel).await.unwrap();
        let seen_at = cache.entries.get("commerce").unwrap().computed_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get_tools("commerce", true, &cancel).await.unwrap();
        assert!(!cache.evict_if_unchanged("commerce", seen_at));
        assert_eq!(cache.len(), 1);

        let current = cache.entries.get("commerce").unwrap().computed_at;
        assert!(cache.evict_if_unchanged("commerce", current));
        assert!(cache.is_empty());
        assert_eq!(source.count(), 2);
    }
}
