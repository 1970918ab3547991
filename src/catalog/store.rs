//! Catalog Store - explicit lifecycle for the shared schema catalog
//!
//! Readers always get an `Arc<SchemaCatalog>`. While a rebuild is running
//! they keep seeing the last good catalog; the rebuild result replaces it
//! in one swap. Only one rebuild runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{SchemaCatalog, SchemaCatalogBuilder};
use crate::cache::{CacheKey, CacheKind, ResponseCache};
use crate::error::Result;
use crate::metadata::MetadataProvider;

pub struct CatalogStore {
    provider: Arc<dyn MetadataProvider>,
    builder: SchemaCatalogBuilder,
    cache: Arc<ResponseCache>,
    ttl: Duration,
    current: RwLock<Option<Arc<SchemaCatalog>>>,
    refresh_lock: Mutex<()>,
    stale: AtomicBool,
}

impl CatalogStore {
    pub fn new(
        provider: Arc<dyn MetadataProvider>,
        builder: SchemaCatalogBuilder,
        cache: Arc<ResponseCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            provider,
            builder,
            cache,
            ttl,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            stale: AtomicBool::new(false),
        }
    }

    pub fn source_id(&self) -> String {
        self.provider.source_id()
    }

    /// Current catalog, building it on first use and refreshing it once the
    /// TTL has passed. If another task is already refreshing, the last good
    /// catalog is returned instead of waiting.
    pub async fn catalog(&self) -> Result<Arc<SchemaCatalog>> {
        if let Some(current) = self.current().await {
            if self.is_fresh(&current) {
                return Ok(current);
            }
            match self.refresh_lock.try_lock() {
                Ok(_guard) => return self.rebuild(true).await,
                Err(_) => {
                    debug!("Catalog refresh in progress, serving version {}", current.version);
                    return Ok(current);
                }
            }
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have finished the first build while we waited.
        if let Some(current) = self.current().await {
            if self.is_fresh(&current) {
                return Ok(current);
            }
        }
        let force = self.current().await.is_some();
        self.rebuild(force).await
    }

    /// Rebuild now, bypassing any cached analysis.
    pub async fn refresh(&self) -> Result<Arc<SchemaCatalog>> {
        let _guard = self.refresh_lock.lock().await;
        self.rebuild(true).await
    }

    /// Mark the catalog stale; the next `catalog()` call rebuilds it.
    pub fn invalidate(&self) {
        info!("Schema catalog for {} invalidated", self.provider.source_id());
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Last good catalog without triggering a build.
    pub async fn current(&self) -> Option<Arc<SchemaCatalog>> {
        self.current.read().await.clone()
    }

    fn is_fresh(&self, catalog: &SchemaCatalog) -> bool {
        if self.stale.load(Ordering::SeqCst) {
            return false;
        }
        let age = chrono::Utc::now().signed_duration_since(catalog.fetched_at);
        age.to_std().map_or(true, |age| age < self.ttl)
    }

    /// Caller must hold `refresh_lock`.
    async fn rebuild(&self, force: bool) -> Result<Arc<SchemaCatalog>> {
        let key = CacheKey::new(CacheKind::SchemaAnalysis, &self.provider.source_id(), "");
        if force {
            self.cache.invalidate(&key);
        }
        self.stale.store(false, Ordering::SeqCst);

        let provider = Arc::clone(&self.provider);
        let builder = &self.builder;
        let catalog: SchemaCatalog = match self
            .cache
            .get_or_try_insert_with(&key, || async move { builder.build(provider.as_ref()).await })
            .await
        {
            Ok(catalog) => catalog,
            Err(e) => {
                // Still stale; the last good catalog (if any) stays visible.
                if force {
                    self.stale.store(true, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        let catalog = Arc::new(catalog);
        let previous = {
            let mut current = self.current.write().await;
            current.replace(Arc::clone(&catalog))
        };
        match previous {
            Some(prev) if prev.version != catalog.version => {
                info!("Schema version changed {} -> {}", prev.version, catalog.version);
                self.cache
                    .purge_other_versions(CacheKind::IntentExtraction, &catalog.version);
            }
            Some(_) => debug!("Schema catalog refreshed, version {} unchanged", catalog.version),
            None => info!("Schema catalog loaded, version {}", catalog.version),
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::credit_snapshot;
    use crate::metadata::{MetadataError, MetadataSnapshot};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct CountingProvider {
        fetches: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl MetadataProvider for CountingProvider {
        fn source_id(&self) -> String {
            "counting".to_string()
        }

        async fn fetch(&self) -> std::result::Result<MetadataSnapshot, MetadataError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            // The first build is never gated so the store has a last-good catalog.
            if n > 0 {
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
            }
            Ok(credit_snapshot())
        }
    }

    fn store(provider: Arc<CountingProvider>, ttl: Duration) -> CatalogStore {
        CatalogStore::new(
            provider,
            SchemaCatalogBuilder::new(),
            Arc::new(ResponseCache::new(ttl)),
            ttl,
        )
    }

    #[tokio::test]
    async fn test_catalog_built_once_within_ttl() {
        let provider = Arc::new(CountingProvider {
            fetches: AtomicUsize::new(0),
            gate: None,
        });
        let store = store(Arc::clone(&provider), Duration::from_secs(3600));
        let a = store.catalog().await.unwrap();
        let b = store.catalog().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let provider = Arc::new(CountingProvider {
            fetches: AtomicUsize::new(0),
            gate: None,
        });
        let store = store(Arc::clone(&provider), Duration::from_secs(3600));
        let first = store.catalog().await.unwrap();
        store.invalidate();
        let second = store.catalog().await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(first.version, second.version);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_readers_see_last_good_during_refresh() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(CountingProvider {
            fetches: AtomicUsize::new(0),
            gate: Some(Arc::clone(&gate)),
        });
        let store = Arc::new(store(Arc::clone(&provider), Duration::from_secs(3600)));
        let original = store.catalog().await.unwrap();

        let refreshing = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.refresh().await })
        };
        while provider.fetches.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        store.invalidate();
        let during = store.catalog().await.unwrap();
        assert!(Arc::ptr_eq(&original, &during));

        gate.notify_one();
        let refreshed = refreshing.await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&original, &refreshed));
        let visible = store.current().await.unwrap();
        assert!(Arc::ptr_eq(&visible, &refreshed));
    }
}
