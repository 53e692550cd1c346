//! Engine registry
//!
//! Owns every named engine: a cache of published `Arc<Engine>` values backed
//! by a [`SnapshotStore`], with bundled and remote [`ListSource`]s to rebuild
//! from. Work on one name is serialized by a per-name async mutex, so a second
//! caller waits for the first and then sees its result in the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use veil_engine::Engine;

use crate::error::{Error, Result};
use crate::sources::{list_file, snapshot_file, ListSource};
use crate::storage::SnapshotStore;

pub struct EngineRegistry {
    store: Arc<dyn SnapshotStore>,
    bundled: Arc<dyn ListSource>,
    remote: Option<Arc<dyn ListSource>>,
    cache: RwLock<HashMap<String, Arc<Engine>>>,
    guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EngineRegistry {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        bundled: Arc<dyn ListSource>,
        remote: Option<Arc<dyn ListSource>>,
    ) -> Self {
        Self {
            store,
            bundled,
            remote,
            cache: RwLock::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
        }
    }

    fn guard(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(guards.entry(name.to_string()).or_default())
    }

    /// Cached engine, without touching storage.
    pub fn get(&self, name: &str) -> Option<Arc<Engine>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn publish(&self, name: &str, engine: Arc<Engine>) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), engine);
    }

    /// Load `name` from cache, persisted snapshot or bundled prebuilt
    /// snapshot. `None` means the caller has to rebuild.
    pub async fn init(&self, name: &str) -> Option<Arc<Engine>> {
        let guard = self.guard(name);
        let _lock = guard.lock().await;
        self.init_locked(name).await
    }

    async fn init_locked(&self, name: &str) -> Option<Arc<Engine>> {
        if let Some(engine) = self.get(name) {
            return Some(engine);
        }

        match self.store.load(name).await {
            Ok(Some(data)) => match Engine::deserialize(&data) {
                Ok(engine) => {
                    log::debug!("engine '{name}' loaded from storage");
                    let engine = Arc::new(engine);
                    self.publish(name, Arc::clone(&engine));
                    return Some(engine);
                }
                Err(e) => log::warn!("engine '{name}': stored snapshot unusable: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::warn!("engine '{name}': storage read failed: {e}"),
        }

        if let Ok(data) = self.bundled.fetch_bytes(&snapshot_file(name)).await {
            match Engine::deserialize(&data) {
                Ok(engine) => {
                    log::debug!("engine '{name}' loaded from bundled snapshot");
                    let engine = Arc::new(engine);
                    self.publish(name, Arc::clone(&engine));
                    return Some(engine);
                }
                Err(e) => log::warn!("engine '{name}': bundled snapshot unusable: {e}"),
            }
        }

        None
    }

    /// Compile list text into `name`, persist it and publish it.
    pub async fn create(&self, name: &str, text: &str) -> Result<Arc<Engine>> {
        let guard = self.guard(name);
        let _lock = guard.lock().await;
        self.store_locked(name, Engine::compile(name, text)).await
    }

    /// Publish an engine built elsewhere.
    pub async fn insert(&self, name: &str, engine: Engine) -> Result<Arc<Engine>> {
        let guard = self.guard(name);
        let _lock = guard.lock().await;
        self.store_locked(name, engine).await
    }

    /// Merge leaf engines into the composite `name`.
    pub async fn replace(&self, name: &str, engines: &[Arc<Engine>]) -> Result<Arc<Engine>> {
        let merged = Engine::merge(engines.iter().map(|e| e.as_ref()));
        self.insert(name, merged).await
    }

    async fn store_locked(&self, name: &str, engine: Engine) -> Result<Arc<Engine>> {
        let data = engine.serialize()?;
        if let Err(e) = self.store.save(name, &data).await {
            // the in-memory engine is still good; next start rebuilds
            log::warn!("engine '{name}': failed to persist snapshot: {e}");
        }
        let engine = Arc::new(engine);
        self.publish(name, Arc::clone(&engine));
        Ok(engine)
    }

    /// Re-fetch `name` from the remote source. Recompiles and returns `true`
    /// only when the content changed.
    ///
    /// The fetch runs without the per-name guard, so a slow remote never
    /// holds up `init` or `resolve` of the same engine.
    pub async fn update(&self, name: &str) -> Result<bool> {
        let Some(remote) = &self.remote else {
            return Ok(false);
        };

        let text = remote.fetch_text(&list_file(name)).await?;
        let digest = veil_engine::content_digest(&text);

        let guard = self.guard(name);
        let _lock = guard.lock().await;
        let current = self.init_locked(name).await;
        if current.is_some_and(|engine| engine.digest() == digest) {
            log::debug!("engine '{name}' is up to date");
            return Ok(false);
        }

        self.store_locked(name, Engine::compile(name, &text)).await?;
        log::info!("engine '{name}' updated");
        Ok(true)
    }

    /// Drop `name` from cache and storage.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let guard = self.guard(name);
        let _lock = guard.lock().await;
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        self.store.remove(name).await
    }

    /// [`init`](Self::init), falling back to compiling bundled and then
    /// remote list text.
    pub async fn resolve(&self, name: &str) -> Result<Arc<Engine>> {
        let guard = self.guard(name);
        let _lock = guard.lock().await;

        if let Some(engine) = self.init_locked(name).await {
            return Ok(engine);
        }

        let mut last_error = None;
        let sources = std::iter::once(&self.bundled).chain(self.remote.as_ref());
        for source in sources {
            match source.fetch_text(&list_file(name)).await {
                Ok(text) => {
                    log::info!("engine '{name}' rebuilt from list text");
                    return self.store_locked(name, Engine::compile(name, &text)).await;
                }
                Err(e) => last_error = Some(e),
            }
        }

        if let Some(e) = last_error {
            log::debug!("engine '{name}': {e}");
        }
        Err(Error::EngineUnavailable(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::StaticListSource;
    use crate::storage::MemoryStore;

    fn test_registry(
        bundled: StaticListSource,
        remote: Option<StaticListSource>,
    ) -> (EngineRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = EngineRegistry::new(
            store.clone(),
            Arc::new(bundled),
            remote.map(|r| Arc::new(r) as Arc<dyn ListSource>),
        );
        (registry, store)
    }

    #[tokio::test]
    async fn init_misses_then_resolve_rebuilds() {
        let (registry, store) =
            test_registry(StaticListSource::new().with_list("ads", "||ads.com^"), None);
        assert!(registry.init("ads").await.is_none());

        let engine = registry.resolve("ads").await.unwrap();
        assert_eq!(engine.list_names(), vec!["ads"]);
        assert!(store.load("ads").await.unwrap().is_some());
        assert!(Arc::ptr_eq(&engine, &registry.init("ads").await.unwrap()));
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_miss() {
        let (registry, store) = test_registry(StaticListSource::new(), None);
        store.save("ads", b"garbage").await.unwrap();
        assert!(registry.init("ads").await.is_none());
        assert!(matches!(registry.resolve("ads").await, Err(Error::EngineUnavailable(_))));
    }

    #[tokio::test]
    async fn init_loads_persisted_and_bundled_snapshots() {
        let prebuilt = Engine::compile("tracking", "||tracker.com^").serialize().unwrap();
        let bundled = StaticListSource::new().with_file(&snapshot_file("tracking"), prebuilt);
        let (registry, store) = test_registry(bundled, None);
        assert!(registry.init("tracking").await.is_some());

        let persisted = Engine::compile("ads", "||ads.com^").serialize().unwrap();
        store.save("ads", &persisted).await.unwrap();
        assert_eq!(registry.init("ads").await.unwrap().list_names(), vec!["ads"]);
    }

    #[tokio::test]
    async fn update_recompiles_only_on_change() {
        let bundled = StaticListSource::new().with_list("ads", "||ads.com^");
        let remote = StaticListSource::new().with_list("ads", "||ads.com^");
        let (registry, _) = test_registry(bundled, Some(remote));
        registry.resolve("ads").await.unwrap();
        assert!(!registry.update("ads").await.unwrap());

        let bundled = StaticListSource::new().with_list("ads", "||ads.com^");
        let remote = StaticListSource::new().with_list("ads", "||ads.com^\n||more-ads.com^");
        let (registry, _) = test_registry(bundled, Some(remote));
        registry.resolve("ads").await.unwrap();
        assert!(registry.update("ads").await.unwrap());
        assert_eq!(registry.get("ads").unwrap().stats().network, 2);
    }

    /// Remote that never answers.
    struct StalledRemote;

    #[async_trait::async_trait]
    impl ListSource for StalledRemote {
        async fn fetch_bytes(&self, _path: &str) -> Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_update_does_not_block_resolve() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(EngineRegistry::new(
            store,
            Arc::new(StaticListSource::new().with_list("ads", "||ads.com^")),
            Some(Arc::new(StalledRemote)),
        ));

        let updating = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.update("ads").await }
        });
        tokio::task::yield_now().await;

        let resolved =
            tokio::time::timeout(std::time::Duration::from_secs(1), registry.resolve("ads")).await;
        assert!(resolved.expect("resolve waited on the update").is_ok());
        assert!(!updating.is_finished());
        updating.abort();
    }

    #[tokio::test]
    async fn replace_and_remove() {
        let (registry, store) = test_registry(StaticListSource::new(), None);
        let ads = registry.create("ads", "||ads.com^").await.unwrap();
        let tracking = registry.create("tracking", "||t.com^").await.unwrap();
        let main = registry.replace("main", &[ads, tracking]).await.unwrap();
        assert_eq!(main.list_names(), vec!["ads", "tracking"]);

        registry.remove("main").await.unwrap();
        assert!(registry.get("main").is_none());
        assert!(store.load("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_init_shares_result() {
        let prebuilt = Engine::compile("ads", "||ads.com^").serialize().unwrap();
        let bundled = StaticListSource::new().with_file(&snapshot_file("ads"), prebuilt);
        let (registry, _) = test_registry(bundled, None);
        let registry = Arc::new(registry);

        let (a, b) = tokio::join!(registry.init("ads"), registry.init("ads"));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }
}
