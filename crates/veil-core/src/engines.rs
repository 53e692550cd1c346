//! Main engine orchestration
//!
//! Derives the enabled leaf engines from configuration, unions them into the
//! published `main` engine and refreshes them on schedule.
//!
//! Reloads are single-flight with a trailing edge: a trigger that arrives
//! while a reload runs marks it dirty and returns [`Reload::Coalesced`]; the
//! running reload then re-reads configuration and goes again. Every result
//! carries a generation and a result older than the published one is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use veil_engine::{content_digest, Engine};

use crate::bus::ConfigBus;
use crate::config::Config;
use crate::custom_filters;
use crate::error::Result;
use crate::now_ms;
use crate::registry::EngineRegistry;

pub const MAIN: &str = "main";
pub const CUSTOM: &str = "custom";
pub const ELEMENT_PICKER: &str = "element-picker";
pub const ADS: &str = "ads";
pub const TRACKING: &str = "tracking";
pub const ANNOYANCES: &str = "annoyances";

pub fn regional_id(region: &str) -> String {
    format!("lang-{}", region.trim().to_ascii_lowercase())
}

/// Leaf engines that make up `main` for `config`, in merge order.
pub fn enabled_engine_ids(config: &Config) -> Vec<String> {
    let mut ids = Vec::new();
    if config.block_ads {
        ids.push(ADS.to_string());
    }
    if config.block_trackers {
        ids.push(TRACKING.to_string());
    }
    if config.block_annoyances {
        ids.push(ANNOYANCES.to_string());
    }
    if config.regional_filters.enabled {
        for region in &config.regional_filters.regions {
            let id = regional_id(region);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    if config.effective_custom_filters().is_some() {
        ids.push(CUSTOM.to_string());
    }
    if config.has_element_picker_selectors() {
        ids.push(ELEMENT_PICKER.to_string());
    }
    ids
}

/// Filter text for the user's picked elements.
pub fn element_picker_filters(config: &Config) -> String {
    let mut lines = Vec::new();
    for (hostname, selectors) in &config.element_picker_selectors {
        for selector in selectors {
            lines.push(format!("{hostname}##{selector}"));
        }
    }
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reload {
    Published { generation: u64, engines: Vec<String> },
    /// Folded into the reload already running
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Another update is in flight
    Skipped,
    Unchanged,
    Reloaded,
}

struct Published {
    generation: u64,
    engine: Arc<Engine>,
    ids: Vec<String>,
}

#[derive(Default)]
struct ReloadState {
    running: bool,
    dirty: bool,
}

/// Clears the running flag if a reload is cancelled mid-way.
struct RunningGuard<'a> {
    state: &'a Mutex<ReloadState>,
    armed: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.running = false;
            state.dirty = false;
        }
    }
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MainEngine {
    registry: Arc<EngineRegistry>,
    bus: ConfigBus,
    published: RwLock<Published>,
    ready: watch::Sender<bool>,
    reload: Mutex<ReloadState>,
    generation: AtomicU64,
    updating: AtomicBool,
}

impl MainEngine {
    pub fn new(registry: Arc<EngineRegistry>, bus: ConfigBus) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            registry,
            bus,
            published: RwLock::new(Published {
                generation: 0,
                engine: Arc::new(Engine::empty()),
                ids: Vec::new(),
            }),
            ready,
            reload: Mutex::new(ReloadState::default()),
            generation: AtomicU64::new(0),
            updating: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Restore the persisted `main` engine when it still matches the
    /// configuration, otherwise rebuild it. Raises the readiness signal.
    pub async fn setup(&self) -> Result<()> {
        let config = self.bus.current();
        let ids = enabled_engine_ids(&config);

        let restored = match self.registry.init(MAIN).await {
            Some(main) if main.list_names() == ids => {
                let generation = self.next_generation();
                self.publish(generation, main, ids);
                log::info!("main engine restored from snapshot");
                true
            }
            _ => false,
        };
        if !restored {
            self.reload_main_engine().await?;
        }

        self.ready.send_replace(true);
        Ok(())
    }

    /// Resolves once [`setup`](Self::setup) completed.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// The published engine. Readers always see a whole engine.
    pub fn engine(&self) -> Arc<Engine> {
        Arc::clone(&self.published.read().unwrap_or_else(|e| e.into_inner()).engine)
    }

    /// Leaf ids that made it into the published engine.
    pub fn engine_ids(&self) -> Vec<String> {
        self.published.read().unwrap_or_else(|e| e.into_inner()).ids.clone()
    }

    pub fn generation(&self) -> u64 {
        self.published.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn publish(&self, generation: u64, engine: Arc<Engine>, ids: Vec<String>) -> bool {
        let mut published = self.published.write().unwrap_or_else(|e| e.into_inner());
        if generation <= published.generation {
            log::debug!(
                "discarding main engine generation {generation}, {} is published",
                published.generation
            );
            return false;
        }
        *published = Published { generation, engine, ids };
        true
    }

    /// Rebuild `main` from the enabled leaf engines.
    pub async fn reload_main_engine(&self) -> Result<Reload> {
        {
            let mut state = self.reload.lock().unwrap_or_else(|e| e.into_inner());
            if state.running {
                state.dirty = true;
                log::debug!("main engine reload coalesced");
                return Ok(Reload::Coalesced);
            }
            state.running = true;
        }
        let mut guard = RunningGuard {
            state: &self.reload,
            armed: true,
        };

        loop {
            let config = self.bus.current();
            let ids = enabled_engine_ids(&config);
            let generation = self.next_generation();
            let (engine, resolved) = self.build(&config, &ids).await?;
            self.publish(generation, engine, resolved.clone());
            log::info!("main engine reloaded (generation {generation}): {resolved:?}");

            let mut state = self.reload.lock().unwrap_or_else(|e| e.into_inner());
            if state.dirty {
                state.dirty = false;
                continue;
            }
            state.running = false;
            guard.armed = false;
            return Ok(Reload::Published {
                generation,
                engines: resolved,
            });
        }
    }

    async fn build(&self, config: &Config, ids: &[String]) -> Result<(Arc<Engine>, Vec<String>)> {
        let mut engines = Vec::with_capacity(ids.len());
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            match self.resolve_leaf(config, id).await {
                Ok(engine) => {
                    engines.push(engine);
                    resolved.push(id.clone());
                }
                Err(e) => log::warn!("engine '{id}' left out of main: {e}"),
            }
        }
        if engines.is_empty() && !ids.is_empty() {
            log::error!("no enabled engine could be loaded, main engine is empty");
        }
        let main = self.registry.replace(MAIN, &engines).await?;
        Ok((main, resolved))
    }

    async fn resolve_leaf(&self, config: &Config, id: &str) -> Result<Arc<Engine>> {
        let text = match id {
            CUSTOM => config.effective_custom_filters().map(str::to_string),
            ELEMENT_PICKER => Some(element_picker_filters(config)),
            _ => None,
        };
        let Some(text) = text else {
            return self.registry.resolve(id).await;
        };

        // user-built engines are always rebuilt from the configuration
        let digest = match id {
            CUSTOM => {
                custom_filters::custom_digest(&text, config.custom_filters.trusted_scriptlets)
            }
            _ => content_digest(&text),
        };
        if let Some(engine) = self.registry.init(id).await {
            if engine.digest() == digest {
                return Ok(engine);
            }
        }
        let engine = if id == CUSTOM {
            custom_filters::compile(&text, config.custom_filters.trusted_scriptlets).1
        } else {
            Engine::compile(id, &text)
        };
        self.registry.insert(id, engine).await
    }

    /// Refresh every enabled list from the remote source and reload `main`
    /// when any changed. Overlapping calls are skipped.
    pub async fn update_engines(&self) -> Result<UpdateOutcome> {
        if self.updating.swap(true, Ordering::AcqRel) {
            log::debug!("engine update already running");
            return Ok(UpdateOutcome::Skipped);
        }
        let _guard = FlagGuard(&self.updating);

        let config = self.bus.current();
        let mut changed = false;
        for id in enabled_engine_ids(&config) {
            if id == CUSTOM || id == ELEMENT_PICKER {
                continue;
            }
            match self.registry.update(&id).await {
                Ok(updated) => changed |= updated,
                Err(e) => log::warn!("engine '{id}' update failed: {e}"),
            }
        }

        let outcome = if changed {
            self.reload_main_engine().await?;
            UpdateOutcome::Reloaded
        } else {
            UpdateOutcome::Unchanged
        };
        self.bus.update(|c| c.filters_updated_at = now_ms());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::StaticListSource;
    use crate::storage::MemoryStore;
    use veil_engine::{CosmeticQuery, FilterIndex, MatchDecision, Request};

    fn main_engine(config: Config, source: StaticListSource) -> MainEngine {
        let registry = EngineRegistry::new(Arc::new(MemoryStore::new()), Arc::new(source), None);
        MainEngine::new(Arc::new(registry), ConfigBus::new(config))
    }

    fn lists() -> StaticListSource {
        StaticListSource::new()
            .with_list(ADS, "||ads.com^")
            .with_list(TRACKING, "||tracker.com^")
            .with_list("lang-de", "||werbung.de^")
    }

    #[test]
    fn enabled_ids_follow_toggles() {
        let mut config = Config {
            block_ads: true,
            block_trackers: false,
            ..Default::default()
        };
        assert_eq!(enabled_engine_ids(&config), vec![ADS]);

        config.block_annoyances = true;
        config.regional_filters.enabled = true;
        config.regional_filters.regions = vec!["de".to_string(), "DE".to_string()];
        config.custom_filters.enabled = true;
        assert_eq!(enabled_engine_ids(&config), vec![ADS, ANNOYANCES, "lang-de", CUSTOM]);
    }

    #[test]
    fn element_picker_is_independent() {
        let mut config = Config {
            block_ads: false,
            block_trackers: false,
            ..Default::default()
        };
        config
            .element_picker_selectors
            .insert("site.com".to_string(), vec![".popup".to_string()]);
        assert_eq!(enabled_engine_ids(&config), vec![ELEMENT_PICKER]);
        assert_eq!(element_picker_filters(&config), "site.com##.popup");
    }

    #[tokio::test]
    async fn main_is_union_of_enabled_engines() {
        let config = Config {
            block_ads: true,
            block_trackers: true,
            ..Default::default()
        };
        let main = main_engine(config, lists());
        main.setup().await.unwrap();
        main.ready().await;

        assert_eq!(main.engine().list_names(), vec![ADS, TRACKING]);
        let req = Request::new("https://tracker.com/t.js", Some("https://site.com"), "script");
        assert_eq!(main.engine().match_request(&req).decision, MatchDecision::Block);
    }

    #[tokio::test]
    async fn missing_engine_is_left_out() {
        let mut config = Config::default();
        config.regional_filters.enabled = true;
        config.regional_filters.regions = vec!["xx".to_string()];
        let main = main_engine(config, lists());

        let reload = main.reload_main_engine().await.unwrap();
        assert_eq!(
            reload,
            Reload::Published {
                generation: 1,
                engines: vec![ADS.to_string(), TRACKING.to_string()]
            }
        );
    }

    #[tokio::test]
    async fn nothing_enabled_publishes_empty_engine() {
        let config = Config {
            block_ads: false,
            block_trackers: false,
            ..Default::default()
        };
        let main = main_engine(config, lists());
        main.reload_main_engine().await.unwrap();
        assert!(main.engine().is_empty());
        assert_eq!(main.generation(), 1);
    }

    #[tokio::test]
    async fn custom_engine_follows_config_text() {
        let mut config = Config {
            block_ads: false,
            block_trackers: false,
            ..Default::default()
        };
        config.custom_filters.enabled = true;
        config.custom_filters.text = "||custom.com^".to_string();
        let main = main_engine(config, lists());
        main.setup().await.unwrap();

        let req = Request::new("https://custom.com/x.js", Some("https://site.com"), "script");
        assert_eq!(main.engine().match_request(&req).decision, MatchDecision::Block);

        main.bus.update(|c| c.custom_filters.text = "||other.com^".to_string());
        main.reload_main_engine().await.unwrap();
        assert_eq!(main.engine().match_request(&req).decision, MatchDecision::Allow);
    }

    #[tokio::test]
    async fn disabling_trusted_scriptlets_rebuilds_custom() {
        let mut config = Config {
            block_ads: false,
            block_trackers: false,
            ..Default::default()
        };
        config.custom_filters.enabled = true;
        config.custom_filters.trusted_scriptlets = true;
        config.custom_filters.text =
            "example.com##+js(trusted-replace-node-text, a, b)".to_string();
        let main = main_engine(config, lists());
        main.reload_main_engine().await.unwrap();

        let query = CosmeticQuery::bootstrap("https://example.com/");
        assert_eq!(main.engine().match_cosmetics(&query).scriptlets.len(), 1);

        main.bus.update(|c| c.custom_filters.trusted_scriptlets = false);
        main.reload_main_engine().await.unwrap();
        assert!(main.engine().match_cosmetics(&query).scriptlets.is_empty());
    }

    #[tokio::test]
    async fn stale_generation_is_discarded() {
        let main = main_engine(Config::default(), lists());
        main.reload_main_engine().await.unwrap();
        let current = main.engine();
        assert!(!main.publish(0, Arc::new(Engine::empty()), Vec::new()));
        assert!(Arc::ptr_eq(&current, &main.engine()));
    }

    #[tokio::test]
    async fn update_without_remote_stamps_timestamp() {
        let main = main_engine(Config::default(), lists());
        main.setup().await.unwrap();
        assert_eq!(main.update_engines().await.unwrap(), UpdateOutcome::Unchanged);
        assert!(main.bus.current().filters_updated_at > 0);
    }
}
