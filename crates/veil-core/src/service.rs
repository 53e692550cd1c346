//! Filtering service
//!
//! Wires the subsystems to the configuration bus and exposes the entry
//! points a host calls: request and navigation hooks, alarms, tab lifecycle
//! and content-script messages.
//!
//! # Tasks
//!
//! | Task    | Reacts to                         | Does                               |
//! |---------|-----------------------------------|------------------------------------|
//! | engines | engine set, custom text, picker   | recompile `custom`, reload `main`  |
//! | rules   | every change                      | declarative rule sync              |
//! | pause   | `paused`                          | expire entries, schedule alarms    |
//! | update  | `update_interval` timer           | refresh lists from the remote      |
//!
//! Every task is aborted when the service is dropped.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use veil_engine::{Engine, ResponseMatch};

use crate::bus::{ConfigBus, ConfigChange, ConfigSubscription};
use crate::config::{Config, Settings};
use crate::cosmetics::CosmeticInjector;
use crate::custom_filters::{CustomFilterCompiler, CustomFilterReport};
use crate::dnr::{DeclarativeHost, RuleSynchronizer, SyncReport};
use crate::engines::{enabled_engine_ids, MainEngine, UpdateOutcome};
use crate::error::{Error, Result};
use crate::messaging::{respond, ContentMessage, ContentResponse};
use crate::network::{RequestBlocker, RequestDetails, Verdict};
use crate::now_ms;
use crate::pause::{Alarms, PauseController};
use crate::redirect::{Navigation, RedirectInterceptor};
use crate::registry::EngineRegistry;
use crate::sources::{
    load_public_suffixes, BundledListSource, HttpListSource, ListSource, StaticListSource,
};
use crate::storage::{FsStore, MemoryStore, SnapshotStore};
use crate::strategy::{Enforcement, EnforcementStrategy, PlatformCapabilities};
use crate::trust::{NoTrackerDb, TrackerDb};

// =============================================================================
// Builder
// =============================================================================

pub struct ServiceBuilder {
    settings: Settings,
    config: Config,
    capabilities: PlatformCapabilities,
    alarms: Arc<dyn Alarms>,
    host: Option<Arc<dyn DeclarativeHost>>,
    trackers: Arc<dyn TrackerDb>,
    store: Option<Arc<dyn SnapshotStore>>,
    bundled: Option<Arc<dyn ListSource>>,
    remote: Option<Arc<dyn ListSource>>,
}

impl ServiceBuilder {
    pub fn new(settings: Settings, config: Config, alarms: Arc<dyn Alarms>) -> Self {
        Self {
            settings,
            config,
            capabilities: PlatformCapabilities::default(),
            alarms,
            host: None,
            trackers: Arc::new(NoTrackerDb),
            store: None,
            bundled: None,
            remote: None,
        }
    }

    pub fn capabilities(mut self, capabilities: PlatformCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Declarative rule API of the host.
    pub fn declarative_host(mut self, host: Arc<dyn DeclarativeHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn trackers(mut self, trackers: Arc<dyn TrackerDb>) -> Self {
        self.trackers = trackers;
        self
    }

    /// Overrides `snapshot_dir`.
    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides `bundled_dir`.
    pub fn bundled(mut self, source: Arc<dyn ListSource>) -> Self {
        self.bundled = Some(source);
        self
    }

    /// Overrides `remote_base_url`.
    pub fn remote(mut self, source: Arc<dyn ListSource>) -> Self {
        self.remote = Some(source);
        self
    }

    /// Resolve the enforcement strategy, set up the main engine and start
    /// the subscriber tasks. Must run inside a tokio runtime.
    pub async fn start(self) -> Result<FilteringService> {
        let settings = self.settings;
        let store: Arc<dyn SnapshotStore> = match self.store {
            Some(store) => store,
            None => match &settings.snapshot_dir {
                Some(dir) => Arc::new(FsStore::new(dir)),
                None => Arc::new(MemoryStore::new()),
            },
        };
        let bundled: Arc<dyn ListSource> = match self.bundled {
            Some(source) => source,
            None => match &settings.bundled_dir {
                Some(dir) => Arc::new(BundledListSource::new(dir)),
                None => Arc::new(StaticListSource::new()),
            },
        };
        load_public_suffixes(bundled.as_ref()).await;
        let remote: Option<Arc<dyn ListSource>> = match self.remote {
            Some(source) => Some(source),
            None => match settings.remote_base_url.as_deref() {
                Some(url) => Some(Arc::new(HttpListSource::new(url, settings.fetch_timeout())?)),
                None => None,
            },
        };

        let bus = ConfigBus::with_debounce(self.config, settings.bus_debounce());
        let enforcement = Enforcement::select(self.capabilities, settings.enforcement);
        let strategy = match enforcement {
            Enforcement::Declarative => {
                let host = self.host.clone().ok_or_else(|| {
                    Error::Settings("declarative enforcement needs a declarative host".to_string())
                })?;
                let trackers = Arc::clone(&self.trackers);
                let synchronizer = RuleSynchronizer::new(host, trackers, remote.clone());
                EnforcementStrategy::Declarative(synchronizer)
            }
            Enforcement::Imperative => EnforcementStrategy::Imperative(RequestBlocker::new(
                bus.clone(),
                Arc::clone(&self.trackers),
                settings.extension_origin.clone(),
            )),
        };
        log::info!("enforcement strategy: {enforcement:?}");

        let registry = Arc::new(EngineRegistry::new(store, bundled, remote));
        let session_host = match enforcement {
            Enforcement::Declarative => self.host.clone(),
            Enforcement::Imperative => None,
        };
        let shared = Arc::new(Shared {
            main: MainEngine::new(Arc::clone(&registry), bus.clone()),
            custom: CustomFilterCompiler::new(registry),
            redirects: RedirectInterceptor::new(
                bus.clone(),
                Arc::clone(&self.trackers),
                settings.interstitial_url(),
                session_host,
            ),
            pause: PauseController::new(bus.clone(), self.alarms),
            injector: CosmeticInjector::new(bus.clone()),
            strategy,
            trackers: self.trackers,
            custom_report: Mutex::new(None),
            sync_report: Mutex::new(None),
            bus,
            settings,
        });

        // subscribe before setup so no change slips between the two
        let engines_sub = shared.bus.subscribe();
        let rules_sub = shared.bus.subscribe();
        let pause_sub = shared.bus.subscribe();

        shared.apply_custom_filters(&shared.bus.current()).await;
        shared.main.setup().await?;

        let tasks = vec![
            tokio::spawn(engines_task(Arc::clone(&shared), engines_sub)),
            tokio::spawn(rules_task(Arc::clone(&shared), rules_sub)),
            tokio::spawn(pause_task(Arc::clone(&shared), pause_sub)),
            tokio::spawn(update_task(Arc::clone(&shared))),
        ];
        Ok(FilteringService { shared, tasks })
    }
}

// =============================================================================
// Service
// =============================================================================

struct Shared {
    settings: Settings,
    bus: ConfigBus,
    main: MainEngine,
    custom: CustomFilterCompiler,
    strategy: EnforcementStrategy,
    redirects: RedirectInterceptor,
    pause: PauseController,
    injector: CosmeticInjector,
    trackers: Arc<dyn TrackerDb>,
    custom_report: Mutex<Option<CustomFilterReport>>,
    sync_report: Mutex<Option<SyncReport>>,
}

impl Shared {
    async fn apply_custom_filters(&self, config: &Config) {
        match self.custom.apply(config).await {
            Ok(report) => {
                *self.custom_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report)
            }
            Err(e) => log::error!("custom filters not applied: {e}"),
        }
    }

    async fn engine(&self) -> Arc<Engine> {
        self.main.ready().await;
        self.main.engine()
    }
}

pub struct FilteringService {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl FilteringService {
    pub fn bus(&self) -> &ConfigBus {
        &self.shared.bus
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn enforcement(&self) -> Enforcement {
        self.shared.strategy.kind()
    }

    /// The published main engine, once setup finished.
    pub async fn engine(&self) -> Arc<Engine> {
        self.shared.engine().await
    }

    pub fn engine_ids(&self) -> Vec<String> {
        self.shared.main.engine_ids()
    }

    /// Result of the last custom filter compilation.
    pub fn custom_filter_report(&self) -> Option<CustomFilterReport> {
        self.shared.custom_report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Result of the last declarative rule sync.
    pub fn last_sync_report(&self) -> Option<SyncReport> {
        self.shared.sync_report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.strategy.is_degraded()
    }

    pub async fn on_before_request(&self, details: &RequestDetails) -> Option<Verdict> {
        let engine = self.shared.engine().await;
        self.shared.strategy.on_before_request(&engine, details, now_ms())
    }

    pub async fn on_headers_received(&self, details: &RequestDetails) -> Option<ResponseMatch> {
        let engine = self.shared.engine().await;
        self.shared.strategy.on_headers_received(&engine, details, now_ms())
    }

    pub async fn on_before_navigate(&self, tab_id: i32, url: &str) -> Navigation {
        let engine = self.shared.engine().await;
        self.shared.redirects.on_before_navigate(&engine, tab_id, url, now_ms())
    }

    pub async fn allow_once(&self, tab_id: i32, url: &str) -> Result<()> {
        self.shared.redirects.allow_once(tab_id, url).await
    }

    pub fn disable_redirect_protection(&self, hostname: &str) -> bool {
        self.shared.redirects.disable_for(hostname)
    }

    pub fn pause(&self, hostname: &str, revoke_at: Option<u64>) -> bool {
        self.shared.pause.pause(hostname, revoke_at)
    }

    pub fn resume(&self, hostname: &str) -> bool {
        self.shared.pause.resume(hostname)
    }

    /// Returns whether the alarm was ours.
    pub async fn on_alarm(&self, name: &str) -> Result<bool> {
        self.shared.pause.on_alarm(name, now_ms()).await
    }

    pub async fn on_tab_removed(&self, tab_id: i32) -> Result<()> {
        self.shared.redirects.forget_tab(tab_id).await
    }

    pub async fn handle_message(&self, message: ContentMessage) -> ContentResponse {
        let engine = self.shared.engine().await;
        respond(
            message,
            &engine,
            &self.shared.injector,
            self.shared.trackers.as_ref(),
            now_ms(),
        )
    }

    pub async fn on_tracker_metadata_changed(&self) -> Result<()> {
        let config = self.shared.bus.current();
        self.shared.strategy.on_tracker_metadata_changed(&config).await?;
        Ok(())
    }

    /// Refresh lists now instead of waiting for the timer.
    pub async fn update_engines(&self) -> Result<UpdateOutcome> {
        self.shared.main.update_engines().await
    }

    /// Resolves once every task has handled the latest configuration.
    pub async fn idle(&self) {
        self.shared.bus.idle().await
    }

    pub fn shutdown(mut self) {
        self.abort_tasks();
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for FilteringService {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

// =============================================================================
// Tasks
// =============================================================================

fn engines_affected(change: &ConfigChange) -> bool {
    let Some(previous) = &change.previous else {
        return true;
    };
    let current = &change.current;
    enabled_engine_ids(previous) != enabled_engine_ids(current)
        || custom_filters_changed(change)
        || previous.element_picker_selectors != current.element_picker_selectors
}

fn custom_filters_changed(change: &ConfigChange) -> bool {
    change.changed(|c| &c.custom_filters) || change.changed(|c| &c.managed.custom_filters)
}

async fn engines_task(shared: Arc<Shared>, mut sub: ConfigSubscription) {
    // the first delivery is what setup already built
    if sub.next().await.is_none() {
        return;
    }
    while let Some(change) = sub.next().await {
        if !engines_affected(&change) {
            continue;
        }
        if custom_filters_changed(&change) {
            shared.apply_custom_filters(&change.current).await;
        }
        if let Err(e) = shared.main.reload_main_engine().await {
            log::error!("main engine reload failed: {e}");
        }
    }
}

async fn rules_task(shared: Arc<Shared>, mut sub: ConfigSubscription) {
    while let Some(change) = sub.next().await {
        let report = shared
            .strategy
            .sync(&change.current, change.previous.as_deref())
            .await;
        if !report.conversion_errors.is_empty() {
            log::info!(
                "{} custom filters have no declarative form",
                report.conversion_errors.len()
            );
        }
        if !report.failures.is_empty() {
            log::error!(
                "declarative rule sync incomplete, {} steps retried on next change",
                report.failures.len()
            );
        }
        *shared.sync_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
    }
}

async fn pause_task(shared: Arc<Shared>, mut sub: ConfigSubscription) {
    while let Some(change) = sub.next().await {
        if !change.changed(|c| &c.paused) {
            continue;
        }
        if let Err(e) = shared.pause.reconcile(now_ms()).await {
            log::error!("pause reconcile failed: {e}");
        }
    }
}

async fn update_task(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.settings.update_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        match shared.main.update_engines().await {
            Ok(outcome) => log::debug!("scheduled list update: {outcome:?}"),
            Err(e) => log::warn!("scheduled list update failed: {e}"),
        }
        let config = shared.bus.current();
        if let Err(e) = shared.strategy.on_tracker_metadata_changed(&config).await {
            log::warn!("exception rebuild after tracker update failed: {e}");
        }
    }
}
