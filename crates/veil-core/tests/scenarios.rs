//! End-to-end behavior of the orchestration layer against in-memory hosts.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use veil_core::config::{Config, Exception, PausedEntry, GLOBAL_PAUSE_ID};
use veil_core::custom_filters;
use veil_core::dnr::RuleFamily;
use veil_core::engines::{enabled_engine_ids, MainEngine, Reload, ADS, TRACKING};
use veil_core::exceptions::exception_rules;
use veil_core::pause::{alarm_name, Alarms, PauseController};
use veil_core::registry::EngineRegistry;
use veil_core::sources::{list_file, ListSource, StaticListSource, FIXES_FILE};
use veil_core::storage::{MemoryStore, SnapshotStore};
use veil_core::testing::{MemoryAlarms, MemoryHost};
use veil_core::trust::{is_trusted, NoTrackerDb, StaticTrackerDb};
use veil_core::{now_ms, ConfigBus, RuleSynchronizer};
use veil_engine::{CosmeticQuery, FilterIndex, MatchDecision, Request};

const FIXES: &str =
    r#"[{"id": 1, "priority": 1, "action": {"type": "block"},
        "condition": {"urlFilter": "||broken-ads.com^"}}]"#;

fn busy_config() -> Config {
    let mut config = Config::default();
    config
        .paused
        .insert("paused.com".to_string(), PausedEntry { revoke_at: None });
    config.redirect_protection.disabled.push("shop.com".to_string());
    config.safe_mode.enabled = true;
    config.safe_mode.denylist.push("malware.net".to_string());
    config.exceptions.insert(
        "cdn.com".to_string(),
        Exception {
            global: true,
            domains: vec![],
        },
    );
    config.custom_filters.enabled = true;
    config.custom_filters.text = "||custom-a.com^\n||custom-b.com^$script".to_string();
    config
}

fn synchronizer(host: &Arc<MemoryHost>) -> RuleSynchronizer {
    let fixes: Arc<dyn ListSource> = Arc::new(StaticListSource::new().with_file(FIXES_FILE, FIXES));
    RuleSynchronizer::new(host.clone(), Arc::new(NoTrackerDb), Some(fixes))
}

#[tokio::test]
async fn unchanged_config_issues_no_host_calls() {
    let host = Arc::new(MemoryHost::new().with_rulesets(&["ads", "tracking", "fixes"]));
    let sync = synchronizer(&host);
    let config = busy_config();

    sync.sync(&config, None).await;
    let calls = host.calls();
    assert!(calls > 0);

    let report = sync.sync(&config, Some(&config)).await;
    assert!(report.is_empty());
    assert_eq!(host.calls(), calls);
}

#[tokio::test]
async fn families_never_share_ids() {
    let host = Arc::new(MemoryHost::new());
    let sync = synchronizer(&host);
    let config = busy_config();
    sync.sync(&config, None).await;

    let mut seen = BTreeSet::new();
    for family in RuleFamily::ALL {
        for rule in host.rules_in(family) {
            assert_eq!(RuleFamily::of(rule.id), Some(family));
            assert!(seen.insert(rule.id), "id {} installed twice", rule.id);
        }
    }
    assert_eq!(seen.len(), host.dynamic_rule_ids().len());
    for family in [
        RuleFamily::Pause,
        RuleFamily::RedirectProtection,
        RuleFamily::SafeMode,
        RuleFamily::Exceptions,
        RuleFamily::CustomFilters,
        RuleFamily::Fixes,
    ] {
        assert!(!host.rules_in(family).is_empty(), "{family:?} is empty");
    }

    // replacing one family leaves the others untouched
    let before_custom = host.rules_in(RuleFamily::CustomFilters);
    let mut next = config.clone();
    next.exceptions.insert(
        "img.net".to_string(),
        Exception {
            global: false,
            domains: vec!["news.com".to_string()],
        },
    );
    let report = sync.sync(&next, Some(&config)).await;
    assert_eq!(report.families.len(), 1);
    assert_eq!(host.rules_in(RuleFamily::Exceptions).len(), 2);
    assert_eq!(host.rules_in(RuleFamily::CustomFilters), before_custom);
}

fn lists() -> StaticListSource {
    StaticListSource::new()
        .with_list(ADS, "||ads.com^\nnews.com##.sponsored")
        .with_list(TRACKING, "||tracker.com^")
}

#[tokio::test]
async fn readers_keep_a_whole_engine_across_reloads() {
    let bus = ConfigBus::new(Config {
        block_trackers: false,
        ..Default::default()
    });
    let registry = EngineRegistry::new(Arc::new(MemoryStore::new()), Arc::new(lists()), None);
    let main = MainEngine::new(Arc::new(registry), bus.clone());
    main.setup().await.unwrap();

    let before = main.engine();
    bus.update(|c| c.block_trackers = true);
    main.reload_main_engine().await.unwrap();
    let after = main.engine();

    let tracker = Request::new("https://tracker.com/t.js", Some("https://site.com"), "script");
    assert_eq!(before.list_names(), vec![ADS]);
    assert_eq!(before.match_request(&tracker).decision, MatchDecision::Allow);
    assert_eq!(after.list_names(), vec![ADS, TRACKING]);
    assert_eq!(after.match_request(&tracker).decision, MatchDecision::Block);
}

#[tokio::test]
async fn failed_engines_are_left_out_of_main() {
    let mut config = Config::default();
    config.block_annoyances = true;
    config.regional_filters.enabled = true;
    config.regional_filters.regions = vec!["xx".to_string()];

    let store = Arc::new(MemoryStore::new());
    store.save(ADS, b"not a snapshot").await.unwrap();
    // ads: corrupt snapshot, rebuilt from text; annoyances and lang-xx: nowhere
    let registry = EngineRegistry::new(store, Arc::new(lists()), None);
    let main = MainEngine::new(Arc::new(registry), ConfigBus::new(config));

    let reload = main.reload_main_engine().await.unwrap();
    assert_eq!(
        reload,
        Reload::Published {
            generation: 1,
            engines: vec![ADS.to_string(), TRACKING.to_string()],
        }
    );
    assert_eq!(main.engine().list_names(), vec![ADS, TRACKING]);

    let nothing = EngineRegistry::new(
        Arc::new(MemoryStore::new()),
        Arc::new(StaticListSource::new()),
        None,
    );
    let main = MainEngine::new(Arc::new(nothing), ConfigBus::new(Config::default()));
    main.reload_main_engine().await.unwrap();
    assert!(main.engine().is_empty());
}

#[test]
fn restricted_scriptlets_need_trust() {
    let text = "example.com##+js(set-constant, a, 1)\n\
                example.com##+js(trusted-set-cookie, a, b)\n\
                example.com##+js(rpnt.js, x, y)";

    let (report, engine) = custom_filters::compile(text, false);
    assert_eq!(report.cosmetic_filters, 1);
    assert_eq!(report.errors.iter().map(|e| e.line).collect::<Vec<_>>(), vec![2, 3]);
    let cosmetics = engine.match_cosmetics(&CosmeticQuery::bootstrap("https://example.com/"));
    assert_eq!(cosmetics.scriptlets.len(), 1);

    let (report, engine) = custom_filters::compile(text, true);
    assert_eq!(report.cosmetic_filters, 3);
    assert!(report.errors.is_empty());
    let cosmetics = engine.match_cosmetics(&CosmeticQuery::bootstrap("https://example.com/"));
    assert_eq!(cosmetics.scriptlets.len(), 3);
}

#[test]
fn exceptions_apply_only_on_their_domains() {
    let db = StaticTrackerDb::new().with_tracker(
        "acme",
        &["acme-metrics.com"],
        &["||acme-metrics.com^"],
    );
    let mut config = Config::default();
    config.exceptions.insert(
        "acme".to_string(),
        Exception {
            global: false,
            domains: vec!["a.com".to_string()],
        },
    );

    let from_a =
        Request::new("https://acme-metrics.com/t.js", Some("https://www.a.com/"), "script");
    let from_b = Request::new("https://acme-metrics.com/t.js", Some("https://b.com/"), "script");
    assert!(is_trusted(&config, &db, &from_a, 0));
    assert!(!is_trusted(&config, &db, &from_b, 0));

    let rules = exception_rules(&config, &db);
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].condition.url_filter.as_deref(), Some("||acme-metrics.com^"));
    assert_eq!(rules[0].condition.initiator_domains, Some(vec!["a.com".to_string()]));
}

#[tokio::test]
async fn expired_global_pause_is_removed_with_its_rule() {
    let bus = ConfigBus::new(Config::default());
    let host = Arc::new(MemoryHost::new());
    let sync = RuleSynchronizer::new(host.clone(), Arc::new(NoTrackerDb), None);
    let alarms = Arc::new(MemoryAlarms::new());
    let controller = PauseController::new(bus.clone(), alarms.clone());

    let revoke_at = now_ms() + 60 * 60 * 1000;
    controller.pause(GLOBAL_PAUSE_ID, Some(revoke_at));
    controller.reconcile(now_ms()).await.unwrap();
    assert_eq!(alarms.when(&alarm_name(GLOBAL_PAUSE_ID)), Some(revoke_at));

    let paused = bus.current();
    sync.sync(&paused, None).await;
    assert_eq!(host.rules_in(RuleFamily::Pause).len(), 1);

    // the alarm fires a second after the deadline
    assert!(controller
        .on_alarm(&alarm_name(GLOBAL_PAUSE_ID), revoke_at + 1000)
        .await
        .unwrap());
    let resumed = bus.current();
    assert!(resumed.paused.is_empty());
    assert!(alarms.names().await.unwrap().is_empty());

    let report = sync.sync(&resumed, Some(&*paused)).await;
    assert_eq!(report.family(RuleFamily::Pause).map(|f| f.removed), Some(1));
    assert!(host.rules_in(RuleFamily::Pause).is_empty());
}

#[tokio::test]
async fn ads_only_config_publishes_the_ads_engine() {
    let config = Config {
        block_ads: true,
        block_trackers: false,
        block_annoyances: false,
        ..Default::default()
    };
    assert!(!config.custom_filters.enabled);
    assert_eq!(enabled_engine_ids(&config), vec![ADS]);

    let registry = Arc::new(EngineRegistry::new(
        Arc::new(MemoryStore::new()),
        Arc::new(lists()),
        None,
    ));
    let main = MainEngine::new(Arc::clone(&registry), ConfigBus::new(config));
    main.setup().await.unwrap();

    let ads = registry.get(ADS).unwrap();
    let published = main.engine();
    assert_eq!(published.list_names(), vec![ADS]);
    assert_eq!(published.stats(), ads.stats());
    let request = Request::new("https://ads.com/banner.png", Some("https://news.com"), "image");
    assert_eq!(
        published.match_request(&request).decision,
        ads.match_request(&request).decision
    );
}

#[test]
fn custom_filter_report_points_at_the_bad_line() {
    let text = "example.com##.banner\nexample.com##+js(trusted-replace-node-text, a, b)";
    let (report, _) = custom_filters::compile(text, false);
    assert_eq!(report.cosmetic_filters, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].line, 2);
}

/// Serves lists only once the gate opens.
struct GatedSource {
    inner: StaticListSource,
    entered: Notify,
    gate: Semaphore,
}

#[async_trait]
impl ListSource for GatedSource {
    async fn fetch_bytes(&self, path: &str) -> veil_core::Result<Vec<u8>> {
        if path == list_file(ADS) {
            self.entered.notify_one();
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        self.inner.fetch_bytes(path).await
    }
}

#[tokio::test]
async fn reload_during_reload_is_coalesced() {
    let source = Arc::new(GatedSource {
        inner: lists(),
        entered: Notify::new(),
        gate: Semaphore::new(0),
    });
    let bus = ConfigBus::new(Config {
        block_trackers: false,
        ..Default::default()
    });
    let registry = EngineRegistry::new(Arc::new(MemoryStore::new()), source.clone(), None);
    let main = Arc::new(MainEngine::new(Arc::new(registry), bus.clone()));

    let first = tokio::spawn({
        let main = Arc::clone(&main);
        async move { main.reload_main_engine().await }
    });
    source.entered.notified().await;

    bus.update(|c| c.block_trackers = true);
    assert_eq!(main.reload_main_engine().await.unwrap(), Reload::Coalesced);

    source.gate.add_permits(8);
    let reload = first.await.unwrap().unwrap();
    assert_eq!(
        reload,
        Reload::Published {
            generation: 2,
            engines: vec![ADS.to_string(), TRACKING.to_string()],
        }
    );
    assert_eq!(main.generation(), 2);
}
