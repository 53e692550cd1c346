//! Declarative rule synchronizer
//!
//! Maps a `(current, previous)` configuration pair onto host rule updates.
//! Each family is recomputed only when its slice of the configuration
//! changed, and is then replaced in one host call that removes its whole id
//! range before adding the new rules. Rules the host rejects are dropped one
//! by one and the rest is resubmitted.
//!
//! A failing step never stops the others. It is reported, remembered, and
//! retried on the next sync whatever the configuration delta.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::fixes::{load_fixes, FIXES_RULESET};
use super::safe_mode::safe_mode_rules;
use super::{ConversionError, DeclarativeHost, HostError, Rule, RuleFamily};
use crate::config::Config;
use crate::custom_filters::custom_filter_rules;
use crate::engines::enabled_engine_ids;
use crate::error::{Error, Result};
use crate::exceptions::exception_rules;
use crate::now_ms;
use crate::pause::pause_rules;
use crate::redirect::redirect_protection_rules;
use crate::sources::ListSource;
use crate::trust::{trusted_domain_rules, TrackerDb};

/// Families recomputed from configuration.
const CONFIG_FAMILIES: [RuleFamily; 7] = [
    RuleFamily::Pause,
    RuleFamily::TrustedDomains,
    RuleFamily::RedirectProtection,
    RuleFamily::SafeMode,
    RuleFamily::Exceptions,
    RuleFamily::CustomFilters,
    RuleFamily::Fixes,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulesetDelta {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRule {
    pub rule: Rule,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyReport {
    pub family: RuleFamily,
    pub removed: usize,
    pub added: usize,
    pub rejected: Vec<RejectedRule>,
}

/// One unit of host work within a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Rulesets,
    Family(RuleFamily),
}

/// A step the host refused; it is retried on the next sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub step: SyncStep,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub rulesets: Option<RulesetDelta>,
    pub families: Vec<FamilyReport>,
    pub failures: Vec<SyncFailure>,
    /// Custom filters with no declarative form
    pub conversion_errors: Vec<ConversionError>,
    /// Fixes dropped during validation
    pub fixes_dropped: Vec<String>,
}

impl SyncReport {
    /// Whether the host was asked to change anything.
    pub fn is_empty(&self) -> bool {
        self.rulesets.is_none() && self.families.is_empty() && self.failures.is_empty()
    }

    pub fn family(&self, family: RuleFamily) -> Option<&FamilyReport> {
        self.families.iter().find(|f| f.family == family)
    }

    fn fail(&mut self, step: SyncStep, error: &Error) {
        log::warn!("declarative sync: {step:?} failed: {error}");
        self.failures.push(SyncFailure {
            step,
            reason: error.to_string(),
        });
    }
}

/// Steps that failed and are owed to the host.
#[derive(Debug, Default)]
struct Pending {
    rulesets: bool,
    families: BTreeSet<RuleFamily>,
}

pub struct RuleSynchronizer {
    host: Arc<dyn DeclarativeHost>,
    trackers: Arc<dyn TrackerDb>,
    fixes: Option<Arc<dyn ListSource>>,
    degraded: AtomicBool,
    pending: Mutex<Pending>,
    /// Tracker metadata version the installed exceptions were built from
    tracker_version: Mutex<Option<u64>>,
}

impl RuleSynchronizer {
    pub fn new(
        host: Arc<dyn DeclarativeHost>,
        trackers: Arc<dyn TrackerDb>,
        fixes: Option<Arc<dyn ListSource>>,
    ) -> Self {
        Self {
            host,
            trackers,
            fixes,
            degraded: AtomicBool::new(false),
            pending: Mutex::new(Pending::default()),
            tracker_version: Mutex::new(None),
        }
    }

    /// True while the bundled fixes stand in for the remote ones.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Whether an earlier step failed and is waiting for a retry.
    pub fn has_pending(&self) -> bool {
        let pending = self.lock_pending();
        pending.rulesets || !pending.families.is_empty()
    }

    /// Bring the host in line with `current`. Without `previous` every
    /// family is resubmitted. Failed steps are reported in the result and
    /// retried next time.
    pub async fn sync(&self, current: &Config, previous: Option<&Config>) -> SyncReport {
        let owed = std::mem::take(&mut *self.lock_pending());
        let mut report = SyncReport::default();

        let engines_changed =
            previous.map_or(true, |p| enabled_engine_ids(p) != enabled_engine_ids(current));
        if engines_changed || owed.rulesets {
            match self.sync_rulesets(current).await {
                Ok(delta) => report.rulesets = delta,
                Err(e) => {
                    self.lock_pending().rulesets = true;
                    report.fail(SyncStep::Rulesets, &e);
                }
            }
        }

        for family in CONFIG_FAMILIES {
            let due = previous.map_or(true, |p| slice_changed(family, current, p))
                || owed.families.contains(&family)
                || (family == RuleFamily::Exceptions && self.trackers_moved());
            if !due {
                continue;
            }
            if let Err(e) = self.sync_family(family, current, &mut report).await {
                self.lock_pending().families.insert(family);
                report.fail(SyncStep::Family(family), &e);
            }
        }

        if !report.is_empty() {
            log::debug!(
                "declarative rules synchronized: {} families, {} failures",
                report.families.len(),
                report.failures.len()
            );
        }
        report
    }

    /// Tracker metadata may have changed: rebuild the exceptions family when
    /// its version moved or an earlier attempt is still owed.
    pub async fn on_tracker_metadata_changed(
        &self,
        config: &Config,
    ) -> Result<Option<FamilyReport>> {
        let owed = self.lock_pending().families.contains(&RuleFamily::Exceptions);
        if !owed && !self.trackers_moved() {
            return Ok(None);
        }
        let version = self.trackers.version();
        let rules = self.family_rules(RuleFamily::Exceptions, config);
        match self.replace_family(RuleFamily::Exceptions, rules).await {
            Ok(report) => {
                self.lock_pending().families.remove(&RuleFamily::Exceptions);
                *self.lock_tracker_version() = Some(version);
                log::info!("exceptions rebuilt for tracker metadata v{version}");
                Ok(Some(report))
            }
            Err(e) => {
                self.lock_pending().families.insert(RuleFamily::Exceptions);
                Err(e)
            }
        }
    }

    async fn sync_family(
        &self,
        family: RuleFamily,
        config: &Config,
        report: &mut SyncReport,
    ) -> Result<()> {
        let version = self.trackers.version();
        let rules = match family {
            RuleFamily::CustomFilters => {
                let (rules, errors) = custom_filter_rules(config);
                report.conversion_errors = errors;
                rules
            }
            RuleFamily::Fixes => match self.fixes_rules().await? {
                Some((rules, dropped)) => {
                    report.fixes_dropped = dropped;
                    rules
                }
                None => Vec::new(),
            },
            family => self.family_rules(family, config),
        };
        report.families.push(self.replace_family(family, rules).await?);
        if family == RuleFamily::Exceptions {
            *self.lock_tracker_version() = Some(version);
        }
        Ok(())
    }

    fn trackers_moved(&self) -> bool {
        *self.lock_tracker_version() != Some(self.trackers.version())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tracker_version(&self) -> std::sync::MutexGuard<'_, Option<u64>> {
        self.tracker_version.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn family_rules(&self, family: RuleFamily, config: &Config) -> Vec<Rule> {
        match family {
            RuleFamily::Pause => pause_rules(config, now_ms()),
            RuleFamily::TrustedDomains => trusted_domain_rules(config),
            RuleFamily::RedirectProtection => redirect_protection_rules(config),
            RuleFamily::SafeMode => safe_mode_rules(&config.safe_mode),
            RuleFamily::Exceptions => exception_rules(config, self.trackers.as_ref()),
            RuleFamily::CustomFilters => custom_filter_rules(config).0,
            RuleFamily::Fixes | RuleFamily::RedirectAllowOnce => Vec::new(),
        }
    }

    async fn sync_rulesets(&self, config: &Config) -> Result<Option<RulesetDelta>> {
        let available: BTreeSet<String> =
            self.host.available_rulesets().await?.into_iter().collect();
        let enabled: BTreeSet<String> = self.host.enabled_rulesets().await?.into_iter().collect();
        let desired: BTreeSet<String> = enabled_engine_ids(config)
            .into_iter()
            .filter(|id| available.contains(id))
            .collect();

        let delta = RulesetDelta {
            enabled: desired.difference(&enabled).cloned().collect(),
            disabled: enabled
                .difference(&desired)
                .filter(|id| id.as_str() != FIXES_RULESET)
                .cloned()
                .collect(),
        };
        if delta.enabled.is_empty() && delta.disabled.is_empty() {
            return Ok(None);
        }

        log::info!("rulesets: enable {:?}, disable {:?}", delta.enabled, delta.disabled);
        self.host
            .update_enabled_rulesets(delta.enabled.clone(), delta.disabled.clone())
            .await?;
        Ok(Some(delta))
    }

    /// Remote fixes, or `None` after switching to the bundled ruleset.
    async fn fixes_rules(&self) -> Result<Option<(Vec<Rule>, Vec<String>)>> {
        let loaded = match &self.fixes {
            Some(source) => load_fixes(source.as_ref(), self.host.as_ref()).await,
            None => Err(Error::Fetch {
                resource: FIXES_RULESET.to_string(),
                reason: "no remote source".to_string(),
            }),
        };

        let enabled = self.host.enabled_rulesets().await?;
        let fallback_on = enabled.iter().any(|id| id == FIXES_RULESET);
        match loaded {
            Ok(load) => {
                if fallback_on {
                    self.host
                        .update_enabled_rulesets(Vec::new(), vec![FIXES_RULESET.to_string()])
                        .await?;
                }
                if self.degraded.swap(false, Ordering::AcqRel) {
                    log::info!("remote fixes available again");
                }
                Ok(Some((load.rules, load.dropped)))
            }
            Err(e) => {
                log::warn!("remote fixes unavailable, using bundled ruleset: {e}");
                if !fallback_on {
                    self.host
                        .update_enabled_rulesets(vec![FIXES_RULESET.to_string()], Vec::new())
                        .await?;
                }
                self.degraded.store(self.fixes.is_some(), Ordering::Release);
                Ok(None)
            }
        }
    }

    /// Replace `family` with `rules` in one host call.
    pub async fn replace_family(
        &self,
        family: RuleFamily,
        rules: Vec<Rule>,
    ) -> Result<FamilyReport> {
        let mut pending = family.assign(rules)?;
        let existing = if family.is_session() {
            self.host.session_rules().await?
        } else {
            self.host.dynamic_rules().await?
        };
        let remove_ids: Vec<u32> = existing
            .iter()
            .map(|r| r.id)
            .filter(|&id| family.contains(id))
            .collect();

        let mut rejected = Vec::new();
        loop {
            let submitted = if family.is_session() {
                self.host.update_session_rules(remove_ids.clone(), pending.clone()).await
            } else {
                self.host.update_dynamic_rules(remove_ids.clone(), pending.clone()).await
            };
            match submitted {
                Ok(()) => break,
                Err(HostError::Rejected { ids, reason }) => {
                    let (bad, good): (Vec<Rule>, Vec<Rule>) =
                        pending.into_iter().partition(|r| ids.contains(&r.id));
                    if bad.is_empty() {
                        return Err(HostError::Rejected { ids, reason }.into());
                    }
                    log::warn!("{family:?}: host rejected {} rules: {reason}", bad.len());
                    rejected.extend(bad.into_iter().map(|rule| RejectedRule {
                        rule,
                        reason: reason.clone(),
                    }));
                    pending = good;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(FamilyReport {
            family,
            removed: remove_ids.len(),
            added: pending.len(),
            rejected,
        })
    }
}

fn slice_changed(family: RuleFamily, current: &Config, previous: &Config) -> bool {
    match family {
        RuleFamily::Pause => current.paused != previous.paused,
        RuleFamily::TrustedDomains => {
            current.managed.trusted_domains != previous.managed.trusted_domains
        }
        RuleFamily::RedirectProtection => {
            current.redirect_protection != previous.redirect_protection
        }
        RuleFamily::SafeMode => current.safe_mode != previous.safe_mode,
        RuleFamily::Exceptions => current.exceptions != previous.exceptions,
        RuleFamily::CustomFilters => {
            current.custom_filters != previous.custom_filters
                || current.managed.custom_filters != previous.managed.custom_filters
        }
        RuleFamily::Fixes => current.filters_updated_at != previous.filters_updated_at,
        RuleFamily::RedirectAllowOnce => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Exception, PausedEntry, GLOBAL_PAUSE_ID};
    use crate::dnr::ActionType;
    use crate::sources::{StaticListSource, FIXES_FILE};
    use crate::testing::{MemoryHost, MemoryTrackers};
    use crate::trust::{NoTrackerDb, StaticTrackerDb};

    fn synchronizer(host: Arc<MemoryHost>, fixes: Option<StaticListSource>) -> RuleSynchronizer {
        RuleSynchronizer::new(
            host,
            Arc::new(NoTrackerDb),
            fixes.map(|f| Arc::new(f) as Arc<dyn ListSource>),
        )
    }

    fn fixes_source() -> StaticListSource {
        StaticListSource::new().with_file(
            FIXES_FILE,
            r#"[{"id": 9, "priority": 1, "action": {"type": "block"},
                "condition": {"urlFilter": "||fix.com^"}}]"#,
        )
    }

    #[tokio::test]
    async fn rulesets_follow_enabled_engines() {
        let rulesets = ["ads", "tracking", "annoyances", "fixes"];
        let host = Arc::new(MemoryHost::new().with_rulesets(&rulesets));
        let sync = synchronizer(host.clone(), Some(fixes_source()));

        let config = Config::default();
        let report = sync.sync(&config, None).await;
        assert_eq!(
            report.rulesets,
            Some(RulesetDelta {
                enabled: vec!["ads".to_string(), "tracking".to_string()],
                disabled: vec![],
            })
        );

        let mut next = config.clone();
        next.block_trackers = false;
        next.block_annoyances = true;
        let report = sync.sync(&next, Some(&config)).await;
        assert_eq!(
            report.rulesets,
            Some(RulesetDelta {
                enabled: vec!["annoyances".to_string()],
                disabled: vec!["tracking".to_string()],
            })
        );
        assert!(report.families.is_empty());
    }

    #[tokio::test]
    async fn family_replacement_removes_previous_range() {
        let host = Arc::new(MemoryHost::new());
        let sync = synchronizer(host.clone(), Some(fixes_source()));

        let mut config = Config::default();
        config.exceptions.insert(
            "a.com".to_string(),
            Exception {
                global: true,
                domains: vec![],
            },
        );
        config.exceptions.insert(
            "b.com".to_string(),
            Exception {
                global: true,
                domains: vec![],
            },
        );
        sync.sync(&config, None).await;
        assert_eq!(host.rules_in(RuleFamily::Exceptions).len(), 2);

        let mut next = config.clone();
        next.exceptions.remove("b.com");
        let report = sync.sync(&next, Some(&config)).await;
        let family = report.family(RuleFamily::Exceptions).unwrap();
        assert_eq!((family.removed, family.added), (2, 1));
        assert_eq!(host.rules_in(RuleFamily::Exceptions).len(), 1);
        assert_eq!(host.rules_in(RuleFamily::Fixes).len(), 1);
        assert_eq!(report.families.len(), 1);
    }

    #[tokio::test]
    async fn rejected_rules_are_dropped_and_reported() {
        let host = Arc::new(MemoryHost::new().with_rejected_url_filter("||bad.com^"));
        let sync = synchronizer(host.clone(), Some(fixes_source()));

        let mut config = Config::default();
        config.custom_filters.enabled = true;
        config.custom_filters.text = "||good.com^\n||bad.com^\n||fine.com^".to_string();
        let report = sync.sync(&config, None).await;

        let family = report.family(RuleFamily::CustomFilters).unwrap();
        assert_eq!(family.added, 2);
        assert_eq!(family.rejected.len(), 1);
        assert_eq!(family.rejected[0].rule.condition.url_filter.as_deref(), Some("||bad.com^"));
        assert_eq!(host.rules_in(RuleFamily::CustomFilters).len(), 2);
    }

    #[tokio::test]
    async fn fixes_fall_back_to_bundled_ruleset() {
        let host = Arc::new(MemoryHost::new().with_rulesets(&["fixes"]));
        let broken = StaticListSource::new().with_file(FIXES_FILE, "<html>");
        let sync = synchronizer(host.clone(), Some(broken));

        let config = Config::default();
        sync.sync(&config, None).await;
        assert!(sync.is_degraded());
        assert!(host.enabled_rulesets().await.unwrap().contains(&FIXES_RULESET.to_string()));
        assert!(host.rules_in(RuleFamily::Fixes).is_empty());

        // unchanged update window: no retry
        let report = sync.sync(&config, Some(&config)).await;
        assert!(report.is_empty());
        assert!(sync.is_degraded());
    }

    #[tokio::test]
    async fn recovered_fixes_disable_the_fallback() {
        let host = Arc::new(MemoryHost::new().with_rulesets(&["fixes"]));
        host.update_enabled_rulesets(vec![FIXES_RULESET.to_string()], vec![])
            .await
            .unwrap();
        let sync = synchronizer(host.clone(), Some(fixes_source()));

        sync.sync(&Config::default(), None).await;
        assert!(!sync.is_degraded());
        assert!(host.enabled_rulesets().await.unwrap().is_empty());
        assert_eq!(host.rules_in(RuleFamily::Fixes).len(), 1);
    }

    #[tokio::test]
    async fn pause_and_safe_mode_families() {
        let host = Arc::new(MemoryHost::new());
        let sync = synchronizer(host.clone(), None);

        let mut config = Config::default();
        config
            .paused
            .insert(GLOBAL_PAUSE_ID.to_string(), PausedEntry { revoke_at: None });
        config.safe_mode.enabled = true;
        config.safe_mode.denylist = vec!["evil.com".to_string()];
        sync.sync(&config, None).await;

        let pause = host.rules_in(RuleFamily::Pause);
        assert_eq!(pause.len(), 1);
        assert_eq!(pause[0].action.kind, ActionType::AllowAllRequests);
        assert_eq!(host.rules_in(RuleFamily::SafeMode).len(), 2);
    }

    #[tokio::test]
    async fn trusted_domains_family() {
        let host = Arc::new(MemoryHost::new());
        let sync = synchronizer(host.clone(), None);

        let config = Config::default();
        sync.sync(&config, None).await;
        assert!(host.rules_in(RuleFamily::TrustedDomains).is_empty());

        let mut next = config.clone();
        next.managed.trusted_domains = vec!["intranet.corp".to_string()];
        let report = sync.sync(&next, Some(&config)).await;
        assert_eq!(report.families.len(), 1);

        let trusted = host.rules_in(RuleFamily::TrustedDomains);
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].action.kind, ActionType::AllowAllRequests);
        assert_eq!(
            trusted[0].condition.request_domains,
            Some(vec!["intranet.corp".to_string()])
        );
    }

    #[tokio::test]
    async fn failed_family_is_retried_on_next_sync() {
        let host = Arc::new(MemoryHost::new());
        let sync = synchronizer(host.clone(), None);

        let config = Config::default();
        sync.sync(&config, None).await;

        let mut next = config.clone();
        next.exceptions.insert(
            "cdn.com".to_string(),
            Exception {
                global: true,
                domains: vec![],
            },
        );
        next.custom_filters.enabled = true;
        next.custom_filters.text = "||custom.com^".to_string();
        host.fail_next_updates(1);
        let report = sync.sync(&next, Some(&config)).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, SyncStep::Family(RuleFamily::Exceptions));
        assert!(host.rules_in(RuleFamily::Exceptions).is_empty());
        // later families still went through
        assert_eq!(host.rules_in(RuleFamily::CustomFilters).len(), 1);
        assert!(sync.has_pending());

        // an unrelated toggle is enough to deliver the owed family
        let mut toggled = next.clone();
        toggled.block_annoyances = !toggled.block_annoyances;
        let report = sync.sync(&toggled, Some(&next)).await;
        assert!(report.failures.is_empty());
        assert!(report.family(RuleFamily::Exceptions).is_some());
        assert_eq!(host.rules_in(RuleFamily::Exceptions).len(), 1);
        assert!(!sync.has_pending());
    }

    #[tokio::test]
    async fn tracker_metadata_change_rebuilds_exceptions() {
        let host = Arc::new(MemoryHost::new());
        let trackers = Arc::new(MemoryTrackers::new(
            StaticTrackerDb::new().with_tracker("t", &["t.com"], &["||t.com^"]),
        ));
        let sync = RuleSynchronizer::new(host.clone(), trackers.clone(), None);

        let mut config = Config::default();
        config.exceptions.insert(
            "t".to_string(),
            Exception {
                global: true,
                domains: vec![],
            },
        );
        sync.sync(&config, None).await;
        assert_eq!(host.rules_in(RuleFamily::Exceptions).len(), 1);

        // nothing moved
        assert_eq!(sync.on_tracker_metadata_changed(&config).await.unwrap(), None);

        trackers.replace(
            StaticTrackerDb::new().with_tracker("t", &["t.com"], &["||t.com^", "||t-cdn.net^"]),
        );
        let report = sync.on_tracker_metadata_changed(&config).await.unwrap().unwrap();
        assert_eq!((report.removed, report.added), (1, 2));
        let filters: Vec<_> = host
            .rules_in(RuleFamily::Exceptions)
            .into_iter()
            .filter_map(|rule| rule.condition.url_filter)
            .collect();
        assert!(filters.contains(&"||t-cdn.net^".to_string()));
        assert_eq!(sync.on_tracker_metadata_changed(&config).await.unwrap(), None);

        // a config sync also notices a newer version
        trackers.replace(StaticTrackerDb::new().with_tracker("t", &["t.com"], &["||t.org^"]));
        let report = sync.sync(&config, Some(&config)).await;
        assert_eq!(report.family(RuleFamily::Exceptions).map(|f| f.added), Some(1));
        let rules = host.rules_in(RuleFamily::Exceptions);
        assert_eq!(rules[0].condition.url_filter.as_deref(), Some("||t.org^"));
    }
}
