//! In-memory host fakes for tests and offline tooling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::dnr::{DeclarativeHost, HostError, Rule, RuleFamily};
use crate::error::Result;
use crate::pause::Alarms;
use crate::trust::{StaticTrackerDb, TrackerDb};

#[derive(Default)]
struct HostState {
    dynamic: BTreeMap<u32, Rule>,
    session: BTreeMap<u32, Rule>,
    enabled: BTreeSet<String>,
}

/// Declarative host that keeps rules in memory and counts every call.
#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<HostState>,
    available: Vec<String>,
    unsupported_regexes: Vec<String>,
    rejected_url_filters: Vec<String>,
    calls: AtomicUsize,
    failing_updates: AtomicUsize,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rulesets(mut self, ids: &[&str]) -> Self {
        self.available = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn with_unsupported_regex(mut self, regex: &str) -> Self {
        self.unsupported_regexes.push(regex.to_string());
        self
    }

    /// Rules with this `urlFilter` are refused on submission.
    pub fn with_rejected_url_filter(mut self, url_filter: &str) -> Self {
        self.rejected_url_filters.push(url_filter.to_string());
        self
    }

    /// The next `n` rule updates fail as if the host were unavailable.
    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    /// Host API calls so far, queries included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Dynamic or session rules currently installed for `family`.
    pub fn rules_in(&self, family: RuleFamily) -> Vec<Rule> {
        let state = self.lock();
        let rules = if family.is_session() {
            &state.session
        } else {
            &state.dynamic
        };
        rules.range(family.range()).map(|(_, rule)| rule.clone()).collect()
    }

    pub fn dynamic_rule_ids(&self) -> Vec<u32> {
        self.lock().dynamic.keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), HostError> {
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Err(HostError::Failed("host unavailable".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn apply(
        &self,
        rules: &mut BTreeMap<u32, Rule>,
        remove_ids: Vec<u32>,
        add: Vec<Rule>,
    ) -> Result<(), HostError> {
        let rejected: Vec<u32> = add
            .iter()
            .filter(|rule| {
                rule.condition
                    .url_filter
                    .as_ref()
                    .is_some_and(|f| self.rejected_url_filters.contains(f))
            })
            .map(|rule| rule.id)
            .collect();
        if !rejected.is_empty() {
            return Err(HostError::Rejected {
                ids: rejected,
                reason: "unsupported rule".to_string(),
            });
        }

        let mut next = rules.clone();
        for id in remove_ids {
            next.remove(&id);
        }
        for rule in add {
            if next.contains_key(&rule.id) {
                return Err(HostError::Failed(format!("duplicate rule id {}", rule.id)));
            }
            next.insert(rule.id, rule);
        }
        *rules = next;
        Ok(())
    }
}

#[async_trait]
impl DeclarativeHost for MemoryHost {
    async fn dynamic_rules(&self) -> Result<Vec<Rule>, HostError> {
        self.count();
        Ok(self.lock().dynamic.values().cloned().collect())
    }

    async fn update_dynamic_rules(
        &self,
        remove_ids: Vec<u32>,
        add: Vec<Rule>,
    ) -> Result<(), HostError> {
        self.count();
        self.take_failure()?;
        let mut state = self.lock();
        self.apply(&mut state.dynamic, remove_ids, add)
    }

    async fn session_rules(&self) -> Result<Vec<Rule>, HostError> {
        self.count();
        Ok(self.lock().session.values().cloned().collect())
    }

    async fn update_session_rules(
        &self,
        remove_ids: Vec<u32>,
        add: Vec<Rule>,
    ) -> Result<(), HostError> {
        self.count();
        self.take_failure()?;
        let mut state = self.lock();
        self.apply(&mut state.session, remove_ids, add)
    }

    async fn enabled_rulesets(&self) -> Result<Vec<String>, HostError> {
        self.count();
        Ok(self.lock().enabled.iter().cloned().collect())
    }

    async fn update_enabled_rulesets(
        &self,
        enable: Vec<String>,
        disable: Vec<String>,
    ) -> Result<(), HostError> {
        self.count();
        let mut state = self.lock();
        for id in disable {
            state.enabled.remove(&id);
        }
        state.enabled.extend(enable);
        Ok(())
    }

    async fn available_rulesets(&self) -> Result<Vec<String>, HostError> {
        self.count();
        Ok(self.available.clone())
    }

    async fn is_regex_supported(&self, regex: &str) -> bool {
        self.count();
        !self.unsupported_regexes.iter().any(|r| r == regex)
    }
}

/// Alarms kept in memory.
#[derive(Default)]
pub struct MemoryAlarms {
    alarms: Mutex<BTreeMap<String, u64>>,
}

impl MemoryAlarms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(&self, name: &str) -> Option<u64> {
        self.alarms.lock().unwrap_or_else(|e| e.into_inner()).get(name).copied()
    }
}

#[async_trait]
impl Alarms for MemoryAlarms {
    async fn create(&self, name: &str, when_ms: u64) -> Result<()> {
        self.alarms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), when_ms);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<()> {
        self.alarms.lock().unwrap_or_else(|e| e.into_inner()).remove(name);
        Ok(())
    }

    async fn names(&self) -> Result<Vec<String>> {
        Ok(self
            .alarms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}

/// Tracker metadata that can be swapped while shared.
#[derive(Default)]
pub struct MemoryTrackers {
    db: RwLock<StaticTrackerDb>,
    version: AtomicU64,
}

impl MemoryTrackers {
    pub fn new(db: StaticTrackerDb) -> Self {
        Self {
            db: RwLock::new(db),
            version: AtomicU64::new(1),
        }
    }

    /// Swap in new metadata and bump the version.
    pub fn replace(&self, db: StaticTrackerDb) {
        *self.db.write().unwrap_or_else(|e| e.into_inner()) = db;
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StaticTrackerDb> {
        self.db.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl TrackerDb for MemoryTrackers {
    fn filters_for(&self, id: &str) -> Option<Vec<String>> {
        self.read().filters_for(id)
    }

    fn tracker_for_request(&self, url: &str) -> Option<String> {
        self.read().tracker_for_request(url)
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
