//! Pause controller
//!
//! Paused hostnames (or everything, under [`GLOBAL_PAUSE_ID`]) are exempt
//! from filtering until their `revokeAt`. Each timed pause has a durable host
//! alarm; when it fires the expired entry is removed from configuration and
//! the rule synchronizer follows.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::ConfigBus;
use crate::config::{Config, PausedEntry, GLOBAL_PAUSE_ID};
use crate::dnr::{document_types, priority, ActionType, Rule, RuleAction, RuleCondition};
use crate::error::Result;

pub const ALARM_PREFIX: &str = "pause:";

pub fn alarm_name(key: &str) -> String {
    format!("{ALARM_PREFIX}{key}")
}

/// Host alarms that survive restarts.
#[async_trait]
pub trait Alarms: Send + Sync {
    /// Creating an existing alarm replaces it.
    async fn create(&self, name: &str, when_ms: u64) -> Result<()>;

    async fn clear(&self, name: &str) -> Result<()>;

    async fn names(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pause keys removed because they expired
    pub expired: Vec<String>,
    pub alarms: usize,
}

pub struct PauseController {
    bus: ConfigBus,
    alarms: Arc<dyn Alarms>,
}

impl PauseController {
    pub fn new(bus: ConfigBus, alarms: Arc<dyn Alarms>) -> Self {
        Self { bus, alarms }
    }

    /// Pause `hostname`, or everything for [`GLOBAL_PAUSE_ID`].
    pub fn pause(&self, hostname: &str, revoke_at: Option<u64>) -> bool {
        let key = normalize_key(hostname);
        self.bus.update(|c| {
            c.paused.insert(key, PausedEntry { revoke_at });
        })
    }

    pub fn resume(&self, hostname: &str) -> bool {
        let key = normalize_key(hostname);
        self.bus.update(|c| {
            c.paused.remove(&key);
        })
    }

    /// Drop expired entries and line the alarms up with what remains.
    pub async fn reconcile(&self, now: u64) -> Result<ReconcileReport> {
        let config = self.bus.current();
        let expired: Vec<String> = config
            .paused
            .iter()
            .filter(|(_, entry)| !entry.is_active(now))
            .map(|(key, _)| key.clone())
            .collect();
        if !expired.is_empty() {
            log::info!("pause expired for {expired:?}");
            self.bus.update(|c| {
                for key in &expired {
                    c.paused.remove(key);
                }
            });
        }

        let config = self.bus.current();
        let desired: Vec<(String, u64)> = config
            .paused
            .iter()
            .filter_map(|(key, entry)| entry.revoke_at.map(|at| (alarm_name(key), at)))
            .collect();
        let wanted: BTreeSet<&str> = desired.iter().map(|(name, _)| name.as_str()).collect();

        for name in self.alarms.names().await? {
            if name.starts_with(ALARM_PREFIX) && !wanted.contains(name.as_str()) {
                self.alarms.clear(&name).await?;
            }
        }
        for (name, at) in &desired {
            self.alarms.create(name, *at).await?;
        }

        Ok(ReconcileReport {
            expired,
            alarms: desired.len(),
        })
    }

    /// Returns whether the alarm belonged to the pause controller.
    pub async fn on_alarm(&self, name: &str, now: u64) -> Result<bool> {
        if !name.starts_with(ALARM_PREFIX) {
            return Ok(false);
        }
        self.reconcile(now).await?;
        Ok(true)
    }
}

fn normalize_key(hostname: &str) -> String {
    if hostname == GLOBAL_PAUSE_ID {
        hostname.to_string()
    } else {
        hostname.trim().trim_end_matches('.').to_ascii_lowercase()
    }
}

/// The pause rule family: one allow-all rule for a global pause and one for
/// the paused hostnames.
pub fn pause_rules(config: &Config, now: u64) -> Vec<Rule> {
    let active = config.paused.iter().filter(|(_, entry)| entry.is_active(now));

    let mut global = false;
    let mut hostnames = Vec::new();
    for (key, _) in active {
        if key == GLOBAL_PAUSE_ID {
            global = true;
        } else {
            hostnames.push(key.clone());
        }
    }

    let mut rules = Vec::new();
    if global {
        rules.push(Rule::new(
            priority::PAUSE,
            RuleAction::new(ActionType::AllowAllRequests),
            RuleCondition {
                resource_types: Some(document_types()),
                ..Default::default()
            },
        ));
    }
    if !hostnames.is_empty() {
        rules.push(Rule::allow_all_requests(priority::PAUSE, hostnames));
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryAlarms;

    #[test]
    fn rules_skip_expired_entries() {
        let mut config = Config::default();
        config
            .paused
            .insert(GLOBAL_PAUSE_ID.to_string(), PausedEntry { revoke_at: Some(500) });
        config
            .paused
            .insert("a.com".to_string(), PausedEntry { revoke_at: None });

        let rules = pause_rules(&config, 100);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].condition.request_domains, None);
        assert_eq!(rules[1].condition.request_domains, Some(vec!["a.com".to_string()]));

        let rules = pause_rules(&config, 500);
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_removes_expired_and_schedules_alarms() {
        let bus = ConfigBus::new(Config::default());
        let alarms = Arc::new(MemoryAlarms::new());
        let controller = PauseController::new(bus.clone(), alarms.clone());

        controller.pause(GLOBAL_PAUSE_ID, Some(1_000));
        controller.pause("Site.com", Some(5_000));
        controller.pause("forever.org", None);
        alarms.create("pause:gone.net", 10).await.unwrap();
        alarms.create("other", 10).await.unwrap();

        let report = controller.reconcile(2_000).await.unwrap();
        assert_eq!(report.expired, vec![GLOBAL_PAUSE_ID.to_string()]);
        assert_eq!(report.alarms, 1);

        let config = bus.current();
        assert!(!config.paused.contains_key(GLOBAL_PAUSE_ID));
        assert!(config.paused.contains_key("site.com"));
        assert_eq!(alarms.names().await.unwrap(), vec!["other", "pause:site.com"]);
    }

    #[tokio::test]
    async fn foreign_alarms_are_ignored() {
        let bus = ConfigBus::new(Config::default());
        let controller = PauseController::new(bus, Arc::new(MemoryAlarms::new()));
        assert!(!controller.on_alarm("refresh", 0).await.unwrap());
        assert!(controller.on_alarm("pause:a.com", 0).await.unwrap());
    }
}
