//! Redirect protection
//!
//! A top-level navigation the main engine would block is diverted to an
//! interstitial page carrying the original URL. From there the user can
//! proceed once (tab-scoped) or switch protection off for the hostname.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use veil_engine::psl::is_same_or_subdomain;
use veil_engine::{Engine, FilterIndex, MatchDecision, Request};

use crate::bus::ConfigBus;
use crate::config::Config;
use crate::dnr::{
    priority, ActionType, DeclarativeHost, Rule, RuleAction, RuleCondition, RuleFamily,
};
use crate::error::Result;
use crate::trust::{is_trusted, TrackerDb};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Proceed,
    Divert { url: String },
}

pub struct RedirectInterceptor {
    bus: ConfigBus,
    trackers: Arc<dyn TrackerDb>,
    interstitial: String,
    host: Option<Arc<dyn DeclarativeHost>>,
    /// (tab, hostname) pairs allowed once
    allowances: Mutex<BTreeSet<(i32, String)>>,
}

impl RedirectInterceptor {
    pub fn new(
        bus: ConfigBus,
        trackers: Arc<dyn TrackerDb>,
        interstitial: String,
        host: Option<Arc<dyn DeclarativeHost>>,
    ) -> Self {
        Self {
            bus,
            trackers,
            interstitial,
            host,
            allowances: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn interstitial_url(&self, target: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        format!("{}?url={encoded}", self.interstitial)
    }

    pub fn on_before_navigate(
        &self,
        engine: &Engine,
        tab_id: i32,
        url: &str,
        now: u64,
    ) -> Navigation {
        let config = self.bus.current();
        if !config.redirect_protection.enabled {
            return Navigation::Proceed;
        }

        let request = Request::new(url, None, "main_frame");
        if is_protection_disabled(&config, &request.hostname)
            || self.is_allowed_once(tab_id, &request.hostname)
        {
            return Navigation::Proceed;
        }
        if is_trusted(&config, self.trackers.as_ref(), &request, now) {
            return Navigation::Proceed;
        }

        match engine.match_request(&request).decision {
            MatchDecision::Block | MatchDecision::Redirect => {
                log::debug!("diverting navigation to {}", request.hostname);
                Navigation::Divert {
                    url: self.interstitial_url(url),
                }
            }
            MatchDecision::Allow => Navigation::Proceed,
        }
    }

    fn is_allowed_once(&self, tab_id: i32, hostname: &str) -> bool {
        self.allowances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(tab_id, hostname.to_string()))
    }

    /// Let the tab through to `url`'s host for the rest of the session.
    pub async fn allow_once(&self, tab_id: i32, url: &str) -> Result<()> {
        let hostname = Request::new(url, None, "main_frame").hostname;
        let inserted = self
            .allowances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((tab_id, hostname));
        if inserted {
            self.sync_session_rules().await?;
        }
        Ok(())
    }

    /// Drop allowances of a closed tab.
    pub async fn forget_tab(&self, tab_id: i32) -> Result<()> {
        let removed = {
            let mut allowances = self.allowances.lock().unwrap_or_else(|e| e.into_inner());
            let before = allowances.len();
            allowances.retain(|(tab, _)| *tab != tab_id);
            before != allowances.len()
        };
        if removed {
            self.sync_session_rules().await?;
        }
        Ok(())
    }

    pub fn disable_for(&self, hostname: &str) -> bool {
        let hostname = hostname.trim().to_ascii_lowercase();
        self.bus.update(|c| {
            if !c.redirect_protection.disabled.contains(&hostname) {
                c.redirect_protection.disabled.push(hostname);
            }
        })
    }

    async fn sync_session_rules(&self) -> Result<()> {
        let Some(host) = &self.host else {
            return Ok(());
        };
        let rules: Vec<Rule> = {
            let allowances = self.allowances.lock().unwrap_or_else(|e| e.into_inner());
            allowances
                .iter()
                .map(|(tab, hostname)| {
                    Rule::new(
                        priority::ALLOW_ONCE,
                        RuleAction::new(ActionType::Allow),
                        RuleCondition {
                            request_domains: Some(vec![hostname.clone()]),
                            resource_types: Some(vec!["main_frame".to_string()]),
                            tab_ids: Some(vec![*tab]),
                            ..Default::default()
                        },
                    )
                })
                .collect()
        };

        let family = RuleFamily::RedirectAllowOnce;
        let rules = family.assign(rules)?;
        let remove_ids = host
            .session_rules()
            .await?
            .iter()
            .map(|r| r.id)
            .filter(|&id| family.contains(id))
            .collect();
        host.update_session_rules(remove_ids, rules).await?;
        Ok(())
    }
}

fn is_protection_disabled(config: &Config, hostname: &str) -> bool {
    config
        .redirect_protection
        .disabled
        .iter()
        .any(|disabled| is_same_or_subdomain(hostname, disabled))
}

/// The redirect-protection rule family: top-level navigations to hosts the
/// user opted out for are allowed through.
pub fn redirect_protection_rules(config: &Config) -> Vec<Rule> {
    let protection = &config.redirect_protection;
    if !protection.enabled || protection.disabled.is_empty() {
        return Vec::new();
    }
    vec![Rule::new(
        priority::REDIRECT_PROTECTION,
        RuleAction::new(ActionType::Allow),
        RuleCondition {
            request_domains: Some(protection.disabled.clone()),
            resource_types: Some(vec!["main_frame".to_string()]),
            ..Default::default()
        },
    )]
}
