//! Trust decisions shared by the imperative and declarative paths.
//!
//! A request is trusted when its page is paused, when the page is a managed
//! trusted domain, or when the request belongs to a tracker the user made an
//! exception for on that page.

use std::collections::HashMap;

use veil_engine::psl::is_same_or_subdomain;
use veil_engine::Request;

use crate::config::{Config, GLOBAL_PAUSE_ID};
use crate::dnr::{priority, Rule};

/// Tracker metadata lookups.
pub trait TrackerDb: Send + Sync {
    /// Canonical filters of tracker `id`; `None` when the id is unknown.
    fn filters_for(&self, id: &str) -> Option<Vec<String>>;

    /// Tracker a request URL is attributed to.
    fn tracker_for_request(&self, url: &str) -> Option<String>;

    /// Changes whenever the metadata changes.
    fn version(&self) -> u64;
}

/// No tracker metadata; every exception id is treated as a hostname.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTrackerDb;

impl TrackerDb for NoTrackerDb {
    fn filters_for(&self, _id: &str) -> Option<Vec<String>> {
        None
    }

    fn tracker_for_request(&self, _url: &str) -> Option<String> {
        None
    }

    fn version(&self) -> u64 {
        0
    }
}

/// Tracker metadata held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticTrackerDb {
    trackers: HashMap<String, Vec<String>>,
    /// tracker id -> hostnames attributed to it
    domains: HashMap<String, Vec<String>>,
    version: u64,
}

impl StaticTrackerDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracker(mut self, id: &str, domains: &[&str], filters: &[&str]) -> Self {
        self.trackers
            .insert(id.to_string(), filters.iter().map(|f| f.to_string()).collect());
        self.domains
            .insert(id.to_string(), domains.iter().map(|d| d.to_string()).collect());
        self.version += 1;
        self
    }
}

impl TrackerDb for StaticTrackerDb {
    fn filters_for(&self, id: &str) -> Option<Vec<String>> {
        self.trackers.get(id).cloned()
    }

    fn tracker_for_request(&self, url: &str) -> Option<String> {
        let hostname = veil_engine::url::extract_host(url)?.to_ascii_lowercase();
        self.domains
            .iter()
            .find(|(_, domains)| domains.iter().any(|d| is_same_or_subdomain(&hostname, d)))
            .map(|(id, _)| id.clone())
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Whether filtering is paused for pages on `hostname` at `now`.
pub fn is_paused(config: &Config, hostname: &str, now: u64) -> bool {
    config.paused.iter().any(|(key, entry)| {
        entry.is_active(now) && (key == GLOBAL_PAUSE_ID || is_same_or_subdomain(hostname, key))
    })
}

/// The trusted-domains rule family: one `allowAllRequests` rule covering
/// every managed trusted domain, so the host exempts them as well.
pub fn trusted_domain_rules(config: &Config) -> Vec<Rule> {
    let mut domains: Vec<String> = config
        .managed
        .trusted_domains
        .iter()
        .map(|domain| domain.trim().trim_end_matches('.').to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
        .collect();
    domains.sort();
    domains.dedup();
    if domains.is_empty() {
        return Vec::new();
    }
    vec![Rule::allow_all_requests(priority::TRUSTED_DOMAIN, domains)]
}

pub fn is_trusted_domain(config: &Config, hostname: &str) -> bool {
    config
        .managed
        .trusted_domains
        .iter()
        .any(|domain| is_same_or_subdomain(hostname, domain))
}

/// Whether `request` must pass untouched.
pub fn is_trusted(config: &Config, db: &dyn TrackerDb, request: &Request, now: u64) -> bool {
    let page = request.source_hostname.as_str();
    if is_paused(config, page, now) || is_trusted_domain(config, page) {
        return true;
    }
    if config.exceptions.is_empty() {
        return false;
    }

    let tracker = db.tracker_for_request(&request.url);
    config.exceptions.iter().any(|(id, exception)| {
        let attributed = match &tracker {
            Some(tracker) if tracker == id => true,
            // unknown ids are hostnames
            _ => db.filters_for(id).is_none() && is_same_or_subdomain(&request.hostname, id),
        };
        attributed
            && (exception.global
                || exception
                    .domains
                    .iter()
                    .any(|domain| is_same_or_subdomain(page, domain)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Exception, PausedEntry};

    fn db() -> StaticTrackerDb {
        StaticTrackerDb::new().with_tracker("t", &["tracker.com"], &["||tracker.com^"])
    }

    fn scoped(domains: &[&str]) -> Exception {
        Exception {
            global: false,
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn exception_is_scoped_to_domains() {
        let mut config = Config::default();
        config.exceptions.insert("t".to_string(), scoped(&["a.com"]));

        let from_a =
            Request::new("https://cdn.tracker.com/t.js", Some("https://www.a.com/"), "script");
        let from_b = Request::new("https://cdn.tracker.com/t.js", Some("https://b.com/"), "script");
        assert!(is_trusted(&config, &db(), &from_a, 0));
        assert!(!is_trusted(&config, &db(), &from_b, 0));
    }

    #[test]
    fn global_exception_and_hostname_ids() {
        let mut config = Config::default();
        config.exceptions.insert(
            "cdn.example.org".to_string(),
            Exception {
                global: true,
                domains: Vec::new(),
            },
        );
        let req = Request::new("https://cdn.example.org/x.js", Some("https://b.com/"), "script");
        assert!(is_trusted(&config, &db(), &req, 0));
    }

    #[test]
    fn pause_and_managed_trust() {
        let mut config = Config::default();
        config
            .paused
            .insert("site.com".to_string(), PausedEntry { revoke_at: Some(100) });
        config.managed.trusted_domains.push("intranet.corp".to_string());

        let req = Request::new("https://ads.com/a.js", Some("https://www.site.com/"), "script");
        assert!(is_trusted(&config, &NoTrackerDb, &req, 50));
        assert!(!is_trusted(&config, &NoTrackerDb, &req, 100));

        let req =
            Request::new("https://ads.com/a.js", Some("https://wiki.intranet.corp/"), "script");
        assert!(is_trusted(&config, &NoTrackerDb, &req, 0));
    }

    #[test]
    fn trusted_domains_become_one_allow_rule() {
        let mut config = Config::default();
        assert!(trusted_domain_rules(&config).is_empty());

        config.managed.trusted_domains = vec![
            "Intranet.Corp.".to_string(),
            "intranet.corp".to_string(),
            " ".to_string(),
            "wiki.example".to_string(),
        ];
        let rules = trusted_domain_rules(&config);
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].condition.request_domains,
            Some(vec!["intranet.corp".to_string(), "wiki.example".to_string()])
        );
        assert_eq!(rules[0].priority, priority::TRUSTED_DOMAIN);
    }

    #[test]
    fn global_pause() {
        let mut config = Config::default();
        config
            .paused
            .insert(GLOBAL_PAUSE_ID.to_string(), PausedEntry { revoke_at: None });
        assert!(is_paused(&config, "anything.net", u64::MAX));
    }
}
