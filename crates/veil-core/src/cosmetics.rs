//! Cosmetic injection for content scripts.

use veil_engine::{CosmeticMatch, CosmeticQuery, Engine, FilterIndex};

use crate::bus::ConfigBus;
use crate::config::Config;
use crate::trust::{is_paused, is_trusted_domain};

pub struct CosmeticInjector {
    bus: ConfigBus,
}

impl CosmeticInjector {
    pub fn new(bus: ConfigBus) -> Self {
        Self { bus }
    }

    /// First pass on a page: base styles, hostname rules, scriptlets and
    /// extended selectors. `None` when the page must be left alone.
    pub fn bootstrap(&self, engine: &Engine, url: &str, now: u64) -> Option<CosmeticMatch> {
        let query = CosmeticQuery::bootstrap(url);
        if skip(&self.bus.current(), &query.hostname, now) {
            return None;
        }
        Some(engine.match_cosmetics(&query))
    }

    /// Incremental pass for classes, ids and links seen in the DOM.
    pub fn dom(
        &self,
        engine: &Engine,
        url: &str,
        classes: Vec<String>,
        ids: Vec<String>,
        hrefs: Vec<String>,
        now: u64,
    ) -> Option<CosmeticMatch> {
        let query = CosmeticQuery::dom(url, classes, ids, hrefs);
        if skip(&self.bus.current(), &query.hostname, now) {
            return None;
        }
        Some(engine.match_cosmetics(&query))
    }

    /// Procedural selectors for the in-page evaluator.
    pub fn extended_selectors(&self, engine: &Engine, url: &str, now: u64) -> Vec<String> {
        self.bootstrap(engine, url, now)
            .map(|cosmetics| cosmetics.extended)
            .unwrap_or_default()
    }
}

fn skip(config: &Config, hostname: &str, now: u64) -> bool {
    hostname.is_empty() || is_paused(config, hostname, now) || is_trusted_domain(config, hostname)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PausedEntry;

    const LIST: &str = "news.com##.sponsored\n##.ad-banner\nnews.com##div:has-text(Promoted)\n\
                        news.com##+js(set-constant, ads, false)";

    #[test]
    fn bootstrap_and_dom_passes() {
        let engine = Engine::compile("ads", LIST);
        let injector = CosmeticInjector::new(ConfigBus::new(Config::default()));

        let first = injector.bootstrap(&engine, "https://news.com/a", 0).unwrap();
        assert!(first.styles.contains(".sponsored"));
        assert_eq!(first.scriptlets.len(), 1);
        assert_eq!(first.extended, vec!["div:has-text(Promoted)".to_string()]);

        let dom = injector
            .dom(&engine, "https://news.com/a", vec!["ad-banner".to_string()], vec![], vec![], 0)
            .unwrap();
        assert!(dom.styles.contains(".ad-banner"));
        assert!(dom.scriptlets.is_empty());
    }

    #[test]
    fn paused_and_trusted_pages_are_skipped() {
        let engine = Engine::compile("ads", LIST);
        let mut config = Config::default();
        config
            .paused
            .insert("news.com".to_string(), PausedEntry { revoke_at: None });
        config.managed.trusted_domains.push("corp.net".to_string());
        let injector = CosmeticInjector::new(ConfigBus::new(config));

        assert!(injector.bootstrap(&engine, "https://news.com/", 0).is_none());
        assert!(injector.bootstrap(&engine, "https://wiki.corp.net/", 0).is_none());
        assert!(injector.extended_selectors(&engine, "https://news.com/", 0).is_empty());
        assert!(injector.bootstrap(&engine, "https://other.org/", 0).is_some());
    }
}
