//! Imperative request interception, for platforms without declarative rules.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use veil_engine::types::RequestType;
use veil_engine::{Engine, FilterIndex, MatchDecision, Redirect, Request, ResponseMatch};

use crate::bus::ConfigBus;
use crate::trust::{is_trusted, TrackerDb};

/// A request as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RequestDetails {
    pub url: String,
    #[serde(default)]
    #[ts(optional)]
    pub initiator: Option<String>,
    /// Browser resource type, e.g. `script` or `main_frame`
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default = "no_tab")]
    pub tab_id: i32,
}

fn no_tab() -> i32 {
    -1
}

impl RequestDetails {
    pub fn new(url: &str, initiator: Option<&str>, request_type: &str) -> Self {
        Self {
            url: url.to_string(),
            initiator: initiator.map(str::to_string),
            request_type: request_type.to_string(),
            tab_id: no_tab(),
        }
    }

    pub fn to_request(&self) -> Request {
        Request::new(&self.url, self.initiator.as_deref(), &self.request_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
#[ts(export)]
pub enum Verdict {
    Cancel,
    Redirect { url: String },
}

pub struct RequestBlocker {
    bus: ConfigBus,
    trackers: Arc<dyn TrackerDb>,
    extension_origin: Option<String>,
}

impl RequestBlocker {
    pub fn new(
        bus: ConfigBus,
        trackers: Arc<dyn TrackerDb>,
        extension_origin: Option<String>,
    ) -> Self {
        Self {
            bus,
            trackers,
            extension_origin,
        }
    }

    /// `None` lets the request through. Top-level navigations are left to
    /// redirect protection.
    pub fn on_before_request(
        &self,
        engine: &Engine,
        details: &RequestDetails,
        now: u64,
    ) -> Option<Verdict> {
        let request = details.to_request();
        if request.request_type.contains(RequestType::MAIN_FRAME) {
            return None;
        }
        if is_trusted(&self.bus.current(), self.trackers.as_ref(), &request, now) {
            return None;
        }

        let result = engine.match_request(&request);
        match result.decision {
            MatchDecision::Allow => None,
            MatchDecision::Block => Some(Verdict::Cancel),
            MatchDecision::Redirect => Some(match &result.redirect {
                Some(redirect) => Verdict::Redirect {
                    url: self.redirect_url(redirect),
                },
                None => Verdict::Cancel,
            }),
        }
    }

    fn redirect_url(&self, redirect: &Redirect) -> String {
        match &self.extension_origin {
            Some(origin) => format!("{}{}", origin.trim_end_matches('/'), redirect.path),
            None => redirect.data_url.clone(),
        }
    }

    /// CSP additions and HTML filters for a document response.
    pub fn on_headers_received(
        &self,
        engine: &Engine,
        details: &RequestDetails,
        now: u64,
    ) -> Option<ResponseMatch> {
        let request = details.to_request();
        if !request.request_type.intersects(RequestType::DOCUMENT) {
            return None;
        }
        if is_trusted(&self.bus.current(), self.trackers.as_ref(), &request, now) {
            return None;
        }
        let result = engine.match_response(&request);
        (!result.csp.is_empty() || !result.html.is_empty()).then_some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PausedEntry};
    use crate::trust::NoTrackerDb;

    fn blocker(config: Config, origin: Option<&str>) -> RequestBlocker {
        RequestBlocker::new(
            ConfigBus::new(config),
            Arc::new(NoTrackerDb),
            origin.map(str::to_string),
        )
    }

    const LIST: &str = "||ads.com^\n||cdn.ads-lib.com/lib.js$script,redirect=noopjs\n\
                        ||site.com^$csp=script-src 'self'\nsite.com##^script[src*=\"ad\"]";

    #[test]
    fn block_and_redirect() {
        let engine = Engine::compile("ads", LIST);
        let blocker = blocker(Config::default(), Some("chrome-extension://id/"));

        let req = RequestDetails::new("https://ads.com/a.gif", Some("https://news.com/"), "image");
        assert_eq!(blocker.on_before_request(&engine, &req, 0), Some(Verdict::Cancel));

        let req = RequestDetails::new(
            "https://cdn.ads-lib.com/lib.js",
            Some("https://news.com/"),
            "script",
        );
        assert_eq!(
            blocker.on_before_request(&engine, &req, 0),
            Some(Verdict::Redirect {
                url: "chrome-extension://id/redirects/noop.js".to_string()
            })
        );

        let blocker =
            RequestBlocker::new(ConfigBus::new(Config::default()), Arc::new(NoTrackerDb), None);
        assert_eq!(
            blocker.on_before_request(&engine, &req, 0),
            Some(Verdict::Redirect {
                url: "data:application/javascript,".to_string()
            })
        );
    }

    #[test]
    fn trusted_and_top_level_requests_pass() {
        let engine = Engine::compile("ads", LIST);
        let mut config = Config::default();
        config
            .paused
            .insert("news.com".to_string(), PausedEntry { revoke_at: None });
        let blocker = blocker(config, None);

        let req = RequestDetails::new("https://ads.com/a.gif", Some("https://news.com/"), "image");
        assert_eq!(blocker.on_before_request(&engine, &req, 0), None);
        let req = RequestDetails::new("https://ads.com/", None, "main_frame");
        assert_eq!(blocker.on_before_request(&engine, &req, 0), None);
    }

    #[test]
    fn response_rewrites() {
        let engine = Engine::compile("ads", LIST);
        let blocker = blocker(Config::default(), None);

        let req = RequestDetails::new("https://site.com/", None, "main_frame");
        let result = blocker.on_headers_received(&engine, &req, 0).unwrap();
        assert_eq!(result.csp, vec!["script-src 'self'".to_string()]);
        assert_eq!(result.html, vec!["script[src*=\"ad\"]".to_string()]);

        let req = RequestDetails::new("https://site.com/app.js", None, "script");
        assert!(blocker.on_headers_received(&engine, &req, 0).is_none());
    }
}
