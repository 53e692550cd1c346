//! Messages exchanged with content scripts.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use veil_engine::{CosmeticMatch, Engine};

use crate::cosmetics::CosmeticInjector;
use crate::trust::TrackerDb;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "action", rename_all = "camelCase")]
#[ts(export)]
pub enum ContentMessage {
    /// `bootstrap` on the first call for a document, DOM-observed
    /// classes/ids/hrefs afterwards
    InjectCosmetics {
        url: String,
        #[serde(default)]
        bootstrap: bool,
        #[serde(default)]
        classes: Vec<String>,
        #[serde(default)]
        ids: Vec<String>,
        #[serde(default)]
        hrefs: Vec<String>,
    },
    EvaluateExtendedSelectors { url: String },
    /// Resource URLs the page loaded, for tracker attribution
    ReportObservedUrls { url: String, urls: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentResponse {
    Cosmetics(CosmeticMatch),
    ExtendedSelectors { selectors: Vec<String> },
    ObservedUrls { trackers: Vec<String> },
    /// Page is paused or trusted
    Skipped,
}

/// Answer one content-script message against `engine`.
pub fn respond(
    message: ContentMessage,
    engine: &Engine,
    injector: &CosmeticInjector,
    trackers: &dyn TrackerDb,
    now: u64,
) -> ContentResponse {
    match message {
        ContentMessage::InjectCosmetics {
            url,
            bootstrap,
            classes,
            ids,
            hrefs,
        } => {
            let cosmetics = if bootstrap {
                injector.bootstrap(engine, &url, now)
            } else {
                injector.dom(engine, &url, classes, ids, hrefs, now)
            };
            cosmetics.map_or(ContentResponse::Skipped, ContentResponse::Cosmetics)
        }
        ContentMessage::EvaluateExtendedSelectors { url } => ContentResponse::ExtendedSelectors {
            selectors: injector.extended_selectors(engine, &url, now),
        },
        ContentMessage::ReportObservedUrls { urls, .. } => {
            let mut found: Vec<String> = urls
                .iter()
                .filter_map(|u| trackers.tracker_for_request(u))
                .collect();
            found.sort();
            found.dedup();
            ContentResponse::ObservedUrls { trackers: found }
        }
    }
}
