//! Declarative rules
//!
//! The host evaluates these rules itself, before any extension code runs.
//! Rules are grouped into families; each family owns a fixed id range
//! ([`ranges`]) and is always replaced as a whole.

pub mod convert;
pub mod fixes;
pub mod host;
pub mod ranges;
pub mod safe_mode;
pub mod sync;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

pub use convert::{convert_filter, convert_filters, ConversionError};
pub use host::{DeclarativeHost, HostError};
pub use ranges::RuleFamily;
pub use sync::{RuleSynchronizer, SyncFailure, SyncReport, SyncStep};

/// Rule priorities. Higher wins; on a tie allow beats block.
pub mod priority {
    pub const PAUSE: u32 = 10_000_000;
    pub const TRUSTED_DOMAIN: u32 = 10_000_000;
    pub const SAFE_MODE_BLOCK: u32 = 5_000_001;
    pub const SAFE_MODE_ALLOW: u32 = 5_000_000;
    pub const REDIRECT_PROTECTION: u32 = 4_000_000;
    pub const ALLOW_ONCE: u32 = 4_000_000;
    pub const EXCEPTION: u32 = 3_000_000;

    // converted filters
    pub const FILTER_BLOCK: u32 = 1;
    pub const FILTER_ALLOW: u32 = 2;
    pub const FILTER_REDIRECT: u32 = 2;
    pub const FILTER_IMPORTANT: u32 = 100;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Rule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ActionType {
    Block,
    Allow,
    AllowAllRequests,
    Redirect,
    UpgradeScheme,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub redirect: Option<RuleRedirect>,
}

impl RuleAction {
    pub fn new(kind: ActionType) -> Self {
        Self { kind, redirect: None }
    }

    pub fn redirect_to_path(path: &str) -> Self {
        Self {
            kind: ActionType::Redirect,
            redirect: Some(RuleRedirect {
                extension_path: Some(path.to_string()),
                url: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RuleRedirect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub extension_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum DomainType {
    FirstParty,
    ThirdParty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub url_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub regex_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub is_url_filter_case_sensitive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub request_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub excluded_request_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub initiator_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub excluded_initiator_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub resource_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub excluded_resource_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub domain_type: Option<DomainType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub tab_ids: Option<Vec<i32>>,
}

impl Rule {
    /// Rule with id 0; ids are assigned when the family is submitted.
    pub fn new(priority: u32, action: RuleAction, condition: RuleCondition) -> Self {
        Self {
            id: 0,
            priority,
            action,
            condition,
        }
    }

    /// Allow every request of a document tree on `domains`.
    pub fn allow_all_requests(priority: u32, domains: Vec<String>) -> Self {
        Self::new(
            priority,
            RuleAction::new(ActionType::AllowAllRequests),
            RuleCondition {
                request_domains: Some(domains),
                resource_types: Some(document_types()),
                ..Default::default()
            },
        )
    }

    pub fn regex(&self) -> Option<&str> {
        self.condition.regex_filter.as_deref()
    }
}

/// `main_frame` and `sub_frame`, the only types `allowAllRequests` accepts.
pub fn document_types() -> Vec<String> {
    vec!["main_frame".to_string(), "sub_frame".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_in_host_shape() {
        let rule = Rule {
            id: 7,
            ..Rule::new(
                priority::FILTER_REDIRECT,
                RuleAction::redirect_to_path("/redirects/noop.js"),
                RuleCondition {
                    url_filter: Some("||ads.com^".to_string()),
                    domain_type: Some(DomainType::ThirdParty),
                    ..Default::default()
                },
            )
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 7,
                "priority": 2,
                "action": {"type": "redirect", "redirect": {"extensionPath": "/redirects/noop.js"}},
                "condition": {"urlFilter": "||ads.com^", "domainType": "thirdParty"}
            })
        );
    }

    #[test]
    fn parses_host_rules() {
        let rule: Rule = serde_json::from_str(
            r#"{"id": 1, "priority": 1, "action": {"type": "allowAllRequests"},
                "condition": {"requestDomains": ["a.com"], "resourceTypes": ["main_frame"]}}"#,
        )
        .unwrap();
        assert_eq!(rule.action.kind, ActionType::AllowAllRequests);
        assert_eq!(rule.condition.request_domains, Some(vec!["a.com".to_string()]));
    }
}
