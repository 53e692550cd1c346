//! Safe mode: stop filtering everywhere except a denylist.

use super::{document_types, priority, ActionType, Rule, RuleAction, RuleCondition};
use crate::config::SafeMode;

/// Denylisted hosts stay blocked; every other document tree is allowed.
pub fn safe_mode_rules(safe_mode: &SafeMode) -> Vec<Rule> {
    if !safe_mode.enabled {
        return Vec::new();
    }

    let mut rules = Vec::with_capacity(2);
    let denylist: Vec<String> = safe_mode
        .denylist
        .iter()
        .map(|host| host.trim().to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .collect();
    if !denylist.is_empty() {
        rules.push(Rule::new(
            priority::SAFE_MODE_BLOCK,
            RuleAction::new(ActionType::Block),
            RuleCondition {
                request_domains: Some(denylist),
                ..Default::default()
            },
        ));
    }
    rules.push(Rule::new(
        priority::SAFE_MODE_ALLOW,
        RuleAction::new(ActionType::AllowAllRequests),
        RuleCondition {
            resource_types: Some(document_types()),
            ..Default::default()
        },
    ));
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_emits_nothing() {
        assert!(safe_mode_rules(&SafeMode::default()).is_empty());
    }

    #[test]
    fn block_outranks_allow() {
        let rules = safe_mode_rules(&SafeMode {
            enabled: true,
            denylist: vec!["Evil.com".to_string()],
        });
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].action.kind, ActionType::Block);
        assert_eq!(rules[0].condition.request_domains, Some(vec!["evil.com".to_string()]));
        assert_eq!(rules[1].action.kind, ActionType::AllowAllRequests);
        assert!(rules[0].priority > rules[1].priority);
    }

    #[test]
    fn empty_denylist_only_allows() {
        let rules = safe_mode_rules(&SafeMode {
            enabled: true,
            denylist: Vec::new(),
        });
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action.kind, ActionType::AllowAllRequests);
    }
}
