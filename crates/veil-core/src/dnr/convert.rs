//! Network filter to declarative rule conversion.
//!
//! Only the subset the host can evaluate converts. Everything else comes
//! back as a [`ConversionError`] and stays with the imperative engine.

use serde::Serialize;
use ts_rs::TS;
use veil_engine::filters::NetworkFilter;
use veil_engine::resources;
use veil_engine::types::{FilterFlags, PartyMask};
use veil_engine::FilterAction;

use super::{priority, ActionType, DomainType, Rule, RuleAction, RuleCondition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConversionError {
    pub filter: String,
    pub reason: String,
}

impl ConversionError {
    fn new(filter: &NetworkFilter, reason: impl Into<String>) -> Self {
        Self {
            filter: filter.raw.clone(),
            reason: reason.into(),
        }
    }
}

/// Convert one filter. Ids are left at 0.
pub fn convert_filter(filter: &NetworkFilter) -> Result<Rule, ConversionError> {
    if filter.is_csp() {
        return Err(ConversionError::new(filter, "$csp is not supported by declarative rules"));
    }
    if filter.is_cosmetic_exception() {
        return Err(ConversionError::new(filter, "cosmetic exceptions apply in the page"));
    }
    if filter.flags.contains(FilterFlags::BADFILTER) {
        return Err(ConversionError::new(filter, "$badfilter has no declarative form"));
    }
    if filter.flags.contains(FilterFlags::REDIRECT_RULE) {
        return Err(ConversionError::new(filter, "$redirect-rule has no declarative form"));
    }
    if !filter.raw.is_ascii() {
        return Err(ConversionError::new(filter, "non-ASCII pattern"));
    }

    let mut condition = RuleCondition::default();
    if filter.is_regex() {
        condition.regex_filter = Some(filter.pattern.clone());
    } else if let Some(url_filter) = url_filter(filter) {
        condition.url_filter = Some(url_filter);
    }
    if filter.flags.contains(FilterFlags::MATCH_CASE) {
        condition.is_url_filter_case_sensitive = Some(true);
    }

    if !filter.type_mask.is_empty() {
        let names: Vec<String> = filter
            .type_mask
            .browser_names()
            .into_iter()
            .map(String::from)
            .collect();
        condition.resource_types = Some(names);
    }

    if filter.party_mask == PartyMask::THIRD_PARTY {
        condition.domain_type = Some(DomainType::ThirdParty);
    } else if filter.party_mask == PartyMask::FIRST_PARTY {
        condition.domain_type = Some(DomainType::FirstParty);
    }

    if let Some(domains) = &filter.domains {
        if !domains.include.is_empty() {
            condition.initiator_domains = Some(domains.include.clone());
        }
        if !domains.exclude.is_empty() {
            condition.excluded_initiator_domains = Some(domains.exclude.clone());
        }
    }

    let (action, priority) = match (filter.action, &filter.redirect) {
        (FilterAction::Allow, _) => (RuleAction::new(ActionType::Allow), priority::FILTER_ALLOW),
        (FilterAction::Block, Some(name)) => {
            let redirect = resources::lookup(name).ok_or_else(|| {
                ConversionError::new(filter, format!("unknown redirect resource '{name}'"))
            })?;
            (RuleAction::redirect_to_path(&redirect.path), priority::FILTER_REDIRECT)
        }
        (FilterAction::Block, None) => (RuleAction::new(ActionType::Block), priority::FILTER_BLOCK),
    };
    let priority = if filter.is_important() {
        priority + priority::FILTER_IMPORTANT
    } else {
        priority
    };

    Ok(Rule::new(priority, action, condition))
}

/// Convert many filters, splitting successes from failures.
pub fn convert_filters<'a>(
    filters: impl IntoIterator<Item = &'a NetworkFilter>,
) -> (Vec<Rule>, Vec<ConversionError>) {
    let mut rules = Vec::new();
    let mut errors = Vec::new();
    for filter in filters {
        match convert_filter(filter) {
            Ok(rule) => rules.push(rule),
            Err(e) => errors.push(e),
        }
    }
    (rules, errors)
}

fn url_filter(filter: &NetworkFilter) -> Option<String> {
    let mut out = String::new();
    if let Some(hostname) = &filter.hostname {
        out.push_str("||");
        out.push_str(hostname);
    } else if filter.flags.contains(FilterFlags::HAS_HOST_ANCHOR) {
        out.push_str("||");
    } else if filter.flags.contains(FilterFlags::HAS_LEFT_ANCHOR) {
        out.push('|');
    }
    out.push_str(&filter.pattern);
    if filter.flags.contains(FilterFlags::HAS_RIGHT_ANCHOR) {
        out.push('|');
    }
    (!out.is_empty()).then_some(out)
}
