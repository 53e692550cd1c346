//! Exception compiler: user trust decisions as negated allow rules.

use veil_engine::NetworkFilter;

use crate::config::Config;
use crate::dnr::{convert_filter, priority, ActionType, Rule, RuleAction};
use crate::trust::TrackerDb;

/// Turn a blocking filter into its exception, scoped to `domains` when given.
/// Any existing `domain=` option is replaced.
pub fn negate_filter(filter: &str, domains: Option<&[String]>) -> String {
    let filter = filter.trim();
    let filter = filter.strip_prefix("@@").unwrap_or(filter);
    let (pattern, options) = split_options(filter);

    let mut kept: Vec<String> = options
        .map(|options| {
            options
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .filter(|o| {
                    let lower = o.to_ascii_lowercase();
                    !lower.starts_with("domain=") && !lower.starts_with("from=")
                })
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Some(domains) = domains.filter(|d| !d.is_empty()) {
        kept.push(format!("domain={}", domains.join("|")));
    }

    if kept.is_empty() {
        format!("@@{pattern}")
    } else {
        format!("@@{pattern}${}", kept.join(","))
    }
}

fn split_options(filter: &str) -> (&str, Option<&str>) {
    if filter.starts_with('/') {
        if let Some(pos) = filter.rfind("/$").filter(|&pos| pos > 0) {
            return (&filter[..pos + 1], Some(&filter[pos + 2..]));
        }
        if filter.ends_with('/') {
            return (filter, None);
        }
    }
    match filter.find('$') {
        Some(pos) => (&filter[..pos], Some(&filter[pos + 1..])),
        None => (filter, None),
    }
}

/// Exception filter text for every configured exception.
pub fn exception_filters(config: &Config, db: &dyn TrackerDb) -> Vec<String> {
    let mut out = Vec::new();
    for (id, exception) in &config.exceptions {
        if !exception.global && exception.domains.is_empty() {
            continue;
        }
        let filters = db.filters_for(id).unwrap_or_else(|| vec![format!("||{id}^")]);
        let scope = (!exception.global).then_some(exception.domains.as_slice());
        out.extend(filters.iter().map(|f| negate_filter(f, scope)));
    }
    out
}

/// The exceptions rule family.
pub fn exception_rules(config: &Config, db: &dyn TrackerDb) -> Vec<Rule> {
    exception_filters(config, db)
        .iter()
        .filter_map(|text| {
            let filter = NetworkFilter::parse(text)
                .map_err(|e| log::warn!("exception filter '{text}' unusable: {e}"))
                .ok()?;
            let rule = convert_filter(&filter)
                .map_err(|e| log::warn!("exception filter '{text}' not convertible: {}", e.reason))
                .ok()?;
            Some(Rule {
                priority: priority::EXCEPTION,
                action: RuleAction::new(ActionType::Allow),
                ..rule
            })
        })
        .collect()
}
