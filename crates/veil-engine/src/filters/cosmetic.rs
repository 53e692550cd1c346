//! Cosmetic filters: element hiding, style injection, extended selectors,
//! scriptlet injection and HTML filtering.

use serde::{Deserialize, Serialize};

use super::network::normalize_domain;
use super::FilterParseError;
use crate::psl::{get_etld1, is_same_or_subdomain};

/// Procedural pseudo-classes that need the in-page evaluator.
const EXTENDED_PSEUDO_CLASSES: &[&str] = &[
    ":has-text(",
    ":-abp-has(",
    ":-abp-contains(",
    ":contains(",
    ":upward(",
    ":xpath(",
    ":matches-css(",
    ":matches-css-before(",
    ":matches-css-after(",
    ":matches-attr(",
    ":matches-path(",
    ":min-text-length(",
    ":watch-attr(",
    ":others(",
    ":remove(",
];

/// A scriptlet invocation, `+js(name, arg1, arg2)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptletCall {
    pub name: String,
    pub args: Vec<String>,
}

impl ScriptletCall {
    /// Name with the optional `.js` suffix removed.
    pub fn canonical_name(&self) -> &str {
        self.name.strip_suffix(".js").unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CosmeticKind {
    /// `##selector`
    Hide,
    /// `##selector:style(css)`
    Style(String),
    /// Procedural selector evaluated in the page
    Extended,
    /// `##+js(...)`; an empty name on an exception disables all scriptlets
    Scriptlet(ScriptletCall),
    /// `##^selector`, applied to the response body
    Html,
}

/// Index key for generic hide filters, used by the DOM pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenericKey {
    Class(String),
    Id(String),
    /// Substring of a link target
    Href(String),
    /// Applied on every page up front
    Base,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosmeticFilter {
    pub raw: String,
    pub hostnames: Vec<String>,
    pub not_hostnames: Vec<String>,
    pub unhide: bool,
    pub kind: CosmeticKind,
    pub selector: String,
}

impl CosmeticFilter {
    pub fn parse(line: &str) -> Result<Self, FilterParseError> {
        let raw = line.trim();
        let (sep_pos, sep_len, unhide, extended) =
            find_separator(raw).ok_or(FilterParseError::Unsupported)?;

        let (hostnames, not_hostnames) = parse_hostnames(&raw[..sep_pos])?;
        let body = raw[sep_pos + sep_len..].trim();
        if body.is_empty() {
            return Err(FilterParseError::InvalidSelector(body.to_string()));
        }

        let (kind, selector) = if let Some(args) = body.strip_prefix("+js(") {
            let args = args
                .strip_suffix(')')
                .ok_or_else(|| FilterParseError::InvalidSelector(body.to_string()))?;
            let call = parse_scriptlet_args(args);
            if call.name.is_empty() && !unhide {
                return Err(FilterParseError::InvalidSelector(body.to_string()));
            }
            (CosmeticKind::Scriptlet(call), String::new())
        } else if let Some(selector) = body.strip_prefix('^') {
            (CosmeticKind::Html, validate_selector(selector)?)
        } else if let Some((selector, css)) = split_style(body) {
            if css.contains(['{', '}']) || css.trim().is_empty() {
                return Err(FilterParseError::InvalidSelector(body.to_string()));
            }
            (CosmeticKind::Style(css.trim().to_string()), validate_selector(selector)?)
        } else if extended || EXTENDED_PSEUDO_CLASSES.iter().any(|p| body.contains(p)) {
            (CosmeticKind::Extended, validate_selector(body)?)
        } else {
            (CosmeticKind::Hide, validate_selector(body)?)
        };

        Ok(Self {
            raw: raw.to_string(),
            hostnames,
            not_hostnames,
            unhide,
            kind,
            selector,
        })
    }

    /// Filters without positive hostnames apply on every site.
    pub fn is_generic(&self) -> bool {
        self.hostnames.is_empty()
    }

    pub fn scriptlet(&self) -> Option<&ScriptletCall> {
        match &self.kind {
            CosmeticKind::Scriptlet(call) => Some(call),
            _ => None,
        }
    }

    /// Whether the filter applies to a page on `hostname`.
    pub fn applies_to(&self, hostname: &str) -> bool {
        if self.not_hostnames.iter().any(|h| hostname_matches(h, hostname)) {
            return false;
        }
        self.hostnames.is_empty() || self.hostnames.iter().any(|h| hostname_matches(h, hostname))
    }

    /// DOM-pass key of a generic hide filter.
    pub fn generic_key(&self) -> GenericKey {
        generic_key(&self.selector)
    }
}

/// Match a filter hostname (possibly an `example.*` entity) against a page.
pub fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(entity) => {
            let domain = get_etld1(hostname);
            let suffix = match domain.find('.') {
                Some(idx) => &domain[idx + 1..],
                None => return false,
            };
            is_same_or_subdomain(hostname, &format!("{entity}.{suffix}"))
        }
        None => is_same_or_subdomain(hostname, pattern),
    }
}

fn find_separator(raw: &str) -> Option<(usize, usize, bool, bool)> {
    const SEPARATORS: &[(&str, bool, bool)] = &[
        ("#@?#", true, true),
        ("#?#", false, true),
        ("#@#", true, false),
        ("##", false, false),
    ];
    SEPARATORS
        .iter()
        .filter_map(|&(sep, unhide, extended)| {
            raw.find(sep).map(|pos| (pos, sep.len(), unhide, extended))
        })
        .min_by_key(|&(pos, len, _, _)| (pos, std::cmp::Reverse(len)))
}

fn parse_hostnames(text: &str) -> Result<(Vec<String>, Vec<String>), FilterParseError> {
    let mut hostnames = Vec::new();
    let mut not_hostnames = Vec::new();

    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (negated, host) = match part.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, part),
        };
        let normalized = match host.strip_suffix(".*") {
            Some(entity) => normalize_domain(entity).map(|e| format!("{e}.*")),
            None => normalize_domain(host),
        }
        .ok_or_else(|| FilterParseError::InvalidDomain(host.to_string()))?;

        if negated {
            not_hostnames.push(normalized);
        } else {
            hostnames.push(normalized);
        }
    }

    Ok((hostnames, not_hostnames))
}

fn validate_selector(selector: &str) -> Result<String, FilterParseError> {
    let selector = selector.trim();
    if selector.is_empty() || selector.contains(['{', '}']) {
        return Err(FilterParseError::InvalidSelector(selector.to_string()));
    }
    Ok(selector.to_string())
}

fn split_style(body: &str) -> Option<(&str, &str)> {
    let start = body.rfind(":style(")?;
    let css = body[start + ":style(".len()..].strip_suffix(')')?;
    Some((&body[..start], css))
}

fn parse_scriptlet_args(args: &str) -> ScriptletCall {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = args.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(',') => current.push(','),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    let mut parts = parts.into_iter().map(|part| unquote(part.trim()).to_string());
    let name = parts.next().unwrap_or_default();
    ScriptletCall {
        name,
        args: parts.collect(),
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn generic_key(selector: &str) -> GenericKey {
    let simple_token = |rest: &str| -> Option<String> {
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(rest.len());
        (end > 0).then(|| rest[..end].to_string())
    };

    if let Some(rest) = selector.strip_prefix('.') {
        if let Some(token) = simple_token(rest) {
            return GenericKey::Class(token);
        }
    }
    if let Some(rest) = selector.strip_prefix('#') {
        if let Some(token) = simple_token(rest) {
            return GenericKey::Id(token);
        }
    }
    if let Some(value) = href_value(selector) {
        return GenericKey::Href(value);
    }
    GenericKey::Base
}

/// `a[href^="https://ads."]` style selectors carry the link fragment.
fn href_value(selector: &str) -> Option<String> {
    let start = selector.find("[href")?;
    let rest = &selector[start + "[href".len()..];
    let eq = rest.find('=')?;
    let value = rest[eq + 1..].split(']').next()?;
    let value = unquote(value.trim());
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hide_and_exception() {
        let filter = CosmeticFilter::parse("example.com,~www.example.com##.ad-banner").unwrap();
        assert_eq!(filter.hostnames, vec!["example.com"]);
        assert_eq!(filter.not_hostnames, vec!["www.example.com"]);
        assert_eq!(filter.kind, CosmeticKind::Hide);
        assert!(filter.applies_to("shop.example.com"));
        assert!(!filter.applies_to("www.example.com"));

        let filter = CosmeticFilter::parse("example.com#@#.ad-banner").unwrap();
        assert!(filter.unhide);
    }

    #[test]
    fn parses_scriptlets() {
        let filter =
            CosmeticFilter::parse("example.com##+js(set-constant, ads.enabled, false)").unwrap();
        let call = filter.scriptlet().unwrap();
        assert_eq!(call.name, "set-constant");
        assert_eq!(call.args, vec!["ads.enabled", "false"]);

        let filter = CosmeticFilter::parse("a.com##+js(rpnt.js, '#text', 'a\\,b')").unwrap();
        let call = filter.scriptlet().unwrap();
        assert_eq!(call.canonical_name(), "rpnt");
        assert_eq!(call.args, vec!["#text", "a,b"]);

        let filter = CosmeticFilter::parse("a.com#@#+js()").unwrap();
        assert_eq!(filter.scriptlet().unwrap().name, "");
        assert!(CosmeticFilter::parse("a.com##+js()").is_err());
    }

    #[test]
    fn classifies_style_extended_and_html() {
        let filter = CosmeticFilter::parse("a.com##.x:style(opacity: 0 !important)").unwrap();
        assert_eq!(filter.kind, CosmeticKind::Style("opacity: 0 !important".to_string()));
        assert_eq!(filter.selector, ".x");

        let filter = CosmeticFilter::parse("a.com##div:has-text(Sponsored)").unwrap();
        assert_eq!(filter.kind, CosmeticKind::Extended);

        let filter = CosmeticFilter::parse("a.com#?#div:-abp-has(.ad)").unwrap();
        assert_eq!(filter.kind, CosmeticKind::Extended);

        let filter = CosmeticFilter::parse("a.com##^script:has-text(adblock)").unwrap();
        assert_eq!(filter.kind, CosmeticKind::Html);
    }

    #[test]
    fn rejects_css_injection() {
        assert!(CosmeticFilter::parse("##.a{color:red}").is_err());
        assert!(CosmeticFilter::parse("a.com##.x:style(} body {display:none)").is_err());
        assert!(CosmeticFilter::parse("bad host##.x").is_err());
    }

    #[test]
    fn entity_hostnames() {
        let filter = CosmeticFilter::parse("google.*##.ad").unwrap();
        assert!(filter.applies_to("www.google.co.uk"));
        assert!(filter.applies_to("google.de"));
        assert!(!filter.applies_to("notgoogle.com"));
    }

    #[test]
    fn generic_keys() {
        assert_eq!(generic_key(".ad-box"), GenericKey::Class("ad-box".to_string()));
        assert_eq!(generic_key("#sponsor > div"), GenericKey::Id("sponsor".to_string()));
        assert_eq!(
            generic_key("a[href^=\"https://ads.example/\"]"),
            GenericKey::Href("https://ads.example/".to_string())
        );
        assert_eq!(generic_key("div[data-ad]"), GenericKey::Base);
    }
}
