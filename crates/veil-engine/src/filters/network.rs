//! Network filter parsing and matching.

use std::net::IpAddr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::FilterParseError;
use crate::psl::is_same_or_subdomain;
use crate::types::{FilterAction, FilterFlags, PartyMask, Request, RequestType};
use crate::url::{get_host_position, is_boundary_char};

/// `$domain=` constraint, as hostnames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DomainConstraint {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl DomainConstraint {
    /// Whether a request initiated from `hostname` passes the constraint.
    pub fn allows(&self, hostname: &str) -> bool {
        if self.exclude.iter().any(|d| is_same_or_subdomain(hostname, d)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|d| is_same_or_subdomain(hostname, d))
    }
}

/// A parsed network filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkFilter {
    /// Source text, as written in the list
    pub raw: String,
    pub action: FilterAction,
    pub flags: FilterFlags,
    /// Hostname for `||host^`-style filters
    pub hostname: Option<String>,
    /// Remaining URL pattern (`*` and `^` wildcards), or regex source
    pub pattern: String,
    /// Empty mask matches every request type
    pub type_mask: RequestType,
    /// Empty mask matches both parties
    pub party_mask: PartyMask,
    pub domains: Option<DomainConstraint>,
    pub redirect: Option<String>,
    pub csp: Option<String>,
}

impl NetworkFilter {
    pub fn parse(line: &str) -> Result<Self, FilterParseError> {
        let raw = line.trim();
        if raw.is_empty() {
            return Err(FilterParseError::Empty);
        }

        let mut line = raw;
        let mut action = FilterAction::Block;
        if let Some(rest) = line.strip_prefix("@@") {
            action = FilterAction::Allow;
            line = rest.trim_start();
        }

        let (pattern_part, options_text) = split_rule_options(line);
        let options = match options_text {
            Some(options_text) => parse_options(options_text)?,
            None => ParsedOptions::default(),
        };

        let mut flags = options.flags;
        if options.redirect.is_some() && action == FilterAction::Allow {
            // @@...$redirect-rule cancels redirects rather than allowing the request
            flags |= FilterFlags::REDIRECT_RULE;
        }

        let pattern_str = pattern_part.trim();
        if pattern_str.contains(char::is_whitespace) {
            if let Some(domain) = parse_hosts_file_domain(pattern_str) {
                return Ok(Self {
                    raw: raw.to_string(),
                    action,
                    flags: flags | FilterFlags::HAS_HOST_ANCHOR,
                    hostname: Some(domain),
                    pattern: String::new(),
                    type_mask: options.type_mask,
                    party_mask: options.party_mask,
                    domains: options.domain_constraints,
                    redirect: options.redirect,
                    csp: options.csp,
                });
            }
            return Err(FilterParseError::InvalidPattern);
        }

        let parsed = parse_pattern(pattern_str)?;
        flags |= parsed.flags;

        let unrestricted = parsed.hostname.is_none()
            && parsed.pattern.is_empty()
            && options.domain_constraints.is_none()
            && options.type_mask.is_empty()
            && options.party_mask.is_empty()
            && options.csp.is_none()
            && !flags.intersects(FilterFlags::GENERICHIDE | FilterFlags::ELEMHIDE);
        if unrestricted {
            return Err(FilterParseError::InvalidPattern);
        }

        Ok(Self {
            raw: raw.to_string(),
            action,
            flags,
            hostname: parsed.hostname,
            pattern: parsed.pattern,
            type_mask: options.type_mask,
            party_mask: options.party_mask,
            domains: options.domain_constraints,
            redirect: options.redirect,
            csp: options.csp,
        })
    }

    pub fn is_exception(&self) -> bool {
        self.action == FilterAction::Allow
    }

    pub fn is_important(&self) -> bool {
        self.flags.contains(FilterFlags::IMPORTANT)
    }

    pub fn is_regex(&self) -> bool {
        self.flags.contains(FilterFlags::IS_REGEX)
    }

    pub fn is_csp(&self) -> bool {
        self.csp.is_some()
    }

    /// Filters that only toggle cosmetic behaviour for a page.
    pub fn is_cosmetic_exception(&self) -> bool {
        self.flags.intersects(FilterFlags::GENERICHIDE | FilterFlags::ELEMHIDE)
    }

    /// Compile the regex for `/.../` filters.
    pub fn compile_regex(&self) -> Option<Result<Regex, regex::Error>> {
        if !self.is_regex() {
            return None;
        }
        let source = if self.flags.contains(FilterFlags::MATCH_CASE) {
            self.pattern.clone()
        } else {
            format!("(?i){}", self.pattern)
        };
        Some(Regex::new(&source))
    }

    /// Match a request against this filter. `regex` must be the compiled
    /// pattern for regex filters.
    pub fn matches(&self, request: &Request, regex: Option<&Regex>) -> bool {
        if !self.type_mask.is_empty() && !self.type_mask.intersects(request.request_type) {
            return false;
        }
        if self.csp.is_some() && !request.request_type.intersects(RequestType::DOCUMENT) {
            return false;
        }

        if !self.party_mask.is_empty() {
            let party = if request.is_third_party {
                PartyMask::THIRD_PARTY
            } else {
                PartyMask::FIRST_PARTY
            };
            if !self.party_mask.contains(party) {
                return false;
            }
        }

        if let Some(constraint) = &self.domains {
            if !constraint.allows(&request.source_hostname) {
                return false;
            }
        }

        self.matches_url(request, regex)
    }

    fn matches_url(&self, request: &Request, regex: Option<&Regex>) -> bool {
        let url = request.url.as_str();
        let case_sensitive = self.flags.contains(FilterFlags::MATCH_CASE);
        let anchored_end = self.flags.contains(FilterFlags::HAS_RIGHT_ANCHOR);

        if self.is_regex() {
            return regex.map_or(false, |re| re.is_match(url));
        }

        if let Some(hostname) = &self.hostname {
            if !is_same_or_subdomain(&request.hostname, hostname) {
                return false;
            }
            if self.pattern.is_empty() {
                return true;
            }
            let host_end = match get_host_position(url) {
                Some((_, end)) => end,
                None => return false,
            };
            let rest = skip_port(&url.as_bytes()[host_end..]);
            return glob_match(self.pattern.as_bytes(), rest, anchored_end, case_sensitive);
        }

        let pattern = self.pattern.as_bytes();
        let text = url.as_bytes();

        if self.flags.contains(FilterFlags::HAS_HOST_ANCHOR) {
            let (host_start, host_end) = match get_host_position(url) {
                Some(pos) => pos,
                None => return false,
            };
            return (host_start..host_end)
                .filter(|&pos| pos == host_start || text[pos - 1] == b'.')
                .any(|pos| glob_match(pattern, &text[pos..], anchored_end, case_sensitive));
        }

        if self.flags.contains(FilterFlags::HAS_LEFT_ANCHOR) {
            return glob_match(pattern, text, anchored_end, case_sensitive);
        }

        if pattern.is_empty() {
            return true;
        }
        (0..text.len())
            .any(|start| glob_match(pattern, &text[start..], anchored_end, case_sensitive))
    }
}

fn skip_port(rest: &[u8]) -> &[u8] {
    if rest.first() != Some(&b':') {
        return rest;
    }
    let digits = rest[1..].iter().take_while(|b| b.is_ascii_digit()).count();
    &rest[1 + digits..]
}

/// ABP glob match anchored at the start of `text`.
///
/// `*` matches any run, `^` matches one separator or the end of the URL.
fn glob_match(pattern: &[u8], text: &[u8], anchored_end: bool, case_sensitive: bool) -> bool {
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    loop {
        if pi < pattern.len() {
            match pattern[pi] {
                b'*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                b'^' => {
                    if ti < text.len() && is_boundary_char(text[ti]) {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                    if ti == text.len() {
                        pi += 1;
                        continue;
                    }
                }
                c => {
                    let equal = ti < text.len()
                        && if case_sensitive {
                            text[ti] == c
                        } else {
                            text[ti].eq_ignore_ascii_case(&c)
                        };
                    if equal {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        } else if !anchored_end || ti == text.len() {
            return true;
        }

        match star {
            Some((sp, st)) if st < text.len() => {
                star = Some((sp, st + 1));
                pi = sp + 1;
                ti = st + 1;
            }
            _ => return false,
        }
    }
}

// =============================================================================
// Option parsing
// =============================================================================

#[derive(Clone, Default)]
struct ParsedOptions {
    flags: FilterFlags,
    type_mask: RequestType,
    party_mask: PartyMask,
    domain_constraints: Option<DomainConstraint>,
    redirect: Option<String>,
    csp: Option<String>,
}

fn split_rule_options(line: &str) -> (&str, Option<&str>) {
    // regex filters may contain `$` themselves
    if line.starts_with('/') && line.len() > 1 {
        if line.ends_with('/') {
            return (line, None);
        }
        if let Some(pos) = line.rfind("/$").filter(|&pos| pos > 0) {
            return (&line[..pos + 1], Some(&line[pos + 2..]));
        }
    }
    match line.find('$') {
        Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
        None => (line, None),
    }
}

fn parse_options(text: &str) -> Result<ParsedOptions, FilterParseError> {
    let mut flags = FilterFlags::empty();
    let mut type_include = 0u32;
    let mut type_exclude = 0u32;
    let mut party_include = 0u8;
    let mut party_exclude = 0u8;
    let mut domain_constraints: Option<DomainConstraint> = None;
    let mut redirect: Option<String> = None;
    let mut csp: Option<String> = None;

    for raw in text.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        // csp values are case-sensitive, everything else is not
        if let Some(value) = raw.strip_prefix("csp=") {
            csp = Some(value.to_string());
            continue;
        }

        let raw_lower = raw.to_ascii_lowercase();
        let raw_lower = raw_lower.as_str();

        match raw_lower {
            "important" => {
                flags |= FilterFlags::IMPORTANT;
                continue;
            }
            "match-case" | "match_case" => {
                flags |= FilterFlags::MATCH_CASE;
                continue;
            }
            "generichide" | "ghide" => {
                flags |= FilterFlags::GENERICHIDE;
                continue;
            }
            "elemhide" | "ehide" => {
                flags |= FilterFlags::ELEMHIDE;
                continue;
            }
            "badfilter" => {
                flags |= FilterFlags::BADFILTER;
                continue;
            }
            "csp" => {
                csp = Some(String::new());
                continue;
            }
            _ => {}
        }

        if let Some(domain_value) = raw_lower
            .strip_prefix("domain=")
            .or_else(|| raw_lower.strip_prefix("from="))
        {
            let parsed = parse_domain_option(domain_value)?;
            domain_constraints = Some(merge_constraints(domain_constraints, parsed));
            continue;
        }

        if let Some(redirect_value) = raw_lower.strip_prefix("redirect=") {
            if !redirect_value.is_empty() {
                redirect = Some(redirect_value.to_string());
            }
            continue;
        }

        if let Some(redirect_value) = raw_lower.strip_prefix("redirect-rule=") {
            if !redirect_value.is_empty() {
                redirect = Some(redirect_value.to_string());
                flags |= FilterFlags::REDIRECT_RULE;
            }
            continue;
        }

        let (negated, name) = match raw_lower.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw_lower),
        };

        if let Some(mask) = request_type_mask(name) {
            if negated {
                type_exclude |= mask;
            } else {
                type_include |= mask;
            }
            continue;
        }

        if let Some(mask) = party_mask(name) {
            if negated {
                party_exclude |= mask;
            } else {
                party_include |= mask;
            }
            continue;
        }

        return Err(FilterParseError::UnsupportedOption(raw.to_string()));
    }

    let all_types = RequestType::all().bits();
    let type_bits = finalize_mask(type_include, type_exclude, all_types)?;
    let all_parties = PartyMask::ALL.bits() as u32;
    let party_bits = finalize_mask(party_include as u32, party_exclude as u32, all_parties)?;

    Ok(ParsedOptions {
        flags,
        type_mask: RequestType::from_bits_truncate(type_bits),
        party_mask: PartyMask::from_bits_truncate(party_bits as u8),
        domain_constraints,
        redirect,
        csp,
    })
}

fn merge_constraints(
    existing: Option<DomainConstraint>,
    incoming: DomainConstraint,
) -> DomainConstraint {
    match existing {
        Some(mut current) => {
            current.include.extend(incoming.include);
            current.exclude.extend(incoming.exclude);
            current
        }
        None => incoming,
    }
}

fn parse_domain_option(value: &str) -> Result<DomainConstraint, FilterParseError> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();

    for raw in value.split('|') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let (is_exclude, domain_raw) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let domain = normalize_domain(domain_raw)
            .ok_or_else(|| FilterParseError::InvalidDomain(domain_raw.to_string()))?;

        if is_exclude {
            exclude.push(domain);
        } else {
            include.push(domain);
        }
    }

    if include.is_empty() && exclude.is_empty() {
        return Err(FilterParseError::InvalidDomain(value.to_string()));
    }

    Ok(DomainConstraint { include, exclude })
}

/// Combine include/exclude bits; an all-bits mask collapses to "any".
fn finalize_mask(include: u32, exclude: u32, all: u32) -> Result<u32, FilterParseError> {
    let include = include & all;
    let exclude = exclude & all;
    let mask = if include != 0 { include & !exclude } else { all & !exclude };
    if mask == 0 {
        return Err(FilterParseError::EmptyMask);
    }
    Ok(if mask == all { 0 } else { mask })
}

fn request_type_mask(name: &str) -> Option<u32> {
    let ty = match name {
        "script" => RequestType::SCRIPT,
        "image" => RequestType::IMAGE,
        "stylesheet" | "css" => RequestType::STYLESHEET,
        "object" => RequestType::OBJECT,
        "subdocument" | "frame" => RequestType::SUBDOCUMENT,
        "document" | "doc" | "main_frame" => RequestType::MAIN_FRAME,
        "xmlhttprequest" | "xhr" | "fetch" => RequestType::XMLHTTPREQUEST,
        "media" => RequestType::MEDIA,
        "font" => RequestType::FONT,
        "ping" | "beacon" => RequestType::PING,
        "websocket" => RequestType::WEBSOCKET,
        "csp_report" => RequestType::CSP_REPORT,
        "other" => RequestType::OTHER,
        "all" => RequestType::all(),
        _ => return None,
    };
    Some(ty.bits())
}

fn party_mask(name: &str) -> Option<u8> {
    match name {
        "third-party" | "thirdparty" | "3p" => Some(PartyMask::THIRD_PARTY.bits()),
        "first-party" | "firstparty" | "1p" => Some(PartyMask::FIRST_PARTY.bits()),
        _ => None,
    }
}

// =============================================================================
// Pattern parsing
// =============================================================================

struct ParsedPattern {
    flags: FilterFlags,
    hostname: Option<String>,
    pattern: String,
}

fn parse_pattern(line: &str) -> Result<ParsedPattern, FilterParseError> {
    if line.len() > 2 && line.starts_with('/') && line.ends_with('/') {
        let source = &line[1..line.len() - 1];
        Regex::new(source).map_err(|e| FilterParseError::InvalidRegex(e.to_string()))?;
        return Ok(ParsedPattern {
            flags: FilterFlags::IS_REGEX,
            hostname: None,
            pattern: source.to_string(),
        });
    }

    let mut flags = FilterFlags::empty();
    let mut rest = line;

    if let Some(stripped) = rest.strip_prefix("||") {
        flags |= FilterFlags::HAS_HOST_ANCHOR;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('|') {
        flags |= FilterFlags::HAS_LEFT_ANCHOR;
        rest = stripped;
    }

    if let Some(stripped) = rest.strip_suffix('|') {
        flags |= FilterFlags::HAS_RIGHT_ANCHOR;
        rest = stripped;
    }

    let rest = rest.trim_start_matches('*');
    let rest = if rest.chars().all(|c| c == '*') { "" } else { rest };

    if flags.contains(FilterFlags::HAS_HOST_ANCHOR) {
        if let Some((hostname, remainder)) = split_host_anchor(rest) {
            return Ok(ParsedPattern {
                flags,
                hostname: Some(hostname),
                pattern: remainder.to_string(),
            });
        }
    }

    Ok(ParsedPattern {
        flags,
        hostname: None,
        pattern: rest.to_string(),
    })
}

/// Split `ads.example.com^/path` into the hostname and the rest of the
/// pattern. Returns `None` for wildcard hosts such as `ads*.example.com`.
fn split_host_anchor(rest: &str) -> Option<(String, &str)> {
    let rest = rest.strip_prefix('.').unwrap_or(rest);
    let end = rest
        .bytes()
        .position(|b| !(b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_'))
        .unwrap_or(rest.len());

    let remainder = &rest[end..];
    match remainder.bytes().next() {
        None | Some(b'^') | Some(b'/') | Some(b':') | Some(b'?') => {}
        _ => return None,
    }

    let hostname = normalize_domain(&rest[..end])?;
    Some((hostname, remainder))
}

fn parse_hosts_file_domain(line: &str) -> Option<String> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;
    let second = parts.next()?;

    if first.parse::<IpAddr>().is_ok() {
        return normalize_domain(second);
    }

    None
}

pub(crate) fn normalize_domain(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
    {
        return None;
    }

    Some(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, source: &str, ty: &str) -> Request {
        Request::new(url, Some(source), ty)
    }

    fn matches(filter: &str, req: &Request) -> bool {
        let filter = NetworkFilter::parse(filter).expect("filter should parse");
        let regex = filter.compile_regex().map(|r| r.expect("regex should compile"));
        filter.matches(req, regex.as_ref())
    }

    #[test]
    fn parses_host_anchor_with_path() {
        let filter = NetworkFilter::parse("||ads.example.com/banner/*$script,third-party").unwrap();
        assert_eq!(filter.hostname.as_deref(), Some("ads.example.com"));
        assert_eq!(filter.pattern, "/banner/*");
        assert_eq!(filter.type_mask, RequestType::SCRIPT);
        assert_eq!(filter.party_mask, PartyMask::THIRD_PARTY);
    }

    #[test]
    fn host_anchor_matches_subdomains_only() {
        let req = request("https://cdn.ads.example.com/x.js", "https://site.com/", "script");
        assert!(matches("||ads.example.com^", &req));
        assert!(!matches("||badads.example.com^", &req));

        let other = request("https://notads.example.com/x.js", "https://site.com/", "script");
        assert!(!matches("||ads.example.com^", &other));
    }

    #[test]
    fn separator_and_wildcards() {
        let req = request(
            "https://example.com/ads/banner.png?x=1",
            "https://example.com/",
            "image",
        );
        assert!(matches("/ads/*.png", &req));
        assert!(matches("banner.png^", &req));
        assert!(!matches("banner.pn^", &req));
        assert!(matches("|https://example.com/ads", &req));
        assert!(!matches("|http://example.com/ads", &req));
        assert!(matches("x=1|", &req));
        assert!(!matches("x=|", &req));
    }

    #[test]
    fn options_restrict_type_party_and_domain() {
        let req = request("https://tracker.net/t.js", "https://news.com/", "script");
        assert!(matches("||tracker.net^$script,domain=news.com", &req));
        assert!(!matches("||tracker.net^$image", &req));
        assert!(!matches("||tracker.net^$first-party", &req));
        assert!(!matches("||tracker.net^$domain=~news.com", &req));
        assert!(matches("||tracker.net^$~image", &req));
    }

    #[test]
    fn regex_filters() {
        let req = request("https://example.com/ad123.js", "https://example.com/", "script");
        assert!(matches("/ad[0-9]+\\.js/", &req));
        assert!(matches("/AD[0-9]+/$script", &req));
        assert!(!matches("/AD[0-9]+/$match-case", &req));
    }

    #[test]
    fn rejects_unknown_options_and_bad_domains() {
        assert_eq!(
            NetworkFilter::parse("||a.com^$popunder-magic"),
            Err(FilterParseError::UnsupportedOption("popunder-magic".to_string()))
        );
        assert!(matches!(
            NetworkFilter::parse("||a.com^$domain=bad/host"),
            Err(FilterParseError::InvalidDomain(_))
        ));
        assert_eq!(NetworkFilter::parse("||a.com^$~all"), Err(FilterParseError::EmptyMask));
        assert_eq!(NetworkFilter::parse("*"), Err(FilterParseError::InvalidPattern));
    }

    #[test]
    fn hosts_file_lines() {
        let filter = NetworkFilter::parse("0.0.0.0 tracker.example").unwrap();
        assert_eq!(filter.hostname.as_deref(), Some("tracker.example"));
    }

    #[test]
    fn exception_and_redirect_options() {
        let filter = NetworkFilter::parse("@@||cdn.com^$generichide").unwrap();
        assert!(filter.is_exception());
        assert!(filter.is_cosmetic_exception());

        let filter = NetworkFilter::parse("||ads.com/ad.js$script,redirect=noop.js").unwrap();
        assert_eq!(filter.redirect.as_deref(), Some("noop.js"));
        assert!(!filter.flags.contains(FilterFlags::REDIRECT_RULE));
    }
}
