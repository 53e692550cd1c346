//! Indexed filter lists and the matching interface shared by leaf lists and
//! composite engines.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::filters::{
    parse_filters, CosmeticFilter, CosmeticKind, GenericKey, LineError, NetworkFilter,
    ScriptletCall,
};
use crate::hash::content_digest;
use crate::psl::{get_etld1, get_parent_domain, walk_host_suffixes};
use crate::resources;
use crate::types::{FilterAction, FilterFlags, MatchDecision, MatchResult, Request};
use crate::url::extract_host;

// =============================================================================
// Queries and results
// =============================================================================

/// A matching network filter and the list it came from.
#[derive(Debug, Clone, Copy)]
pub struct NetworkCandidate<'a> {
    pub filter: &'a NetworkFilter,
    pub list: &'a str,
}

/// What a content script asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CosmeticQuery {
    pub url: String,
    pub hostname: String,
    pub domain: String,
    /// Class names observed in the DOM
    pub classes: Vec<String>,
    /// Element ids observed in the DOM
    pub ids: Vec<String>,
    /// Link targets observed in the DOM
    pub hrefs: Vec<String>,
    pub get_base_rules: bool,
    pub get_injection_rules: bool,
    pub get_extended_rules: bool,
    pub get_rules_from_hostname: bool,
    pub get_rules_from_dom: bool,
}

impl CosmeticQuery {
    /// One-time pass on navigation: base styles, hostname rules, scriptlets
    /// and extended selectors.
    pub fn bootstrap(url: &str) -> Self {
        let hostname = extract_host(url).unwrap_or("").to_ascii_lowercase();
        Self {
            url: url.to_string(),
            domain: get_etld1(&hostname),
            hostname,
            get_base_rules: true,
            get_injection_rules: true,
            get_extended_rules: true,
            get_rules_from_hostname: true,
            ..Default::default()
        }
    }

    /// Incremental pass over newly observed classes, ids and links.
    pub fn dom(url: &str, classes: Vec<String>, ids: Vec<String>, hrefs: Vec<String>) -> Self {
        let hostname = extract_host(url).unwrap_or("").to_ascii_lowercase();
        Self {
            url: url.to_string(),
            domain: get_etld1(&hostname),
            hostname,
            classes,
            ids,
            hrefs,
            get_rules_from_dom: true,
            ..Default::default()
        }
    }
}

/// Cosmetic rules for a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosmeticMatch {
    /// Stylesheet text to inject
    pub styles: String,
    pub scriptlets: Vec<ScriptletCall>,
    /// Procedural selectors for the in-page evaluator
    pub extended: Vec<String>,
    /// False when `$generichide` applies to the page
    pub enable_generic: bool,
}

impl CosmeticMatch {
    pub fn is_empty(&self) -> bool {
        self.styles.is_empty() && self.scriptlets.is_empty() && self.extended.is_empty()
    }
}

/// Content rewrites for a document response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMatch {
    /// CSP directives to append
    pub csp: Vec<String>,
    /// HTML filter selectors to remove from the body
    pub html: Vec<String>,
}

// =============================================================================
// FilterIndex
// =============================================================================

/// Matching interface. Leaf lists collect their own matches; composites
/// collect across members, and precedence is always resolved over the full
/// candidate set.
pub trait FilterIndex {
    /// Push every network filter matching `request`.
    fn collect_network<'a>(&'a self, request: &Request, out: &mut Vec<NetworkCandidate<'a>>);

    /// Push every cosmetic filter relevant to `query`, exceptions included.
    fn collect_cosmetics<'a>(&'a self, query: &CosmeticQuery, out: &mut Vec<&'a CosmeticFilter>);

    fn match_request(&self, request: &Request) -> MatchResult {
        let mut candidates = Vec::new();
        self.collect_network(request, &mut candidates);
        apply_precedence(&candidates)
    }

    fn match_cosmetics(&self, query: &CosmeticQuery) -> CosmeticMatch {
        let page = Request::new(&query.url, None, "main_frame");
        let mut network = Vec::new();
        self.collect_network(&page, &mut network);

        let (mut elemhide, mut generichide) = (false, false);
        for c in network.iter().filter(|c| c.filter.is_exception()) {
            elemhide |= c.filter.flags.contains(FilterFlags::ELEMHIDE);
            generichide |= c.filter.flags.contains(FilterFlags::GENERICHIDE);
        }

        let mut cosmetic = Vec::new();
        self.collect_cosmetics(query, &mut cosmetic);
        resolve_cosmetics(query, &cosmetic, elemhide, generichide)
    }

    fn match_response(&self, request: &Request) -> ResponseMatch {
        let mut result = ResponseMatch::default();

        let mut network = Vec::new();
        self.collect_network(request, &mut network);
        let mut csp_exceptions: HashSet<&str> = HashSet::new();
        let mut csp_disabled = false;
        for c in network.iter().filter(|c| c.filter.is_exception()) {
            match c.filter.csp.as_deref() {
                Some("") => csp_disabled = true,
                Some(value) => {
                    csp_exceptions.insert(value);
                }
                None => {}
            }
        }
        if !csp_disabled {
            for c in &network {
                if let Some(csp) = c.filter.csp.as_deref() {
                    let keep = !c.filter.is_exception()
                        && !csp.is_empty()
                        && !csp_exceptions.contains(csp)
                        && !result.csp.iter().any(|existing| existing == csp);
                    if keep {
                        result.csp.push(csp.to_string());
                    }
                }
            }
        }

        let query = CosmeticQuery::bootstrap(&request.url);
        let mut cosmetic = Vec::new();
        self.collect_cosmetics(&query, &mut cosmetic);
        let unhidden: HashSet<&str> = cosmetic
            .iter()
            .filter(|f| f.unhide && f.kind == CosmeticKind::Html)
            .map(|f| f.selector.as_str())
            .collect();
        for filter in cosmetic {
            let keep = filter.kind == CosmeticKind::Html
                && !filter.unhide
                && !filter.is_generic()
                && !unhidden.contains(filter.selector.as_str())
                && !result.html.contains(&filter.selector);
            if keep {
                result.html.push(filter.selector.clone());
            }
        }

        result
    }
}

/// Precedence: important allow > important block > allow > block. Redirects
/// attach to a block decision unless excepted by `@@...$redirect-rule`.
pub fn apply_precedence(candidates: &[NetworkCandidate<'_>]) -> MatchResult {
    let mut best_important_allow: Option<&NetworkCandidate<'_>> = None;
    let mut best_important_block: Option<&NetworkCandidate<'_>> = None;
    let mut best_allow: Option<&NetworkCandidate<'_>> = None;
    let mut best_block: Option<&NetworkCandidate<'_>> = None;
    let mut best_redirect: Option<&NetworkCandidate<'_>> = None;
    let mut redirect_exceptions: HashSet<&str> = HashSet::new();

    for c in candidates {
        let filter = c.filter;
        if filter.is_csp() || filter.is_cosmetic_exception() {
            continue;
        }
        match filter.action {
            FilterAction::Allow => {
                if filter.flags.contains(FilterFlags::REDIRECT_RULE) {
                    redirect_exceptions.insert(filter.redirect.as_deref().unwrap_or("*"));
                    continue;
                }
                if filter.is_important() {
                    best_important_allow.get_or_insert(c);
                } else {
                    best_allow.get_or_insert(c);
                }
            }
            FilterAction::Block => {
                if filter.redirect.is_some() {
                    best_redirect.get_or_insert(c);
                }
                if filter.flags.contains(FilterFlags::REDIRECT_RULE) {
                    continue;
                }
                if filter.is_important() {
                    best_important_block.get_or_insert(c);
                } else {
                    best_block.get_or_insert(c);
                }
            }
        }
    }

    let decided = |c: &NetworkCandidate<'_>, decision: MatchDecision| MatchResult {
        decision,
        filter: Some(c.filter.raw.clone()),
        list: Some(c.list.to_string()),
        redirect: None,
    };

    if let Some(c) = best_important_allow {
        return decided(c, MatchDecision::Allow);
    }

    let block = match best_important_block {
        Some(c) => c,
        None => {
            if let Some(c) = best_allow {
                return decided(c, MatchDecision::Allow);
            }
            match best_block {
                Some(c) => c,
                None => return MatchResult::default(),
            }
        }
    };

    // Prefer the blocking filter's own redirect over a redirect-rule
    let redirect_source = if block.filter.redirect.is_some() {
        Some(block)
    } else {
        best_redirect
    };
    let redirect = redirect_source
        .and_then(|c| c.filter.redirect.as_deref())
        .filter(|name| !redirect_exceptions.contains("*") && !redirect_exceptions.contains(name))
        .and_then(resources::lookup);

    match redirect {
        Some(redirect) => MatchResult {
            decision: MatchDecision::Redirect,
            redirect: Some(redirect),
            ..decided(block, MatchDecision::Redirect)
        },
        None => decided(block, MatchDecision::Block),
    }
}

fn resolve_cosmetics(
    query: &CosmeticQuery,
    filters: &[&CosmeticFilter],
    elemhide: bool,
    generichide: bool,
) -> CosmeticMatch {
    let mut result = CosmeticMatch {
        enable_generic: !generichide,
        ..Default::default()
    };

    let mut unhidden: HashSet<&str> = HashSet::new();
    let mut scriptlet_exceptions: HashSet<&ScriptletCall> = HashSet::new();
    let mut scriptlets_disabled = false;
    for filter in filters.iter().filter(|f| f.unhide) {
        match filter.scriptlet() {
            Some(call) if call.name.is_empty() => scriptlets_disabled = true,
            Some(call) => {
                scriptlet_exceptions.insert(call);
            }
            None => {
                unhidden.insert(filter.selector.as_str());
            }
        }
    }

    let mut hide: Vec<&str> = Vec::new();
    let mut styles: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for filter in filters.iter().filter(|f| !f.unhide) {
        let generic = filter.is_generic();
        if generic && generichide {
            continue;
        }
        let wanted = if !generic {
            query.get_rules_from_hostname
        } else if filter.kind == CosmeticKind::Hide && filter.generic_key() != GenericKey::Base {
            // collected only when the DOM reported the key
            true
        } else {
            query.get_base_rules
        };
        if !wanted || !seen.insert(filter.raw.as_str()) {
            continue;
        }

        let visible = !elemhide && !unhidden.contains(filter.selector.as_str());
        match &filter.kind {
            CosmeticKind::Hide if visible => {
                if !hide.contains(&filter.selector.as_str()) {
                    hide.push(&filter.selector);
                }
            }
            CosmeticKind::Style(css) if visible => {
                styles.push(format!("{} {{ {} }}", filter.selector, css));
            }
            CosmeticKind::Extended if query.get_extended_rules && visible => {
                result.extended.push(filter.selector.clone());
            }
            CosmeticKind::Scriptlet(call)
                if query.get_injection_rules
                    && !scriptlets_disabled
                    && !scriptlet_exceptions.contains(call) =>
            {
                if !result.scriptlets.contains(call) {
                    result.scriptlets.push(call.clone());
                }
            }
            _ => {}
        }
    }

    let mut css = String::new();
    if !hide.is_empty() {
        css.push_str(&hide.join(",\n"));
        css.push_str("{display:none !important;}");
    }
    for style in styles {
        if !css.is_empty() {
            css.push('\n');
        }
        css.push_str(&style);
    }
    result.styles = css;
    result
}

// =============================================================================
// FilterList
// =============================================================================

#[derive(Debug, Default, Clone)]
struct NetworkIndex {
    by_host: HashMap<String, Vec<usize>>,
    unindexed: Vec<usize>,
    regexes: HashMap<usize, Regex>,
}

#[derive(Debug, Default, Clone)]
struct CosmeticIndex {
    by_host: HashMap<String, Vec<usize>>,
    classes: HashMap<String, Vec<usize>>,
    ids: HashMap<String, Vec<usize>>,
    hrefs: Vec<(String, usize)>,
    generic: Vec<usize>,
}

/// Stats from badfilter removal and deduplication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub before: usize,
    pub after: usize,
    pub deduped: usize,
    pub badfiltered: usize,
}

/// One compiled filter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ListData")]
pub struct FilterList {
    name: String,
    digest: u64,
    network: Vec<NetworkFilter>,
    cosmetic: Vec<CosmeticFilter>,
    #[serde(skip)]
    network_index: NetworkIndex,
    #[serde(skip)]
    cosmetic_index: CosmeticIndex,
}

#[derive(Deserialize)]
struct ListData {
    name: String,
    digest: u64,
    network: Vec<NetworkFilter>,
    cosmetic: Vec<CosmeticFilter>,
}

impl From<ListData> for FilterList {
    fn from(data: ListData) -> Self {
        let mut list = Self {
            name: data.name,
            digest: data.digest,
            network: data.network,
            cosmetic: data.cosmetic,
            network_index: NetworkIndex::default(),
            cosmetic_index: CosmeticIndex::default(),
        };
        list.build_indexes();
        list
    }
}

impl FilterList {
    /// Parse list text. Lines that fail to parse are returned, not fatal.
    pub fn parse(name: &str, text: &str) -> (Self, Vec<LineError>) {
        let parsed = parse_filters(text);
        let list = Self::from_filters(name, content_digest(text), parsed.network, parsed.cosmetic);
        (list, parsed.errors)
    }

    pub fn from_filters(
        name: &str,
        digest: u64,
        network: Vec<NetworkFilter>,
        cosmetic: Vec<CosmeticFilter>,
    ) -> Self {
        let mut network = network;
        let stats = optimize_filters(&mut network);
        if stats.badfiltered > 0 || stats.deduped > 0 {
            log::debug!(
                "{name}: {} network filters kept of {} ({} badfiltered, {} duplicates)",
                stats.after,
                stats.before,
                stats.badfiltered,
                stats.deduped
            );
        }

        ListData {
            name: name.to_string(),
            digest,
            network,
            cosmetic,
        }
        .into()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// xxHash64 of the source text.
    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn network_filters(&self) -> &[NetworkFilter] {
        &self.network
    }

    pub fn cosmetic_filters(&self) -> &[CosmeticFilter] {
        &self.cosmetic
    }

    fn build_indexes(&mut self) {
        let mut network = NetworkIndex::default();
        for (idx, filter) in self.network.iter().enumerate() {
            if let Some(compiled) = filter.compile_regex() {
                match compiled {
                    Ok(re) => {
                        network.regexes.insert(idx, re);
                    }
                    Err(e) => {
                        log::warn!("{}: dropping regex filter {}: {e}", self.name, filter.raw);
                        continue;
                    }
                }
            }
            match &filter.hostname {
                Some(host) => network.by_host.entry(host.clone()).or_default().push(idx),
                None => network.unindexed.push(idx),
            }
        }

        let mut cosmetic = CosmeticIndex::default();
        for (idx, filter) in self.cosmetic.iter().enumerate() {
            if !filter.is_generic() {
                for host in &filter.hostnames {
                    cosmetic.by_host.entry(host.clone()).or_default().push(idx);
                }
                continue;
            }
            if filter.unhide || filter.kind != CosmeticKind::Hide {
                cosmetic.generic.push(idx);
                continue;
            }
            match filter.generic_key() {
                GenericKey::Class(name) => cosmetic.classes.entry(name).or_default().push(idx),
                GenericKey::Id(name) => cosmetic.ids.entry(name).or_default().push(idx),
                GenericKey::Href(value) => cosmetic.hrefs.push((value, idx)),
                GenericKey::Base => cosmetic.generic.push(idx),
            }
        }

        self.network_index = network;
        self.cosmetic_index = cosmetic;
    }
}

impl FilterIndex for FilterList {
    fn collect_network<'a>(&'a self, request: &Request, out: &mut Vec<NetworkCandidate<'a>>) {
        let index = &self.network_index;
        let mut push = |idx: usize| {
            let filter = &self.network[idx];
            if filter.matches(request, index.regexes.get(&idx)) {
                out.push(NetworkCandidate {
                    filter,
                    list: &self.name,
                });
            }
        };

        let mut host = Some(request.hostname.as_str()).filter(|h| !h.is_empty());
        while let Some(current) = host {
            if let Some(ids) = index.by_host.get(current) {
                ids.iter().copied().for_each(&mut push);
            }
            host = get_parent_domain(current);
        }
        index.unindexed.iter().copied().for_each(&mut push);
    }

    fn collect_cosmetics<'a>(&'a self, query: &CosmeticQuery, out: &mut Vec<&'a CosmeticFilter>) {
        let index = &self.cosmetic_index;
        let mut seen: HashSet<usize> = HashSet::new();
        let mut push = |idx: usize| {
            let filter = &self.cosmetic[idx];
            if seen.insert(idx) && filter.applies_to(&query.hostname) {
                out.push(filter);
            }
        };

        for key in hostname_keys(&query.hostname) {
            if let Some(ids) = index.by_host.get(&key) {
                ids.iter().copied().for_each(&mut push);
            }
        }
        index.generic.iter().copied().for_each(&mut push);

        if query.get_rules_from_dom {
            for class in &query.classes {
                if let Some(ids) = index.classes.get(class) {
                    ids.iter().copied().for_each(&mut push);
                }
            }
            for id in &query.ids {
                if let Some(ids) = index.ids.get(id) {
                    ids.iter().copied().for_each(&mut push);
                }
            }
            for (value, idx) in &index.hrefs {
                if query.hrefs.iter().any(|href| href.contains(value.as_str())) {
                    push(*idx);
                }
            }
        }
    }
}

/// Index keys a page hostname can match: itself, its parents and the
/// `name.*` entity forms above the public suffix.
fn hostname_keys(hostname: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if hostname.is_empty() {
        return keys;
    }

    let mut host = Some(hostname);
    while let Some(current) = host {
        keys.push(current.to_string());
        host = get_parent_domain(current);
    }

    let etld1 = get_etld1(hostname);
    if let Some((_, suffix)) = etld1.split_once('.') {
        for candidate in walk_host_suffixes(hostname) {
            if candidate.len() > suffix.len() + 1 {
                keys.push(format!("{}.*", &candidate[..candidate.len() - suffix.len() - 1]));
            }
        }
    }
    keys
}

/// Drop `$badfilter` targets and duplicate filters.
pub fn optimize_filters(filters: &mut Vec<NetworkFilter>) -> OptimizeStats {
    fn key(filter: &NetworkFilter) -> NetworkFilter {
        let mut key = filter.clone();
        key.raw.clear();
        key.flags.remove(FilterFlags::BADFILTER);
        key
    }

    let before = filters.len();
    let badfilters: HashSet<NetworkFilter> = filters
        .iter()
        .filter(|f| f.flags.contains(FilterFlags::BADFILTER))
        .map(key)
        .collect();
    let badfilter_count = filters
        .iter()
        .filter(|f| f.flags.contains(FilterFlags::BADFILTER))
        .count();

    filters.retain(|f| !f.flags.contains(FilterFlags::BADFILTER));
    let after_bad = filters.len();
    if !badfilters.is_empty() {
        filters.retain(|f| !badfilters.contains(&key(f)));
    }
    let badfiltered = after_bad - filters.len();

    let mut seen: HashSet<NetworkFilter> = HashSet::new();
    let before_dedupe = filters.len();
    filters.retain(|f| seen.insert(key(f)));
    let deduped = before_dedupe - filters.len();

    debug_assert_eq!(before, filters.len() + deduped + badfiltered + badfilter_count);

    OptimizeStats {
        before,
        after: filters.len(),
        deduped,
        badfiltered,
    }
}
