//! Registrable-domain (eTLD+1) helpers
//!
//! Lookups go through the Public Suffix List once one is installed with
//! [`init_psl`]. Until then a compact heuristic over the most common
//! multi-label suffixes stands in.
//!
//! ```
//! use veil_engine::psl::{get_etld1, PublicSuffixes};
//!
//! let psl = PublicSuffixes::parse(
//!     "// ===BEGIN PRIVATE DOMAINS===\ngithub.io\n// ===END PRIVATE DOMAINS===\n",
//! )
//! .unwrap();
//! assert_eq!(psl.etld1("user.github.io"), "user.github.io");
//! assert_eq!(get_etld1("sub.example.co.uk"), "example.co.uk");
//! ```

use std::sync::RwLock;

use publicsuffix::{List, Psl};

#[derive(Debug, thiserror::Error)]
pub enum PslError {
    #[error("invalid public suffix list: {0}")]
    Invalid(String),
}

/// A parsed Public Suffix List: exact, wildcard and exception rules from
/// both the ICANN and private sections.
pub struct PublicSuffixes {
    list: List,
}

impl PublicSuffixes {
    /// Parse `public_suffix_list.dat` text.
    pub fn parse(text: &str) -> Result<Self, PslError> {
        let list = text
            .parse::<List>()
            .map_err(|e| PslError::Invalid(e.to_string()))?;
        Ok(Self { list })
    }

    /// Registrable domain of `host`. A host that is itself a public suffix
    /// is returned as is.
    pub fn etld1(&self, host: &str) -> String {
        let host = normalize(host);
        if is_literal(&host) {
            return host;
        }
        self.lookup(&host).unwrap_or(host)
    }

    fn lookup(&self, host: &str) -> Option<String> {
        let domain = self.list.domain(host.as_bytes())?;
        std::str::from_utf8(domain.as_bytes()).ok().map(str::to_string)
    }
}

static PUBLIC_SUFFIXES: RwLock<Option<PublicSuffixes>> = RwLock::new(None);

/// Install the list every later lookup uses.
pub fn init_psl(suffixes: PublicSuffixes) {
    *PUBLIC_SUFFIXES.write().unwrap_or_else(|e| e.into_inner()) = Some(suffixes);
}

/// Check if PSL is initialized.
pub fn is_psl_initialized() -> bool {
    PUBLIC_SUFFIXES
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .is_some()
}

/// Common two-part public suffixes.
const COMMON_TWO_PART_TLDS: &[&str] = &[
    "co.uk", "co.jp", "co.nz", "co.za", "co.in", "co.kr",
    "com.au", "com.br", "com.cn", "com.mx", "com.tw", "com.hk", "com.tr",
    "net.au", "net.nz",
    "org.uk", "org.au",
    "gov.uk", "gov.au",
    "ac.uk", "ac.jp",
    "ne.jp", "or.jp",
];

/// Get the eTLD+1 (registrable domain) for a hostname.
///
/// If PSL is not loaded, falls back to simple heuristic.
pub fn get_etld1(host: &str) -> String {
    let guard = PUBLIC_SUFFIXES.read().unwrap_or_else(|e| e.into_inner());
    if let Some(suffixes) = guard.as_ref() {
        return suffixes.etld1(host);
    }
    drop(guard);

    let host = normalize(host);
    if is_literal(&host) {
        return host;
    }
    let labels: Vec<&str> = host.split('.').collect();
    fallback_etld1(&labels)
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Empty hosts and IP literals have no registrable domain.
fn is_literal(host: &str) -> bool {
    host.is_empty() || host.starts_with('[') || host.parse::<std::net::Ipv4Addr>().is_ok()
}

fn fallback_etld1(labels: &[&str]) -> String {
    let n = labels.len();
    if n <= 2 {
        return labels.join(".");
    }

    let last_two = format!("{}.{}", labels[n - 2], labels[n - 1]);
    if COMMON_TWO_PART_TLDS.contains(&last_two.as_str()) {
        return labels[n - 3..].join(".");
    }

    labels[n - 2..].join(".")
}

/// Check if a request is third-party.
pub fn is_third_party(site_host: &str, req_host: &str) -> bool {
    get_etld1(site_host) != get_etld1(req_host)
}

/// Get the parent domain (strip leftmost label).
pub fn get_parent_domain(host: &str) -> Option<&str> {
    match host.find('.') {
        Some(idx) if idx < host.len() - 1 => Some(&host[idx + 1..]),
        _ => None,
    }
}

/// `host` equals `domain` or is one of its subdomains.
pub fn is_same_or_subdomain(host: &str, domain: &str) -> bool {
    if domain.is_empty() || host.len() < domain.len() {
        return false;
    }
    if !host[host.len() - domain.len()..].eq_ignore_ascii_case(domain) {
        return false;
    }
    host.len() == domain.len() || host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// Iterator for suffix-walking a host from full host to its eTLD+1.
pub struct HostSuffixIter<'a> {
    current: Option<&'a str>,
    etld1_len: usize,
}

impl<'a> Iterator for HostSuffixIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = if current.len() > self.etld1_len {
            get_parent_domain(current)
        } else {
            None
        };
        Some(current)
    }
}

/// Walk `host` and its parent domains down to the registrable domain.
pub fn walk_host_suffixes(host: &str) -> HostSuffixIter<'_> {
    let etld1_len = get_etld1(host).len();
    HostSuffixIter {
        current: (!host.is_empty()).then_some(host),
        etld1_len,
    }
}
