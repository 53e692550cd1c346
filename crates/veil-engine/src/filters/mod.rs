//! Filter list parsing
//!
//! Splits ABP/uBO-syntax list text into network and cosmetic filters.
//! Unsupported syntax is reported per line and never aborts a list.

pub mod cosmetic;
pub mod network;

pub use cosmetic::{CosmeticFilter, CosmeticKind, GenericKey, ScriptletCall};
pub use network::{DomainConstraint, NetworkFilter};

/// Why a filter line could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterParseError {
    #[error("empty filter")]
    Empty,

    #[error("unsupported option: {0}")]
    UnsupportedOption(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("invalid regex: {0}")]
    InvalidRegex(String),

    #[error("invalid pattern")]
    InvalidPattern,

    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    #[error("unsupported filter syntax")]
    Unsupported,

    #[error("options exclude every request")]
    EmptyMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Network,
    Cosmetic,
    NotSupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFilter {
    Network(NetworkFilter),
    Cosmetic(CosmeticFilter),
}

/// Line-level parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    /// 1-based line number
    pub line: usize,
    pub filter: String,
    pub error: FilterParseError,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFilters {
    pub network: Vec<NetworkFilter>,
    pub cosmetic: Vec<CosmeticFilter>,
    pub errors: Vec<LineError>,
}

/// Comments, list headers and blank lines.
pub fn is_comment(line: &str) -> bool {
    let line = line.trim();
    line.is_empty()
        || line.starts_with('!')
        || line.starts_with('[')
        || line == "#"
        || line.starts_with("# ")
        || line.starts_with("####")
}

pub fn detect_filter_type(line: &str) -> FilterType {
    // Scriptlet injection in AdGuard syntax, AdGuard JS rules and HTML filters
    if ["#$#", "#@$#", "#%#", "$$"].iter().any(|marker| line.contains(marker)) {
        return FilterType::NotSupported;
    }
    if ["##", "#@#", "#?#", "#@?#"].iter().any(|marker| line.contains(marker)) {
        return FilterType::Cosmetic;
    }
    FilterType::Network
}

/// Parse a single line. `Ok(None)` for comments.
pub fn parse_filter(line: &str) -> Result<Option<ParsedFilter>, FilterParseError> {
    let line = line.trim();
    if is_comment(line) {
        return Ok(None);
    }
    match detect_filter_type(line) {
        FilterType::Network => NetworkFilter::parse(line).map(|f| Some(ParsedFilter::Network(f))),
        FilterType::Cosmetic => {
            CosmeticFilter::parse(line).map(|f| Some(ParsedFilter::Cosmetic(f)))
        }
        FilterType::NotSupported => Err(FilterParseError::Unsupported),
    }
}

/// Parse list text, keeping every usable filter and recording the rest.
pub fn parse_filters(text: &str) -> ParsedFilters {
    let mut parsed = ParsedFilters::default();

    for (idx, line) in text.lines().enumerate() {
        match parse_filter(line) {
            Ok(Some(ParsedFilter::Network(filter))) => parsed.network.push(filter),
            Ok(Some(ParsedFilter::Cosmetic(filter))) => parsed.cosmetic.push(filter),
            Ok(None) => {}
            Err(error) => parsed.errors.push(LineError {
                line: idx + 1,
                filter: line.trim().to_string(),
                error,
            }),
        }
    }

    parsed
}
