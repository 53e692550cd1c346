//! Core type definitions for the Veil filter engine
//!
//! These types describe a request as seen by the matcher and the verdicts the
//! matcher hands back to the orchestration layer.

use serde::{Deserialize, Serialize};

use crate::psl::get_etld1;
use crate::url::extract_host;

// =============================================================================
// Filter Actions
// =============================================================================

/// What a network filter does when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterAction {
    /// Block rule - cancels the request
    Block,
    /// Exception rule (@@...) - allows the request
    Allow,
}

// =============================================================================
// Filter Flags
// =============================================================================

bitflags::bitflags! {
    /// Flags for network filter behavior.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FilterFlags: u16 {
        /// $important - ignores exception filters
        const IMPORTANT = 1 << 0;
        /// Pattern is a regex
        const IS_REGEX = 1 << 1;
        /// Case-sensitive matching ($match-case)
        const MATCH_CASE = 1 << 2;
        /// Rule has right anchor (ends with |)
        const HAS_RIGHT_ANCHOR = 1 << 3;
        /// Rule has hostname anchor (||)
        const HAS_HOST_ANCHOR = 1 << 4;
        /// Rule has left anchor (starts with |)
        const HAS_LEFT_ANCHOR = 1 << 5;
        /// $generichide exception
        const GENERICHIDE = 1 << 6;
        /// $elemhide exception
        const ELEMHIDE = 1 << 7;
        /// $badfilter - cancels the filter it repeats
        const BADFILTER = 1 << 8;
        /// $redirect-rule - only redirects requests blocked elsewhere
        const REDIRECT_RULE = 1 << 9;
    }
}

// =============================================================================
// Request Types (bit mask for type filtering)
// =============================================================================

bitflags::bitflags! {
    /// Request type bit mask.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RequestType: u32 {
        const OTHER = 1 << 0;
        const SCRIPT = 1 << 1;
        const IMAGE = 1 << 2;
        const STYLESHEET = 1 << 3;
        const OBJECT = 1 << 4;
        const SUBDOCUMENT = 1 << 5;  // iframe/frame
        const MAIN_FRAME = 1 << 6;   // main document
        const XMLHTTPREQUEST = 1 << 7;
        const WEBSOCKET = 1 << 8;
        const FONT = 1 << 9;
        const MEDIA = 1 << 10;
        const PING = 1 << 11;
        const CSP_REPORT = 1 << 12;

        /// Document types (main_frame + sub_frame)
        const DOCUMENT = Self::MAIN_FRAME.bits() | Self::SUBDOCUMENT.bits();
    }
}

impl RequestType {
    /// Parse from the browser's request type string.
    pub fn from_browser(s: &str) -> Self {
        match s {
            "main_frame" | "document" => Self::MAIN_FRAME,
            "sub_frame" | "subdocument" => Self::SUBDOCUMENT,
            "stylesheet" | "css" => Self::STYLESHEET,
            "script" | "js" => Self::SCRIPT,
            "image" | "img" | "imageset" => Self::IMAGE,
            "font" => Self::FONT,
            "object" | "object_subrequest" => Self::OBJECT,
            "xmlhttprequest" | "xhr" | "fetch" => Self::XMLHTTPREQUEST,
            "ping" | "beacon" => Self::PING,
            "csp_report" => Self::CSP_REPORT,
            "media" => Self::MEDIA,
            "websocket" | "ws" => Self::WEBSOCKET,
            _ => Self::OTHER,
        }
    }

    /// Browser name of a single request type, as used by declarative rules.
    pub fn browser_names(self) -> Vec<&'static str> {
        const NAMES: &[(RequestType, &str)] = &[
            (RequestType::MAIN_FRAME, "main_frame"),
            (RequestType::SUBDOCUMENT, "sub_frame"),
            (RequestType::STYLESHEET, "stylesheet"),
            (RequestType::SCRIPT, "script"),
            (RequestType::IMAGE, "image"),
            (RequestType::FONT, "font"),
            (RequestType::OBJECT, "object"),
            (RequestType::XMLHTTPREQUEST, "xmlhttprequest"),
            (RequestType::PING, "ping"),
            (RequestType::CSP_REPORT, "csp_report"),
            (RequestType::MEDIA, "media"),
            (RequestType::WEBSOCKET, "websocket"),
            (RequestType::OTHER, "other"),
        ];
        NAMES
            .iter()
            .filter(|(ty, _)| self.contains(*ty))
            .map(|(_, name)| *name)
            .collect()
    }
}

// =============================================================================
// Party Masks
// =============================================================================

bitflags::bitflags! {
    /// Party (first-party / third-party) mask.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PartyMask: u8 {
        /// Matches first-party requests
        const FIRST_PARTY = 1 << 0;
        /// Matches third-party requests
        const THIRD_PARTY = 1 << 1;
        /// Matches both
        const ALL = Self::FIRST_PARTY.bits() | Self::THIRD_PARTY.bits();
    }
}

// =============================================================================
// Request
// =============================================================================

/// A request being matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Full request URL
    pub url: String,
    /// Request hostname (extracted from URL)
    pub hostname: String,
    /// Request eTLD+1
    pub domain: String,
    /// Context/initiator hostname
    pub source_hostname: String,
    /// Context/initiator eTLD+1
    pub source_domain: String,
    /// Request type
    pub request_type: RequestType,
    /// Is this a third-party request?
    pub is_third_party: bool,
}

impl Request {
    /// Build a request from the browser's view of it.
    ///
    /// Main-frame requests are their own source; other requests fall back to
    /// the request host when the initiator is unknown.
    pub fn new(url: &str, source_url: Option<&str>, request_type: &str) -> Self {
        let request_type = RequestType::from_browser(request_type);
        let hostname = extract_host(url).unwrap_or("").to_ascii_lowercase();
        let domain = get_etld1(&hostname);

        let source_hostname = if request_type.contains(RequestType::MAIN_FRAME) {
            hostname.clone()
        } else {
            source_url
                .and_then(extract_host)
                .filter(|host| !host.is_empty())
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| hostname.clone())
        };
        let source_domain = get_etld1(&source_hostname);
        let is_third_party = !source_domain.is_empty() && domain != source_domain;

        Self {
            url: url.to_string(),
            hostname,
            domain,
            source_hostname,
            source_domain,
            request_type,
            is_third_party,
        }
    }
}

// =============================================================================
// Match Result
// =============================================================================

/// Final decision for a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchDecision {
    /// Request is allowed (no matching block rules, or exception matched)
    Allow,
    /// Request is blocked
    Block,
    /// Request is redirected to a neutral resource
    Redirect,
}

/// A neutral resource a blocked request is rewritten to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    /// Canonical resource name
    pub resource: String,
    /// Path of the bundled copy, relative to the extension root
    pub path: String,
    /// Embedded payload usable without a bundled copy
    pub data_url: String,
}

/// Result of matching a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// The final decision for this request
    pub decision: MatchDecision,
    /// Raw text of the filter that determined the decision
    pub filter: Option<String>,
    /// Name of the list the filter came from
    pub list: Option<String>,
    /// Redirect target if decision is Redirect
    pub redirect: Option<Redirect>,
}

impl MatchResult {
    /// Whether any filter determined this result.
    pub fn matched(&self) -> bool {
        self.filter.is_some()
    }
}

impl Default for MatchResult {
    fn default() -> Self {
        Self {
            decision: MatchDecision::Allow,
            filter: None,
            list: None,
            redirect: None,
        }
    }
}
