//! Veil filter engine
//!
//! Compiles ABP/uBO-syntax filter lists into immutable, queryable engines and
//! answers the three questions the orchestration layer asks of them: should
//! this request be blocked or redirected, which cosmetic rules apply to this
//! page, and which rewrites apply to this response.
//!
//! # Architecture
//!
//! Each list is parsed into a [`FilterList`] with host-keyed indexes for
//! network and cosmetic filters. An [`Engine`] is a composite of lists that
//! implements the same [`FilterIndex`] interface, so the published `main`
//! engine is simply the union of the enabled leaf engines. Engines persist as
//! opaque versioned snapshots (see [`snapshot`]).
//!
//! # Modules
//!
//! - `filters`: Filter line parsing (network, cosmetic, scriptlet)
//! - `list`: Indexed filter lists and precedence rules
//! - `engine`: Composite engine and snapshot encoding
//! - `resources`: Neutral redirect resources
//! - `snapshot`: Versioned snapshot blob format
//! - `hash`: xxHash64 digests and CRC32
//! - `psl`: eTLD+1 helpers
//! - `url`: Allocation-free URL helpers
//! - `types`: Shared type definitions

pub mod engine;
pub mod filters;
pub mod hash;
pub mod list;
pub mod psl;
pub mod resources;
pub mod snapshot;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use engine::{Engine, EngineStats};
pub use filters::{
    detect_filter_type, is_comment, parse_filters, CosmeticFilter, CosmeticKind, FilterParseError,
    FilterType, LineError, NetworkFilter, ParsedFilter, ScriptletCall,
};
pub use hash::content_digest;
pub use list::{CosmeticMatch, CosmeticQuery, FilterIndex, FilterList, ResponseMatch};
pub use psl::{get_etld1, init_psl, is_third_party, PublicSuffixes};
pub use snapshot::SnapshotError;
pub use types::{FilterAction, MatchDecision, MatchResult, Redirect, Request, RequestType};
