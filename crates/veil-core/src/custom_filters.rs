//! Custom filter compiler
//!
//! User (or managed) filter text is recompiled from source on every change.
//! Scriptlets that can rewrite arbitrary page content only pass when the
//! user enabled trusted scriptlets. Problems are returned per line, never
//! raised.

use std::sync::Arc;

use serde::Serialize;
use ts_rs::TS;
use veil_engine::filters::{parse_filter, ParsedFilter};
use veil_engine::{content_digest, CosmeticFilter, Engine, NetworkFilter};

use crate::config::Config;
use crate::dnr::{convert_filters, ConversionError, Rule};
use crate::engines::CUSTOM;
use crate::error::Result;
use crate::registry::EngineRegistry;

const RESTRICTED_SCRIPTLETS: &[&str] = &["replace-node-text", "rpnt"];

/// Scriptlets gated behind the trusted-scriptlets setting.
pub fn is_restricted_scriptlet(name: &str) -> bool {
    let name = name.trim();
    let name = name.strip_suffix(".js").unwrap_or(name);
    name.starts_with("trusted-") || RESTRICTED_SCRIPTLETS.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, rename = "CustomFilterError")]
pub struct LineError {
    /// 1-based
    pub line: usize,
    pub filter: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedCustomFilters {
    pub network: Vec<NetworkFilter>,
    pub cosmetic: Vec<CosmeticFilter>,
    pub errors: Vec<LineError>,
}

pub fn parse_custom_filters(text: &str, trusted_scriptlets: bool) -> ParsedCustomFilters {
    let mut parsed = ParsedCustomFilters::default();

    for (idx, line) in text.lines().enumerate() {
        let error = |reason: String| LineError {
            line: idx + 1,
            filter: line.trim().to_string(),
            reason,
        };
        match parse_filter(line) {
            Ok(Some(ParsedFilter::Network(filter))) => parsed.network.push(filter),
            Ok(Some(ParsedFilter::Cosmetic(filter))) => match filter.scriptlet() {
                Some(call)
                    if !trusted_scriptlets && is_restricted_scriptlet(call.canonical_name()) =>
                {
                    let reason = format!("scriptlet '{}' requires trusted scriptlets", call.name);
                    parsed.errors.push(error(reason));
                }
                _ => parsed.cosmetic.push(filter),
            },
            Ok(None) => {}
            Err(e) => parsed.errors.push(error(e.to_string())),
        }
    }

    parsed
}

/// What a compilation produced, for the settings UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CustomFilterReport {
    pub network_filters: usize,
    pub cosmetic_filters: usize,
    pub dnr_rules: usize,
    pub errors: Vec<LineError>,
    pub dnr_errors: Vec<ConversionError>,
}

/// Builds the `custom` leaf engine and the custom-filters rule family.
pub struct CustomFilterCompiler {
    registry: Arc<EngineRegistry>,
}

impl CustomFilterCompiler {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self { registry }
    }

    /// Engine for the current text. Without custom filters the engine is
    /// removed and the report is empty.
    pub async fn apply(&self, config: &Config) -> Result<CustomFilterReport> {
        let Some(text) = config.effective_custom_filters() else {
            self.registry.remove(CUSTOM).await?;
            return Ok(CustomFilterReport::default());
        };

        let (report, engine) = compile(text, config.custom_filters.trusted_scriptlets);
        self.registry.insert(CUSTOM, engine).await?;
        log::info!(
            "custom filters: {} network, {} cosmetic, {} errors",
            report.network_filters,
            report.cosmetic_filters,
            report.errors.len()
        );
        Ok(report)
    }
}

/// Cache key of a `custom` engine: the text plus the trust setting it was
/// compiled under.
pub fn custom_digest(text: &str, trusted_scriptlets: bool) -> u64 {
    let digest = content_digest(text);
    if trusted_scriptlets {
        digest ^ TRUSTED_SALT
    } else {
        digest
    }
}

const TRUSTED_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// Compile custom filter text into a report and its engine.
pub fn compile(text: &str, trusted_scriptlets: bool) -> (CustomFilterReport, Engine) {
    let parsed = parse_custom_filters(text, trusted_scriptlets);
    let (rules, dnr_errors) = convert_filters(&parsed.network);
    let report = CustomFilterReport {
        network_filters: parsed.network.len(),
        cosmetic_filters: parsed.cosmetic.len(),
        dnr_rules: rules.len(),
        errors: parsed.errors,
        dnr_errors,
    };
    let engine = Engine::from_filters(
        CUSTOM,
        custom_digest(text, trusted_scriptlets),
        parsed.network,
        parsed.cosmetic,
    );
    (report, engine)
}

/// The custom-filters rule family.
pub fn custom_filter_rules(config: &Config) -> (Vec<Rule>, Vec<ConversionError>) {
    match config.effective_custom_filters() {
        Some(text) => {
            let parsed = parse_custom_filters(text, config.custom_filters.trusted_scriptlets);
            convert_filters(&parsed.network)
        }
        None => (Vec::new(), Vec::new()),
    }
}
