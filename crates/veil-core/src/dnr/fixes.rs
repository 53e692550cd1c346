//! Remote fixes: hand-written declarative rules published between list
//! releases. Each rule is validated on its own; a bad rule never takes the
//! rest down with it.

use serde_json::Value;

use super::{ActionType, DeclarativeHost, Rule};
use crate::error::Result;
use crate::sources::{ListSource, FIXES_FILE};

/// Prebuilt ruleset shipped as the offline copy of the fixes.
pub const FIXES_RULESET: &str = "fixes";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixesLoad {
    pub rules: Vec<Rule>,
    /// Why each dropped rule was dropped
    pub dropped: Vec<String>,
}

/// Fetch and validate the fixes. `Err` only when the document itself is
/// unusable.
pub async fn load_fixes(source: &dyn ListSource, host: &dyn DeclarativeHost) -> Result<FixesLoad> {
    let text = source.fetch_text(FIXES_FILE).await?;
    let entries: Vec<Value> = serde_json::from_str(&text)?;

    let mut load = FixesLoad::default();
    for (idx, entry) in entries.into_iter().enumerate() {
        match validate(entry, host).await {
            Ok(rule) => load.rules.push(rule),
            Err(reason) => {
                log::debug!("fixes: rule #{idx} dropped: {reason}");
                load.dropped.push(format!("#{idx}: {reason}"));
            }
        }
    }
    Ok(load)
}

async fn validate(entry: Value, host: &dyn DeclarativeHost) -> Result<Rule, String> {
    let rule: Rule = serde_json::from_value(entry).map_err(|e| e.to_string())?;

    if rule.action.kind == ActionType::Redirect && rule.action.redirect.is_none() {
        return Err("redirect without a target".to_string());
    }
    if rule.action.kind == ActionType::AllowAllRequests {
        let frames_only = rule
            .condition
            .resource_types
            .as_ref()
            .is_some_and(|types| types.iter().all(|t| t == "main_frame" || t == "sub_frame"));
        if !frames_only {
            return Err("allowAllRequests needs frame resource types".to_string());
        }
    }
    if let Some(regex) = rule.regex() {
        if !host.is_regex_supported(regex).await {
            return Err(format!("regex not supported: {regex}"));
        }
    }
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sources::StaticListSource;
    use crate::testing::MemoryHost;

    #[tokio::test]
    async fn invalid_rules_are_dropped_individually() {
        let fixes = r#"[
            {"id": 1, "priority": 1, "action": {"type": "block"},
             "condition": {"urlFilter": "||ads.com^"}},
            {"id": 2, "priority": 1, "action": {"type": "explode"}, "condition": {}},
            {"id": 3, "priority": 1, "action": {"type": "block"},
             "condition": {"regexFilter": "(?<=x)y"}},
            {"id": 4, "priority": 1, "action": {"type": "allowAllRequests"},
             "condition": {"resourceTypes": ["script"]}},
            {"id": 5, "priority": 1, "action": {"type": "block"},
             "condition": {"regexFilter": "ads[0-9]+"}}
        ]"#;
        let source = StaticListSource::new().with_file(FIXES_FILE, fixes);
        let host = MemoryHost::new().with_unsupported_regex("(?<=x)y");

        let load = load_fixes(&source, &host).await.unwrap();
        assert_eq!(load.rules.len(), 2);
        assert_eq!(load.dropped.len(), 3);
        assert_eq!(load.rules[1].regex(), Some("ads[0-9]+"));
    }

    #[tokio::test]
    async fn unusable_documents_are_errors() {
        let host = MemoryHost::new();
        let err = load_fixes(&StaticListSource::new(), &host).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));

        let source = StaticListSource::new().with_file(FIXES_FILE, "{not json");
        let err = load_fixes(&source, &host).await.unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
