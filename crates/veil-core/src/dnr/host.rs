//! The browser's declarative rule API, as seen from the synchronizer.

use async_trait::async_trait;

use super::Rule;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// Individual rules were refused; nothing from the call was applied.
    #[error("rules rejected ({ids:?}): {reason}")]
    Rejected { ids: Vec<u32>, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Each update call is atomic: removals and additions apply together or not
/// at all, removals first.
#[async_trait]
pub trait DeclarativeHost: Send + Sync {
    async fn dynamic_rules(&self) -> Result<Vec<Rule>, HostError>;

    async fn update_dynamic_rules(
        &self,
        remove_ids: Vec<u32>,
        add: Vec<Rule>,
    ) -> Result<(), HostError>;

    async fn session_rules(&self) -> Result<Vec<Rule>, HostError>;

    async fn update_session_rules(
        &self,
        remove_ids: Vec<u32>,
        add: Vec<Rule>,
    ) -> Result<(), HostError>;

    async fn enabled_rulesets(&self) -> Result<Vec<String>, HostError>;

    async fn update_enabled_rulesets(
        &self,
        enable: Vec<String>,
        disable: Vec<String>,
    ) -> Result<(), HostError>;

    /// Ids of the prebuilt rulesets shipped with the extension.
    async fn available_rulesets(&self) -> Result<Vec<String>, HostError>;

    async fn is_regex_supported(&self, regex: &str) -> bool;
}
