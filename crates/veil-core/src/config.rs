//! User configuration and static service settings
//!
//! [`Config`] is the reactive record delivered over the
//! [`ConfigBus`](crate::bus::ConfigBus); every subsystem derives its output
//! from a `(current, previous)` pair of it. [`Settings`] are fixed for the
//! lifetime of a service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{Error, Result};
use crate::strategy::Enforcement;

/// Key of the global pause entry in [`Config::paused`].
pub const GLOBAL_PAUSE_ID: &str = "<all_urls>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct Config {
    pub block_ads: bool,
    pub block_trackers: bool,
    pub block_annoyances: bool,
    pub regional_filters: RegionalFilters,
    pub custom_filters: CustomFilters,
    /// Tracker id (or bare hostname) to trust scope
    pub exceptions: BTreeMap<String, Exception>,
    /// Hostname or [`GLOBAL_PAUSE_ID`] to pause entry
    pub paused: BTreeMap<String, PausedEntry>,
    pub redirect_protection: RedirectProtection,
    pub safe_mode: SafeMode,
    /// Hostname to selectors picked by the user
    pub element_picker_selectors: BTreeMap<String, Vec<String>>,
    /// Milliseconds since epoch of the last completed list refresh
    #[ts(type = "number")]
    pub filters_updated_at: u64,
    pub managed: Managed,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_ads: true,
            block_trackers: true,
            block_annoyances: false,
            regional_filters: RegionalFilters::default(),
            custom_filters: CustomFilters::default(),
            exceptions: BTreeMap::new(),
            paused: BTreeMap::new(),
            redirect_protection: RedirectProtection::default(),
            safe_mode: SafeMode::default(),
            element_picker_selectors: BTreeMap::new(),
            filters_updated_at: 0,
            managed: Managed::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct RegionalFilters {
    pub enabled: bool,
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct CustomFilters {
    pub enabled: bool,
    pub trusted_scriptlets: bool,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct Exception {
    pub global: bool,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct PausedEntry {
    /// Milliseconds since epoch; `None` pauses until resumed
    #[ts(type = "number | null")]
    pub revoke_at: Option<u64>,
}

impl PausedEntry {
    pub fn is_active(&self, now: u64) -> bool {
        self.revoke_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct RedirectProtection {
    pub enabled: bool,
    /// Hostnames the user switched protection off for
    pub disabled: Vec<String>,
}

impl Default for RedirectProtection {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct SafeMode {
    pub enabled: bool,
    pub denylist: Vec<String>,
}

/// Centrally managed overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct Managed {
    /// Replaces the user's custom filter text while set
    pub custom_filters: Option<String>,
    /// Hostnames exempt from all filtering
    pub trusted_domains: Vec<String>,
}

impl Config {
    /// Custom filter text in effect: the managed override when present,
    /// otherwise the user's text when enabled.
    pub fn effective_custom_filters(&self) -> Option<&str> {
        if let Some(text) = self.managed.custom_filters.as_deref() {
            return Some(text);
        }
        self.custom_filters
            .enabled
            .then_some(self.custom_filters.text.as_str())
    }

    pub fn has_element_picker_selectors(&self) -> bool {
        self.element_picker_selectors.values().any(|s| !s.is_empty())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Static service settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Where engine snapshots persist; in memory when unset
    pub snapshot_dir: Option<PathBuf>,
    /// Directory of bundled list text and prebuilt snapshots
    pub bundled_dir: Option<PathBuf>,
    /// Base URL of remotely updated lists and the fixes rules
    pub remote_base_url: Option<String>,
    /// Extension origin used for redirect resources and the interstitial
    pub extension_origin: Option<String>,
    /// Path of the redirect-protection interstitial page
    pub interstitial_path: String,
    pub update_interval_secs: u64,
    /// Upper bound on one remote list fetch
    pub fetch_timeout_secs: u64,
    /// Config bus debounce; 0 delivers every coalesced change at once
    pub bus_debounce_ms: u64,
    /// Forces an enforcement strategy instead of probing the platform
    pub enforcement: Option<Enforcement>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            snapshot_dir: None,
            bundled_dir: None,
            remote_base_url: None,
            extension_origin: None,
            interstitial_path: "/pages/redirect-protection.html".to_string(),
            update_interval_secs: 60 * 60,
            fetch_timeout_secs: 30,
            bus_debounce_ms: 0,
            enforcement: None,
        }
    }
}

impl Settings {
    pub fn from_json(text: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.update_interval_secs == 0 {
            return Err(Error::Settings("updateIntervalSecs must be positive".to_string()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(Error::Settings("fetchTimeoutSecs must be positive".to_string()));
        }
        if let Some(base) = &self.remote_base_url {
            url::Url::parse(base)
                .map_err(|e| Error::Settings(format!("remoteBaseUrl '{base}' is invalid: {e}")))?;
        }
        if !self.interstitial_path.starts_with('/') {
            return Err(Error::Settings(format!(
                "interstitialPath must be absolute, got '{}'",
                self.interstitial_path
            )));
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn bus_debounce(&self) -> Duration {
        Duration::from_millis(self.bus_debounce_ms)
    }

    /// Interstitial URL, absolute when the extension origin is known.
    pub fn interstitial_url(&self) -> String {
        match &self.extension_origin {
            Some(origin) => format!("{}{}", origin.trim_end_matches('/'), self.interstitial_path),
            None => self.interstitial_path.clone(),
        }
    }
}
