//! Enforcement strategy
//!
//! Platforms either evaluate declarative rules themselves or hand every
//! request to a blocking interception hook. The choice is made once when the
//! service starts; the rest of the crate talks to an [`EnforcementStrategy`]
//! and never asks which platform it runs on.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use veil_engine::{Engine, ResponseMatch};

use crate::config::Config;
use crate::dnr::sync::FamilyReport;
use crate::dnr::{RuleSynchronizer, SyncReport};
use crate::error::Result;
use crate::network::{RequestBlocker, RequestDetails, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Enforcement {
    /// Host evaluates rules installed through the declarative API
    Declarative,
    /// Every request is matched against the main engine
    Imperative,
}

/// What the host platform offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase", default)]
#[ts(export)]
pub struct PlatformCapabilities {
    pub declarative_rules: bool,
    pub blocking_interception: bool,
}

impl Enforcement {
    /// `forced` wins. Otherwise blocking interception is preferred because
    /// it runs the full engine; declarative rules are the fallback.
    pub fn select(caps: PlatformCapabilities, forced: Option<Enforcement>) -> Enforcement {
        if let Some(forced) = forced {
            return forced;
        }
        if caps.blocking_interception {
            return Enforcement::Imperative;
        }
        if !caps.declarative_rules {
            log::warn!("platform reports no enforcement surface, assuming declarative rules");
        }
        Enforcement::Declarative
    }
}

pub enum EnforcementStrategy {
    Declarative(RuleSynchronizer),
    Imperative(RequestBlocker),
}

impl EnforcementStrategy {
    pub fn kind(&self) -> Enforcement {
        match self {
            Self::Declarative(_) => Enforcement::Declarative,
            Self::Imperative(_) => Enforcement::Imperative,
        }
    }

    /// Bring host rules in line with `current`. Nothing to do imperatively.
    pub async fn sync(&self, current: &Config, previous: Option<&Config>) -> SyncReport {
        match self {
            Self::Declarative(synchronizer) => synchronizer.sync(current, previous).await,
            Self::Imperative(_) => SyncReport::default(),
        }
    }

    pub async fn on_tracker_metadata_changed(
        &self,
        config: &Config,
    ) -> Result<Option<FamilyReport>> {
        match self {
            Self::Declarative(synchronizer) => {
                synchronizer.on_tracker_metadata_changed(config).await
            }
            // exceptions are consulted per request
            Self::Imperative(_) => Ok(None),
        }
    }

    pub fn on_before_request(
        &self,
        engine: &Engine,
        details: &RequestDetails,
        now: u64,
    ) -> Option<Verdict> {
        match self {
            Self::Declarative(_) => None,
            Self::Imperative(blocker) => blocker.on_before_request(engine, details, now),
        }
    }

    pub fn on_headers_received(
        &self,
        engine: &Engine,
        details: &RequestDetails,
        now: u64,
    ) -> Option<ResponseMatch> {
        match self {
            Self::Declarative(_) => None,
            Self::Imperative(blocker) => blocker.on_headers_received(engine, details, now),
        }
    }

    pub fn is_degraded(&self) -> bool {
        match self {
            Self::Declarative(synchronizer) => synchronizer.is_degraded(),
            Self::Imperative(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection() {
        let both = PlatformCapabilities {
            declarative_rules: true,
            blocking_interception: true,
        };
        let declarative_only = PlatformCapabilities {
            declarative_rules: true,
            blocking_interception: false,
        };
        assert_eq!(Enforcement::select(both, None), Enforcement::Imperative);
        assert_eq!(Enforcement::select(declarative_only, None), Enforcement::Declarative);
        assert_eq!(
            Enforcement::select(both, Some(Enforcement::Declarative)),
            Enforcement::Declarative
        );
        assert_eq!(
            Enforcement::select(PlatformCapabilities::default(), None),
            Enforcement::Declarative
        );
    }

    #[test]
    fn serde_names() {
        assert_eq!(serde_json::to_string(&Enforcement::Imperative).unwrap(), "\"imperative\"");
        let caps: PlatformCapabilities =
            serde_json::from_str(r#"{"declarativeRules": true}"#).unwrap();
        assert!(caps.declarative_rules && !caps.blocking_interception);
    }
}
