//! Veil Core
//!
//! The content-filtering orchestration layer. Configuration changes arrive
//! on a [`ConfigBus`] and are compiled into two enforcement forms: the
//! published `main` [`Engine`](veil_engine::Engine), consulted for requests,
//! navigations and cosmetic injection, and declarative rules kept in sync
//! with the host.
//!
//! # Modules
//!
//! - `bus`: Versioned configuration change bus
//! - `config`: Reactive configuration and static settings
//! - `registry`: Named engine cache with persistence
//! - `engines`: Main engine orchestration and list refresh
//! - `dnr`: Declarative rules, id ranges and the synchronizer
//! - `custom_filters`: User filter text with the scriptlet trust boundary
//! - `exceptions`: Tracker exceptions as allow filters
//! - `trust`: Pause, managed trust and exception predicates
//! - `pause`: Pause entries and their expiry alarms
//! - `redirect`: Redirect protection interstitial
//! - `network`: Imperative request blocking
//! - `cosmetics`: Cosmetic injection
//! - `messaging`: Content-script messages
//! - `strategy`: Declarative vs imperative enforcement
//! - `service`: Tasks and host entry points
//! - `sources`, `storage`: List sources and snapshot stores

pub mod bus;
pub mod config;
pub mod cosmetics;
pub mod custom_filters;
pub mod dnr;
pub mod engines;
pub mod error;
pub mod exceptions;
pub mod messaging;
pub mod network;
pub mod pause;
pub mod redirect;
pub mod registry;
pub mod service;
pub mod sources;
pub mod storage;
pub mod strategy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod trust;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types
pub use bus::{ConfigBus, ConfigChange, ConfigSubscription};
pub use config::{Config, Settings, GLOBAL_PAUSE_ID};
pub use dnr::{DeclarativeHost, HostError, Rule, RuleFamily, RuleSynchronizer, SyncReport};
pub use engines::{MainEngine, Reload, UpdateOutcome};
pub use error::{Error, Result};
pub use messaging::{ContentMessage, ContentResponse};
pub use network::{RequestDetails, Verdict};
pub use pause::Alarms;
pub use redirect::Navigation;
pub use registry::EngineRegistry;
pub use service::{FilteringService, ServiceBuilder};
pub use strategy::{Enforcement, PlatformCapabilities};
pub use trust::TrackerDb;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
