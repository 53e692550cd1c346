//! Configuration change bus
//!
//! A single writer-side [`ConfigBus`] publishes versioned [`Config`]
//! snapshots; each subscriber receives `(current, previous)` pairs. Bursts of
//! updates that land while a subscriber is busy are coalesced into one change
//! whose `previous` is the last snapshot that subscriber saw.
//!
//! [`ConfigBus::idle`] resolves once every live subscriber has finished with
//! the latest version, which is how tests wait for the reactive pipeline to
//! settle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;

#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    config: Arc<Config>,
}

/// One delivered change.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub current: Arc<Config>,
    /// `None` on a subscriber's first delivery
    pub previous: Option<Arc<Config>>,
    pub version: u64,
}

impl ConfigChange {
    /// Whether the slice selected by `f` differs from the previous snapshot.
    /// Always true on a first delivery.
    pub fn changed<T: PartialEq + ?Sized>(&self, f: impl Fn(&Config) -> &T) -> bool {
        match &self.previous {
            Some(previous) => f(previous) != f(&self.current),
            None => true,
        }
    }
}

struct BusInner {
    tx: watch::Sender<Versioned>,
    /// subscriber id -> last processed version
    acks: watch::Sender<BTreeMap<u64, u64>>,
    next_subscriber: AtomicU64,
    debounce: Duration,
}

#[derive(Clone)]
pub struct ConfigBus {
    inner: Arc<BusInner>,
}

impl ConfigBus {
    pub fn new(config: Config) -> Self {
        Self::with_debounce(config, Duration::ZERO)
    }

    /// Subscribers wait `debounce` after a change before reading, so rapid
    /// updates arrive as one.
    pub fn with_debounce(config: Config, debounce: Duration) -> Self {
        let (tx, _) = watch::channel(Versioned {
            version: 1,
            config: Arc::new(config),
        });
        let (acks, _) = watch::channel(BTreeMap::new());
        Self {
            inner: Arc::new(BusInner {
                tx,
                acks,
                next_subscriber: AtomicU64::new(1),
                debounce,
            }),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.inner.tx.borrow().config)
    }

    pub fn version(&self) -> u64 {
        self.inner.tx.borrow().version
    }

    /// Apply `f` to a copy of the current config and publish it if anything
    /// changed. Returns whether a new version was published.
    pub fn update(&self, f: impl FnOnce(&mut Config)) -> bool {
        let changed = self.inner.tx.send_if_modified(|versioned| {
            let mut next = (*versioned.config).clone();
            f(&mut next);
            if next == *versioned.config {
                return false;
            }
            versioned.version += 1;
            versioned.config = Arc::new(next);
            true
        });
        if changed {
            log::debug!("config bus: published version {}", self.version());
        }
        changed
    }

    pub fn set(&self, config: Config) -> bool {
        self.update(|current| *current = config)
    }

    pub fn subscribe(&self) -> ConfigSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.acks.send_modify(|acks| {
            acks.insert(id, 0);
        });
        ConfigSubscription {
            id,
            rx: self.inner.tx.subscribe(),
            inner: Arc::clone(&self.inner),
            last: None,
            delivered: 0,
        }
    }

    /// Wait until every subscriber has processed the latest version.
    pub async fn idle(&self) {
        let mut acks = self.inner.acks.subscribe();
        loop {
            let target = self.version();
            if acks.wait_for(|acks| acks.values().all(|&v| v >= target)).await.is_err() {
                return;
            }
            if self.version() == target {
                return;
            }
        }
    }
}

/// Receiving side of the bus. Call [`next`](Self::next) again once a change
/// is fully handled; that call acknowledges it.
pub struct ConfigSubscription {
    id: u64,
    rx: watch::Receiver<Versioned>,
    inner: Arc<BusInner>,
    last: Option<Arc<Config>>,
    delivered: u64,
}

impl ConfigSubscription {
    pub async fn next(&mut self) -> Option<ConfigChange> {
        self.ack();

        if self.last.is_none() {
            let current = self.rx.borrow_and_update().clone();
            return Some(self.deliver(current));
        }

        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if !self.inner.debounce.is_zero() {
                tokio::time::sleep(self.inner.debounce).await;
            }
            let current = self.rx.borrow_and_update().clone();
            if current.version > self.delivered {
                return Some(self.deliver(current));
            }
        }
    }

    fn deliver(&mut self, current: Versioned) -> ConfigChange {
        let previous = self.last.replace(Arc::clone(&current.config));
        self.delivered = current.version;
        ConfigChange {
            current: current.config,
            previous,
            version: current.version,
        }
    }

    fn ack(&self) {
        let (id, delivered) = (self.id, self.delivered);
        self.inner.acks.send_if_modified(|acks| match acks.get_mut(&id) {
            Some(v) if *v < delivered => {
                *v = delivered;
                true
            }
            _ => false,
        });
    }
}

impl Drop for ConfigSubscription {
    fn drop(&mut self) {
        let id = self.id;
        self.inner.acks.send_modify(|acks| {
            acks.remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn first_delivery_has_no_previous() {
        let bus = ConfigBus::new(Config::default());
        let mut sub = bus.subscribe();
        let change = sub.next().await.unwrap();
        assert!(change.previous.is_none());
        assert_eq!(change.version, 1);
        assert!(change.changed(|c| &c.block_ads));
    }

    #[tokio::test]
    async fn coalesces_bursts() {
        let bus = ConfigBus::new(Config::default());
        let mut sub = bus.subscribe();
        sub.next().await.unwrap();

        assert!(bus.update(|c| c.block_annoyances = true));
        assert!(bus.update(|c| c.block_ads = false));

        let change = sub.next().await.unwrap();
        assert_eq!(change.version, 3);
        let previous = change.previous.as_ref().unwrap();
        assert!(!previous.block_annoyances && previous.block_ads);
        assert!(change.current.block_annoyances && !change.current.block_ads);
    }

    #[tokio::test]
    async fn unchanged_update_is_not_published() {
        let bus = ConfigBus::new(Config::default());
        assert!(!bus.update(|c| c.block_ads = true));
        assert_eq!(bus.version(), 1);
    }

    #[tokio::test]
    async fn idle_waits_for_acknowledgement() {
        let bus = ConfigBus::new(Config::default());
        let mut sub = bus.subscribe();
        sub.next().await.unwrap();

        bus.update(|c| c.block_trackers = false);
        assert!(timeout(Duration::from_millis(50), bus.idle()).await.is_err());

        sub.next().await.unwrap();
        // acknowledged when the subscriber asks for the next change
        let waiting = tokio::spawn(async move {
            let _ = sub.next().await;
        });
        timeout(Duration::from_secs(1), bus.idle()).await.unwrap();
        waiting.abort();
    }

    #[tokio::test]
    async fn dropped_subscribers_do_not_block_idle() {
        let bus = ConfigBus::new(Config::default());
        let sub = bus.subscribe();
        drop(sub);
        bus.update(|c| c.block_trackers = false);
        timeout(Duration::from_secs(1), bus.idle()).await.unwrap();
    }
}
