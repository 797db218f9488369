//! Periodic thing-attribute refresh with per-record trust windows
//! (§4.11).
//!
//! Grounded on the teacher's `shadow_manager.rs` periodic-poll worker
//! shape (a `tokio::time::interval` loop spawned once at `start`), with
//! the use-cache-if-fresh freshness guard resolved per Open Question #2
//! (§9).

use crate::cloud::{CloudIdentityClient, ThingAttributes, ThingDescription};
use crate::config::ThingAttributesCacheConfig;
use crate::network::NetworkStateTracker;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

struct Cached<T> {
    value: T,
    cached_at: DateTime<Utc>,
}

/// Periodically refreshes thing attributes/descriptions from the cloud
/// for a tracked set of thing names, serving cached values while they
/// remain within their trust window (§4.11).
pub struct ThingAttributesCache {
    cloud: Arc<dyn CloudIdentityClient>,
    network: Arc<NetworkStateTracker>,
    tracked: RwLock<HashSet<String>>,
    attributes: RwLock<HashMap<String, Cached<ThingAttributes>>>,
    descriptions: RwLock<HashMap<String, Cached<ThingDescription>>>,
    association_trust: ChronoDuration,
    description_trust: ChronoDuration,
    refresh_delay: std::time::Duration,
    initialized: AtomicBool,
    initialized_notify: Notify,
    refresh_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ThingAttributesCache {
    pub fn new(cloud: Arc<dyn CloudIdentityClient>, network: Arc<NetworkStateTracker>, config: &ThingAttributesCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            network,
            tracked: RwLock::new(HashSet::new()),
            attributes: RwLock::new(HashMap::new()),
            descriptions: RwLock::new(HashMap::new()),
            association_trust: ChronoDuration::minutes(config.association_trust_minutes as i64),
            description_trust: ChronoDuration::minutes(config.description_trust_minutes as i64),
            refresh_delay: config.refresh_delay,
            initialized: AtomicBool::new(false),
            initialized_notify: Notify::new(),
            refresh_task: std::sync::Mutex::new(None),
        })
    }

    /// Adds `thing_name` to the set refreshed by the background loop.
    pub async fn track(&self, thing_name: &str) {
        self.tracked.write().await.insert(thing_name.to_string());
    }

    /// Spawns the periodic refresh loop. Idempotent to call once at
    /// startup, matching the teacher's `shadow_manager.rs::start`.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.refresh_delay);
            loop {
                interval.tick().await;
                this.refresh_once(Utc::now()).await;
            }
        });
        *self.refresh_task.lock().unwrap() = Some(handle);
    }

    /// Aborts the background refresh loop, moving the cache to its idle
    /// terminal state (§4.4 IDLE).
    pub fn stop(&self) {
        if let Some(handle) = self.refresh_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Blocks (bounded by `timeout`) until the first full refresh pass
    /// completes. Returns `true` if initialization completed within the
    /// timeout, `false` otherwise.
    pub async fn wait_for_initialization(&self, timeout: std::time::Duration) -> bool {
        if self.initialized.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.initialized_notify.notified())
            .await
            .is_ok()
            || self.initialized.load(Ordering::Acquire)
    }

    /// If the transport is down, the whole pass is skipped (the prior
    /// cache contents are left untouched, simply growing staler). If a
    /// single thing's fetch fails, that thing is skipped and the pass
    /// continues (§4.11).
    pub async fn refresh_once(&self, now: DateTime<Utc>) {
        if !self.network.is_up() {
            tracing::debug!("network down; skipping thing-attributes refresh");
            self.mark_initialized();
            return;
        }

        let tracked: Vec<String> = self.tracked.read().await.iter().cloned().collect();
        for thing_name in tracked {
            match self.cloud.get_thing_attributes(&thing_name).await {
                Ok(attrs) => {
                    self.attributes
                        .write()
                        .await
                        .insert(thing_name.clone(), Cached { value: attrs, cached_at: now });
                }
                Err(err) => {
                    tracing::warn!(thing_name = %thing_name, error = %err, "attribute refresh failed; skipping");
                }
            }

            match self.cloud.describe_thing(&thing_name).await {
                Ok(desc) => {
                    self.descriptions
                        .write()
                        .await
                        .insert(thing_name.clone(), Cached { value: desc, cached_at: now });
                }
                Err(err) => {
                    tracing::warn!(thing_name = %thing_name, error = %err, "description refresh failed; skipping");
                }
            }
        }

        self.mark_initialized();
    }

    fn mark_initialized(&self) {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            self.initialized_notify.notify_waiters();
        }
    }

    /// Use-cache-if-fresh (§9 Open Question #2): returns the cached
    /// value without triggering a refetch iff `now < cachedAt +
    /// trustDuration`; once stale, treated as absent.
    pub async fn get_attributes(&self, thing_name: &str, now: DateTime<Utc>) -> Option<ThingAttributes> {
        let guard = self.attributes.read().await;
        let cached = guard.get(thing_name)?;
        if now < cached.cached_at + self.association_trust {
            Some(cached.value.clone())
        } else {
            None
        }
    }

    pub async fn get_description(&self, thing_name: &str, now: DateTime<Utc>) -> Option<ThingDescription> {
        let guard = self.descriptions.read().await;
        let cached = guard.get(thing_name)?;
        if now < cached.cached_at + self.description_trust {
            Some(cached.value.clone())
        } else {
            None
        }
    }
}
