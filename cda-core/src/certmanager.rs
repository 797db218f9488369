//! Tracks certificate subscriptions, issues leaves, and drives
//! expiry/connectivity-triggered rotation (§4.3).
//!
//! Grounded on the teacher's `shadow_manager.rs` subscription-handle
//! pattern (`Arc<RwLock<HashMap<..>>>` of registered callbacks) and the
//! per-entity locking discipline from §5: each generator gets its own
//! `tokio::Mutex` so re-issuance is serialized per generator but
//! parallel across generators.

use crate::ca::{self, CaKeyPair, LeafKind};
use crate::certstore::CertificateStore;
use crate::config::CertificateAuthorityConfig;
use crate::error::{CaError, CertManagerError};
use crate::events::{DomainEvent, DomainEventBus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Material handed to a subscriber's callback on initial issuance and
/// every rotation (§4.3).
#[derive(Debug, Clone)]
pub struct IssuedMaterial {
    pub leaf_pem: String,
    pub ca_chain_pem: Vec<String>,
    pub key_pair_pem: String,
    pub issued_at: DateTime<Utc>,
}

pub type IssuedCallback = Arc<dyn Fn(IssuedMaterial) + Send + Sync>;

/// A certificate subscription request (§3: CertificateGenerator).
pub struct SubscribeRequest {
    pub service_id: String,
    pub kind: LeafKind,
    pub common_name: String,
    pub callback: IssuedCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Generator {
    service_id: String,
    kind: LeafKind,
    common_name: String,
    callback: IssuedCallback,
    /// Serializes re-issuance for this generator; separate generators
    /// rotate in parallel (§4.3 Concurrency).
    reissue_lock: Mutex<()>,
    /// When this generator's current leaf was issued; the per-generator
    /// expiry sweep reissues once `now >= issuedAt + renewalDelay(kind)`
    /// (§3: CertificateGenerator, §4.3 Rotation trigger 3).
    issued_at: RwLock<DateTime<Utc>>,
}

/// Tracks subscriptions for certificate updates and reissues leaves on
/// CA replacement, connectivity changes, or per-generator expiry.
pub struct CertificateManager {
    store: Arc<CertificateStore>,
    events: Arc<DomainEventBus>,
    config: RwLock<CertificateAuthorityConfig>,
    generators: RwLock<HashMap<u64, Arc<Generator>>>,
    next_handle: AtomicU64,
    hosts: RwLock<Vec<String>>,
    renewal_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CertificateManager {
    /// How often the per-generator expiry sweep runs, once `start` is
    /// called. Coarser than any realistic renewal deadline so the sweep
    /// never dominates CPU on a long-lived process.
    const RENEWAL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(
        store: Arc<CertificateStore>,
        events: Arc<DomainEventBus>,
        config: CertificateAuthorityConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            config: RwLock::new(config),
            generators: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            hosts: RwLock::new(Vec::new()),
            renewal_task: StdMutex::new(None),
        })
    }

    /// Spawns the per-generator expiry sweep (§4.3 Rotation trigger 3).
    /// Idempotent to call once at startup, matching the teacher's
    /// `shadow_manager.rs::start` shape also used by
    /// [`crate::attributes_cache::ThingAttributesCache::start`] and
    /// [`crate::connectivity::ConnectivityTracker::start`].
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Self::RENEWAL_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                this.sweep_expired_generators(Utc::now()).await;
            }
        });
        *self.renewal_task.lock().unwrap() = Some(handle);
    }

    /// Aborts the expiry sweep, moving the manager to its idle terminal
    /// state (§4.4 IDLE).
    pub fn stop(&self) {
        if let Some(handle) = self.renewal_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Reissues every generator whose renewal deadline has passed as of
    /// `now`. Takes an explicit `now` (rather than reading the clock
    /// itself) so the sweep is directly testable, matching
    /// `ThingAttributesCache::refresh_once`'s shape.
    pub async fn sweep_expired_generators(&self, now: DateTime<Utc>) {
        let snapshot: Vec<(u64, Arc<Generator>)> = self
            .generators
            .read()
            .await
            .iter()
            .map(|(handle, generator)| (*handle, generator.clone()))
            .collect();

        for (handle, generator) in snapshot {
            let delay = self.renewal_delay(generator.kind).await;
            let chrono_delay = ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
            let deadline = *generator.issued_at.read().await + chrono_delay;
            if now >= deadline {
                if let Err(err) = self.reissue_one(SubscriptionHandle(handle)).await {
                    tracing::error!(
                        service_id = %generator.service_id,
                        error = %err,
                        "per-generator expiry renewal failed; prior leaf remains in force"
                    );
                }
            }
        }
    }

    /// One PEM for the current CA (§4.3).
    pub async fn get_ca_certificates(&self) -> Result<Vec<String>, CertManagerError> {
        let ca = self.store.current_ca().await.map_err(|e| {
            CertManagerError::Ca(CaError::GenerationFailed(e.to_string()))
        })?;
        Ok(vec![ca.certificate_pem.clone()])
    }

    /// Immediately issues a certificate and invokes `request.callback`,
    /// then registers the generator for rotation. Per §4.3, repeated
    /// subscriptions with identical options each issue a fresh leaf --
    /// this method never deduplicates by (service_id, kind, common_name).
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<SubscriptionHandle, CertManagerError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let generator = Arc::new(Generator {
            service_id: request.service_id,
            kind: request.kind,
            common_name: request.common_name,
            callback: request.callback,
            reissue_lock: Mutex::new(()),
            issued_at: RwLock::new(Utc::now()),
        });

        self.issue_and_notify(&generator).await?;

        self.generators.write().await.insert(handle.0, generator);
        Ok(handle)
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), CertManagerError> {
        self.generators
            .write()
            .await
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(CertManagerError::UnknownSubscription)
    }

    /// Replace the CA with a freshly generated one, persist it, and
    /// reissue every registered generator (§4.3).
    pub async fn generate_ca(
        &self,
        passphrase: &str,
        algorithm: crate::ca::KeyAlgorithm,
    ) -> Result<(), CertManagerError> {
        let ca = ca::generate_self_signed_ca(algorithm, "cda-gateway-ca")?;
        self.store
            .replace_ca(passphrase, ca)
            .await
            .map_err(|e| CertManagerError::Ca(CaError::GenerationFailed(e.to_string())))?;
        self.events.emit(DomainEvent::CaCertificateChainChanged);
        self.reissue_all().await;
        Ok(())
    }

    /// Adopt a caller-supplied CA certificate/key pair (custom-CA mode,
    /// §6) and reissue every registered generator.
    pub async fn configure_custom_ca(
        &self,
        passphrase: &str,
        algorithm: crate::ca::KeyAlgorithm,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<(), CertManagerError> {
        let ca = ca::load_custom_ca(algorithm, certificate_pem, private_key_pem)?;
        self.store
            .replace_ca(passphrase, ca)
            .await
            .map_err(|e| CertManagerError::Ca(CaError::GenerationFailed(e.to_string())))?;
        self.events.emit(DomainEvent::CaCertificateChainChanged);
        self.reissue_all().await;
        Ok(())
    }

    /// Rotation trigger 2: reissue only server generators, recomputing
    /// SAN from the newly observed host set (§4.3).
    pub async fn on_connectivity_changed(&self, hosts: Vec<String>) {
        *self.hosts.write().await = hosts.clone();
        self.events.emit(DomainEvent::ConnectivityChanged { hosts });

        let snapshot: Vec<Arc<Generator>> = self
            .generators
            .read()
            .await
            .values()
            .filter(|g| g.kind == LeafKind::Server)
            .cloned()
            .collect();
        for generator in snapshot {
            if let Err(err) = self.issue_and_notify(&generator).await {
                tracing::error!(
                    service_id = %generator.service_id,
                    error = %err,
                    "server certificate rotation on connectivity change failed; prior leaf remains in force"
                );
            }
        }
    }

    /// Rotation trigger 3: reissue a single generator on its expiry
    /// timer. The caller (a scheduled task) is responsible for timing;
    /// this just performs the reissuance.
    pub async fn reissue_one(&self, handle: SubscriptionHandle) -> Result<(), CertManagerError> {
        let generator = self
            .generators
            .read()
            .await
            .get(&handle.0)
            .cloned()
            .ok_or(CertManagerError::UnknownSubscription)?;
        self.issue_and_notify(&generator).await
    }

    async fn reissue_all(&self) {
        let snapshot: Vec<Arc<Generator>> = self.generators.read().await.values().cloned().collect();
        for generator in snapshot {
            if let Err(err) = self.issue_and_notify(&generator).await {
                tracing::error!(
                    service_id = %generator.service_id,
                    error = %err,
                    "certificate reissuance on CA replacement failed; prior leaf remains in force"
                );
            }
        }
    }

    async fn issue_and_notify(&self, generator: &Arc<Generator>) -> Result<(), CertManagerError> {
        let _guard = generator.reissue_lock.lock().await;

        let ca: Arc<CaKeyPair> = self
            .store
            .current_ca()
            .await
            .map_err(|e| CertManagerError::Ca(CaError::GenerationFailed(e.to_string())))?;
        let config = self.config.read().await.clone();
        let lifetime = match generator.kind {
            LeafKind::Server => config.server_lifetime,
            LeafKind::Client => config.client_lifetime,
        };
        let hosts = self.hosts.read().await.clone();

        let result = ca::issue_leaf(&ca, generator.kind, &generator.common_name, &hosts, lifetime);
        match result {
            Ok(leaf) => {
                let issued_at = Utc::now();
                *generator.issued_at.write().await = issued_at;
                (generator.callback)(IssuedMaterial {
                    leaf_pem: leaf.certificate_pem,
                    ca_chain_pem: vec![ca.certificate_pem.clone()],
                    key_pair_pem: leaf.key_pair_pem,
                    issued_at,
                });
                self.events.emit(DomainEvent::CertificateSubscriptionSuccess);
                Ok(())
            }
            Err(err) => {
                self.events.emit(DomainEvent::CertificateSubscriptionFail);
                Err(CertManagerError::Ca(err))
            }
        }
    }

    /// The renewal deadline for a freshly issued generator of `kind`,
    /// per the current configuration's lifetime and renewal fraction
    /// (§3: CertificateGenerator).
    pub async fn renewal_delay(&self, kind: LeafKind) -> Duration {
        let config = self.config.read().await;
        let lifetime = match kind {
            LeafKind::Server => config.server_lifetime,
            LeafKind::Client => config.client_lifetime,
        };
        Duration::from_secs_f64(lifetime.as_secs_f64() * config.renewal_fraction)
    }
}
