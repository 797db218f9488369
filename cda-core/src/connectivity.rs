//! Shadow monitor: converges a desired/reported/delta document to the
//! latest known desired version and drives server-certificate rotation
//! when the host set changes (§4.4).
//!
//! Grounded on the teacher's `shadow_manager.rs` (`ShadowManagerTrait`,
//! the classic shadow topic set, `Arc<RwLock<..>>` state) generalized
//! from AWS IoT's device shadow into the "connectivity information
//! service" (CIS) this spec names, with an explicit state machine and
//! in-flight coalescing added per §4.4's subtler requirements.

use crate::certmanager::CertificateManager;
use crate::events::{DomainEvent, DomainEventBus};
use crate::transport::{InboundMessage, MqttTransport, NetworkState, QoS};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Host-set equality (§4.4, spec invariant): renaming, reordering, or
/// duplicating entries is not a change.
fn hosts_equal_as_sets(a: &[String], b: &[String]) -> bool {
    let a: HashSet<&String> = a.iter().collect();
    let b: HashSet<&String> = b.iter().collect();
    a == b
}

/// Resolves a desired shadow version into the host addresses it names.
/// An external collaborator per §1 -- the shadow document itself only
/// carries a version token (§4.4), not host data.
#[async_trait]
pub trait ConnectivityInfoProvider: Send + Sync {
    async fn hosts_for_version(&self, version: &str) -> Option<Vec<String>>;
}

/// Deterministic provider for tests: a fixed table from version to host
/// list.
#[derive(Default)]
pub struct StaticConnectivityInfoProvider {
    table: RwLock<std::collections::HashMap<String, Vec<String>>>,
}

impl StaticConnectivityInfoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, version: impl Into<String>, hosts: Vec<String>) {
        self.table.write().await.insert(version.into(), hosts);
    }
}

#[async_trait]
impl ConnectivityInfoProvider for StaticConnectivityInfoProvider {
    async fn hosts_for_version(&self, version: &str) -> Option<Vec<String>> {
        self.table.read().await.get(version).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerState {
    Idle,
    WaitNet,
    Subscribing,
    Fetching,
    Processing,
    IdleReported,
}

enum ShadowTopicKind {
    GetAccepted,
    GetRejected,
    UpdateDelta,
    Other,
}

/// Owns the conversation with the shadow topic tree and the rotation it
/// drives. One instance per configured `shadowName`.
pub struct ConnectivityTracker {
    transport: Arc<dyn MqttTransport>,
    cert_manager: Arc<CertificateManager>,
    info_provider: Arc<dyn ConnectivityInfoProvider>,
    events: Arc<DomainEventBus>,
    shadow_name: String,
    state: RwLock<TrackerState>,
    last_processed_version: RwLock<Option<String>>,
    last_hosts: RwLock<Vec<String>>,
    /// Single pending-version slot; a second delta arriving while one is
    /// being processed overwrites this instead of queuing (§4.4 in-flight
    /// coalescing, option (b)).
    pending_version: RwLock<Option<String>>,
    /// Serializes processing passes so only one drains `pending_version`
    /// at a time.
    processing: Mutex<()>,
}

impl ConnectivityTracker {
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        cert_manager: Arc<CertificateManager>,
        info_provider: Arc<dyn ConnectivityInfoProvider>,
        events: Arc<DomainEventBus>,
        shadow_name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            cert_manager,
            info_provider,
            events,
            shadow_name: shadow_name.into(),
            state: RwLock::new(TrackerState::Idle),
            last_processed_version: RwLock::new(None),
            last_hosts: RwLock::new(Vec::new()),
            pending_version: RwLock::new(None),
            processing: Mutex::new(()),
        })
    }

    fn topic(&self, suffix: &str) -> String {
        format!("$aws/things/{}/shadow/{}", self.shadow_name, suffix)
    }

    fn classify(&self, topic: &str) -> ShadowTopicKind {
        if topic == self.topic("get/accepted") {
            ShadowTopicKind::GetAccepted
        } else if topic == self.topic("get/rejected") {
            ShadowTopicKind::GetRejected
        } else if topic == self.topic("update/delta") {
            ShadowTopicKind::UpdateDelta
        } else {
            ShadowTopicKind::Other
        }
    }

    /// Run the startup protocol: subscribe, then publish an empty `get`.
    /// Also wires a network-change callback so a DOWN→UP transition
    /// re-issues the initial `get` and resumes (§4.4 Network
    /// transitions).
    pub async fn start(self: &Arc<Self>) {
        let tracker = self.clone();
        self.transport.on_message(Arc::new(move |message: InboundMessage| {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.handle_inbound(message).await;
            });
        }));

        let tracker = self.clone();
        self.transport.on_network_change(Arc::new(move |state: NetworkState| {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                if state == NetworkState::Up {
                    tracker.run_startup_protocol().await;
                } else {
                    *tracker.state.write().await = TrackerState::WaitNet;
                }
            });
        }));

        self.run_startup_protocol().await;
    }

    async fn run_startup_protocol(self: &Arc<Self>) {
        if self.transport.network_state() == NetworkState::Down {
            *self.state.write().await = TrackerState::WaitNet;
            return;
        }

        *self.state.write().await = TrackerState::Subscribing;
        for suffix in ["get/accepted", "get/rejected", "update/delta"] {
            let topic = self.topic(suffix);
            if let Err(err) = self.transport.subscribe(&topic).await {
                tracing::warn!(%topic, error = %err, "shadow subscribe failed; will retry on next UP transition");
                return;
            }
        }

        *self.state.write().await = TrackerState::Fetching;
        if let Err(err) = self.transport.publish(&self.topic("get"), b"", QoS::AtLeastOnce).await {
            tracing::warn!(error = %err, "initial shadow get publish failed; will retry on next UP transition");
        }
    }

    async fn handle_inbound(self: &Arc<Self>, message: InboundMessage) {
        match self.classify(&message.topic) {
            ShadowTopicKind::GetAccepted => {
                if let Some(version) = extract_json_pointer(&message.payload, "/state/desired/version") {
                    self.handle_incoming_version(version).await;
                }
            }
            ShadowTopicKind::GetRejected => {
                tracing::debug!("shadow get rejected; waiting for next update/delta");
            }
            ShadowTopicKind::UpdateDelta => {
                if let Some(version) = extract_json_pointer(&message.payload, "/state/version") {
                    self.handle_incoming_version(version).await;
                }
            }
            ShadowTopicKind::Other => {}
        }
    }

    async fn handle_incoming_version(self: &Arc<Self>, version: String) {
        *self.pending_version.write().await = Some(version);
        let _guard = self.processing.lock().await;
        loop {
            let next = self.pending_version.write().await.take();
            match next {
                Some(version) => self.process_version(&version).await,
                None => break,
            }
        }
    }

    async fn process_version(&self, version: &str) {
        if self.last_processed_version.read().await.as_deref() == Some(version) {
            return; // duplicate delta, already converged (§4.4 idempotence)
        }

        *self.state.write().await = TrackerState::Processing;

        if let Some(hosts) = self.info_provider.hosts_for_version(version).await {
            let changed = {
                let mut last = self.last_hosts.write().await;
                if !hosts_equal_as_sets(&last, &hosts) {
                    *last = hosts.clone();
                    true
                } else {
                    false
                }
            };
            if changed {
                self.cert_manager.on_connectivity_changed(hosts).await;
            }
        }

        let payload = serde_json::json!({ "state": { "reported": { "version": version } } });
        let bytes = serde_json::to_vec(&payload).expect("shadow report document always serializes");

        match self
            .transport
            .publish(&self.topic("update"), &bytes, QoS::AtLeastOnce)
            .await
        {
            Ok(()) => {
                *self.last_processed_version.write().await = Some(version.to_string());
                *self.state.write().await = TrackerState::IdleReported;
            }
            Err(err) => {
                tracing::warn!(version, error = %err, "reported-version publish failed; lastProcessedVersion not advanced");
            }
        }
    }

    pub async fn last_processed_version(&self) -> Option<String> {
        self.last_processed_version.read().await.clone()
    }

    /// Tears down the shadow subscriptions and moves the tracker to its
    /// idle terminal state (§4.4 IDLE). Inbound messages on these topics
    /// stop arriving once unsubscribed, so the callback registered in
    /// `start` goes quiet without needing to be torn down itself.
    pub async fn stop(&self) {
        for suffix in ["get/accepted", "get/rejected", "update/delta"] {
            let topic = self.topic(suffix);
            if let Err(err) = self.transport.unsubscribe(&topic).await {
                tracing::warn!(%topic, error = %err, "shadow unsubscribe failed during stop");
            }
        }
        *self.state.write().await = TrackerState::Idle;
    }
}

fn extract_json_pointer(payload: &[u8], pointer: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value.pointer(pointer)?.as_str().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::LeafKind;
    use crate::certstore::CertificateStore;
    use crate::config::CertificateAuthorityConfig;
    use crate::transport::MockMqttTransport;
    use tempfile::tempdir;

    async fn tracker(
        transport: Arc<MockMqttTransport>,
        provider: Arc<StaticConnectivityInfoProvider>,
    ) -> Arc<ConnectivityTracker> {
        let dir = tempdir().unwrap();
        let store = Arc::new(CertificateStore::new(dir.path().join("ca.keystore"), dir.path().join("certs")));
        store.init("a sixteen char passphrase").await.unwrap();
        let events = Arc::new(DomainEventBus::new());
        let cert_manager = CertificateManager::new(store, events.clone(), CertificateAuthorityConfig::default());
        ConnectivityTracker::new(transport, cert_manager, provider, events, "gateway-1")
    }

    #[tokio::test]
    async fn startup_protocol_subscribes_then_fetches() {
        let transport = Arc::new(MockMqttTransport::new());
        let provider = Arc::new(StaticConnectivityInfoProvider::new());
        let t = tracker(transport.clone(), provider).await;
        t.start().await;

        let subs = transport.subscriptions().await;
        assert_eq!(subs.len(), 3);
        let published = transport.published_messages().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "$aws/things/gateway-1/shadow/get");
    }

    #[tokio::test]
    async fn duplicate_delta_is_idempotent() {
        let transport = Arc::new(MockMqttTransport::new());
        let provider = Arc::new(StaticConnectivityInfoProvider::new());
        provider.set("v1", vec!["10.0.0.1".into()]).await;
        let t = tracker(transport.clone(), provider).await;
        t.start().await;

        let payload = serde_json::to_vec(&serde_json::json!({"state": {"version": "v1"}})).unwrap();
        transport
            .deliver("$aws/things/gateway-1/shadow/update/delta", &payload, false)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        transport
            .deliver("$aws/things/gateway-1/shadow/update/delta", &payload, true)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let published = transport.published_messages().await;
        let report_count = published
            .iter()
            .filter(|(topic, _, _)| topic == "$aws/things/gateway-1/shadow/update")
            .count();
        assert_eq!(report_count, 1);
        assert_eq!(t.last_processed_version().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn host_change_triggers_reported_convergence() {
        let transport = Arc::new(MockMqttTransport::new());
        let provider = Arc::new(StaticConnectivityInfoProvider::new());
        provider.set("v2", vec!["10.0.0.2".into()]).await;
        let t = tracker(transport.clone(), provider).await;
        t.start().await;

        let payload = serde_json::to_vec(&serde_json::json!({"state": {"desired": {"version": "v2"}}})).unwrap();
        transport
            .deliver("$aws/things/gateway-1/shadow/get/accepted", &payload, false)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(t.last_processed_version().await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn stop_unsubscribes_every_shadow_topic() {
        let transport = Arc::new(MockMqttTransport::new());
        let provider = Arc::new(StaticConnectivityInfoProvider::new());
        let t = tracker(transport.clone(), provider).await;
        t.start().await;
        assert_eq!(transport.subscriptions().await.len(), 3);

        t.stop().await;
        assert!(transport.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn host_set_reordered_and_duplicated_is_not_a_change() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CertificateStore::new(dir.path().join("ca.keystore"), dir.path().join("certs")));
        store.init("a sixteen char passphrase").await.unwrap();
        let events = Arc::new(DomainEventBus::new());
        let cert_manager = CertificateManager::new(store, events.clone(), CertificateAuthorityConfig::default());

        let rotations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let rotations2 = rotations.clone();
        cert_manager
            .subscribe(crate::certmanager::SubscribeRequest {
                service_id: "mqtt-broker".into(),
                kind: LeafKind::Server,
                common_name: "core".into(),
                callback: Arc::new(move |_material| {
                    rotations2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }),
            })
            .await
            .unwrap();
        rotations.store(0, std::sync::atomic::Ordering::SeqCst); // ignore the immediate subscribe issuance

        let transport = Arc::new(MockMqttTransport::new());
        let provider = Arc::new(StaticConnectivityInfoProvider::new());
        provider.set("v1", vec!["10.0.0.1".into(), "10.0.0.2".into()]).await;
        provider
            .set("v2", vec!["10.0.0.2".into(), "10.0.0.1".into(), "10.0.0.1".into()])
            .await;
        let t = ConnectivityTracker::new(transport.clone(), cert_manager, provider, events, "gateway-1");
        t.start().await;

        let payload = serde_json::to_vec(&serde_json::json!({"state": {"version": "v1"}})).unwrap();
        transport
            .deliver("$aws/things/gateway-1/shadow/update/delta", &payload, false)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // v2 names the same host set, just reordered and with a
        // duplicate -- this must not trigger certificate rotation.
        let payload = serde_json::to_vec(&serde_json::json!({"state": {"version": "v2"}})).unwrap();
        transport
            .deliver("$aws/things/gateway-1/shadow/update/delta", &payload, false)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(t.last_processed_version().await.as_deref(), Some("v2"));
        assert_eq!(rotations.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
