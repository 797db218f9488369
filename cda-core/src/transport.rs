//! The MQTT transport collaborator.
//!
//! The concrete MQTT client library (`rumqttc` et al.) is an external
//! collaborator per the scope note in §1: this module defines only the
//! interface the core consumes, grounded on the teacher's
//! `IoTClientTrait` (`iot_client.rs`), plus an in-memory mock for tests.

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{Mutex, RwLock};

/// MQTT quality-of-service level. Kept minimal -- the core only ever
/// needs "at least once" semantics for shadow traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Up/down state of the underlying network connection, as observed by
/// the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Up,
    Down,
}

/// An inbound message delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set by the broker when the message is a redelivery.
    pub duplicate: bool,
}

pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;
pub type NetworkChangeCallback = Arc<dyn Fn(NetworkState) + Send + Sync>;

/// The MQTT transport seam consumed by [`crate::connectivity::ConnectivityTracker`]
/// and [`crate::network::NetworkStateTracker`].
///
/// Implementations must invoke `on_message`/`on_network_change` callbacks
/// from a background task, never reentrantly from the caller's stack and
/// never blocking the underlying client's I/O loop -- see §5.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError>;
    async fn subscribe(&self, topic_filter: &str) -> Result<(), TransportError>;
    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError>;

    fn network_state(&self) -> NetworkState;

    /// Register the callback invoked for every inbound message on a
    /// subscribed topic. Only one callback is retained; re-registering
    /// replaces it.
    fn on_message(&self, callback: MessageCallback);

    /// Register the callback invoked whenever [`NetworkState`] changes.
    fn on_network_change(&self, callback: NetworkChangeCallback);
}

/// Deterministic in-memory transport for tests, grounded on the
/// teacher's `MockIoTClient`.
#[derive(Clone)]
pub struct MockMqttTransport {
    state: Arc<RwLock<NetworkState>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>, QoS)>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_cb: Arc<StdRwLock<Option<MessageCallback>>>,
    network_cb: Arc<StdRwLock<Option<NetworkChangeCallback>>>,
    fail_publish: Arc<RwLock<bool>>,
}

impl Default for MockMqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMqttTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(NetworkState::Up)),
            published: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_cb: Arc::new(StdRwLock::new(None)),
            network_cb: Arc::new(StdRwLock::new(None)),
            fail_publish: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn published_messages(&self) -> Vec<(String, Vec<u8>, QoS)> {
        self.published.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    /// Test hook: flip the simulated network state and notify listeners.
    pub async fn set_network_state(&self, new_state: NetworkState) {
        let mut guard = self.state.write().await;
        if *guard == new_state {
            return;
        }
        *guard = new_state;
        drop(guard);
        let cb = self.network_cb.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(new_state);
        }
    }

    /// Test hook: make the next publishes fail, simulating a dropped
    /// connection mid-flight.
    pub async fn set_fail_publish(&self, fail: bool) {
        *self.fail_publish.write().await = fail;
    }

    /// Test hook: deliver an inbound message to the registered callback.
    pub async fn deliver(&self, topic: &str, payload: &[u8], duplicate: bool) {
        let cb = self.message_cb.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(InboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                duplicate,
            });
        }
    }
}

#[async_trait]
impl MqttTransport for MockMqttTransport {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        if *self.state.read().await == NetworkState::Down {
            return Err(TransportError::NotConnected);
        }
        if *self.fail_publish.read().await {
            return Err(TransportError::PublishFailed("simulated failure".into()));
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().await.push(topic_filter.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().await.retain(|t| t != topic_filter);
        Ok(())
    }

    fn network_state(&self) -> NetworkState {
        // Best-effort synchronous read; callers that need strict
        // consistency should go through `on_network_change`.
        self.state.try_read().map(|g| *g).unwrap_or(NetworkState::Up)
    }

    fn on_message(&self, callback: MessageCallback) {
        *self.message_cb.write().unwrap() = Some(callback);
    }

    fn on_network_change(&self, callback: NetworkChangeCallback) {
        *self.network_cb.write().unwrap() = Some(callback);
    }
}
