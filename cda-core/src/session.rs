//! Session authentication, attribute providers, and the bounded LRU
//! session cache (§4.6, §3).
//!
//! Grounded on the teacher's `iot_client.rs` connection/session
//! bookkeeping style (`Arc<RwLock<HashMap<..>>>` plus an explicit
//! recency list for eviction, rather than a third-party LRU crate) and
//! `certregistry.rs`'s same approximate-LRU shape.

use crate::certregistry::CertificateRegistry;
use crate::config::{SESSION_CACHE_MAX, SESSION_CACHE_MIN};
use crate::error::AuthenticationError;
use crate::events::{DomainEvent, DomainEventBus};
use crate::thing::{ThingRegistry, VerifyAttachedInput, VerifyThingAttachedToCertificate, VerifyThingAttachedUseCase};
use crate::usecase::{Scope, UseCase, UseCaseRegistry};
use async_trait::async_trait;
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A namespaced attribute provider on a session (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeNamespace {
    Thing,
    Certificate,
    Component,
}

impl AttributeNamespace {
    pub fn parse(namespace: &str) -> Option<Self> {
        match namespace {
            "Thing" => Some(Self::Thing),
            "Certificate" => Some(Self::Certificate),
            "Component" => Some(Self::Component),
            _ => None,
        }
    }
}

/// An authenticated session. Attributes are flattened into a
/// `(namespace, path) -> value` map at construction time; real-world
/// attribute providers (e.g. live thing-attribute refreshes) layer on
/// top via [`crate::attributes_cache::ThingAttributesCache`].
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    attributes: HashMap<(AttributeNamespace, String), String>,
    /// Identifies "the same client" for re-authentication replacement
    /// (§4.6): same certificate id + same MQTT client id.
    client_key: String,
}

impl Session {
    pub fn get_attribute(&self, namespace: AttributeNamespace, path: &str) -> Option<&str> {
        self.attributes
            .get(&(namespace, path.to_string()))
            .map(String::as_str)
    }
}

pub(crate) struct SessionBuilder {
    client_key: String,
    attributes: HashMap<(AttributeNamespace, String), String>,
}

impl SessionBuilder {
    pub(crate) fn new(client_key: impl Into<String>) -> Self {
        Self {
            client_key: client_key.into(),
            attributes: HashMap::new(),
        }
    }

    pub(crate) fn with(mut self, namespace: AttributeNamespace, path: &str, value: impl Into<String>) -> Self {
        self.attributes.insert((namespace, path.to_string()), value.into());
        self
    }

    pub(crate) fn build(self, id: String) -> Session {
        Session {
            id,
            attributes: self.attributes,
            client_key: self.client_key,
        }
    }
}

/// Credentials presented to `SessionManager::create_session`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub certificate_pem: Option<String>,
    pub thing_name: Option<String>,
}

/// Produces a `Session` for one `credentialType` (e.g. `"mqtt"`),
/// registered with the manager at start (§4.6).
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, credentials: &Credentials) -> Result<Session, AuthenticationError>;
}

/// The MQTT session factory (§4.6): certificate validation, thing-
/// attachment confirmation, and a component bypass for local clients.
/// Thing-attachment verification is resolved through a `UseCaseRegistry`
/// (§4.9) rather than called on `ThingRegistry` directly, matching the
/// handlers-invoke-use-cases control flow this spec documents.
pub struct MqttSessionFactory {
    certificate_registry: Arc<CertificateRegistry>,
    use_cases: Arc<UseCaseRegistry>,
    /// Local component client ids that bypass thing/cert checks
    /// entirely and receive a `Component`-typed session.
    known_components: HashSet<String>,
}

impl MqttSessionFactory {
    pub fn new(
        certificate_registry: Arc<CertificateRegistry>,
        thing_registry: Arc<ThingRegistry>,
        known_components: HashSet<String>,
    ) -> Self {
        let use_cases = Arc::new(UseCaseRegistry::new());
        use_cases.register::<VerifyThingAttachedToCertificate, VerifyThingAttachedUseCase>(
            Scope::Singleton,
            move || VerifyThingAttachedUseCase::new(thing_registry.clone()),
        );
        Self {
            certificate_registry,
            use_cases,
            known_components,
        }
    }
}

#[async_trait]
impl SessionFactory for MqttSessionFactory {
    async fn create(&self, credentials: &Credentials) -> Result<Session, AuthenticationError> {
        if self.known_components.contains(&credentials.client_id) {
            let builder = SessionBuilder::new(format!("component:{}", credentials.client_id))
                .with(AttributeNamespace::Component, "component", credentials.client_id.clone());
            return Ok(builder.build(String::new()));
        }

        let thing_name = credentials.thing_name.as_deref().ok_or_else(|| {
            AuthenticationError::UnknownCredentialType("missing thingName".into())
        })?;
        let pem = credentials.certificate_pem.as_deref().ok_or_else(|| {
            AuthenticationError::UnknownCredentialType("missing certificatePem".into())
        })?;

        let iot_cert_id = self
            .certificate_registry
            .get_iot_certificate_id_for_pem(thing_name, pem)
            .await
            .map_err(AuthenticationError::CloudServiceInteraction)?
            .ok_or(AuthenticationError::CertificateNotRecognized)?;

        let verify_use_case = self
            .use_cases
            .resolve::<VerifyThingAttachedToCertificate, VerifyThingAttachedUseCase>()
            .expect("VerifyThingAttachedToCertificate is registered in MqttSessionFactory::new");
        let decision = verify_use_case
            .execute(VerifyAttachedInput {
                thing_name: thing_name.to_string(),
                certificate_pem: pem.to_string(),
                network_up: true,
                now: Utc::now(),
            })
            .await
            .map_err(|e| AuthenticationError::UnknownCredentialType(e.to_string()))?;
        if !decision.attached {
            return Err(AuthenticationError::NotAttached);
        }

        let client_key = format!("{iot_cert_id}:{}", credentials.client_id);
        let builder = SessionBuilder::new(client_key)
            .with(AttributeNamespace::Thing, "ThingName", thing_name.to_string())
            .with(AttributeNamespace::Certificate, "CertificateId", iot_cert_id);
        Ok(builder.build(String::new()))
    }
}

/// Authenticates credentials into sessions and enforces the bounded LRU
/// session cache (§4.6).
pub struct SessionManager {
    factories: RwLock<HashMap<String, Arc<dyn SessionFactory>>>,
    sessions: RwLock<HashMap<String, Session>>,
    recency: RwLock<VecDeque<String>>,
    by_client_key: RwLock<HashMap<String, String>>,
    capacity: usize,
    events: Arc<DomainEventBus>,
    rng: SystemRandom,
}

impl SessionManager {
    pub fn new(capacity: usize, events: Arc<DomainEventBus>) -> Self {
        let capacity = capacity.clamp(SESSION_CACHE_MIN, SESSION_CACHE_MAX);
        Self {
            factories: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            recency: RwLock::new(VecDeque::new()),
            by_client_key: RwLock::new(HashMap::new()),
            capacity,
            events,
            rng: SystemRandom::new(),
        }
    }

    pub async fn register_factory(&self, credential_type: impl Into<String>, factory: Arc<dyn SessionFactory>) {
        self.factories.write().await.insert(credential_type.into(), factory);
    }

    fn generate_id(&self) -> String {
        let mut bytes = [0u8; 16]; // 128-bit opaque token
        self.rng.fill(&mut bytes).expect("system RNG must not fail");
        hex::encode(bytes)
    }

    /// Selects a factory by `credential_type` and authenticates
    /// `credentials`. If the resulting session identifies an
    /// already-active client, the prior session is invalidated and
    /// replaced (§4.6).
    pub async fn create_session(
        &self,
        credential_type: &str,
        credentials: Credentials,
    ) -> Result<String, AuthenticationError> {
        let factory = self
            .factories
            .read()
            .await
            .get(credential_type)
            .cloned()
            .ok_or_else(|| AuthenticationError::UnknownCredentialType(credential_type.to_string()))?;

        let session = match factory.create(&credentials).await {
            Ok(session) => session,
            Err(err) => {
                self.events.emit(DomainEvent::SessionCreationFailure {
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        let id = loop {
            let candidate = self.generate_id();
            if !self.sessions.read().await.contains_key(&candidate) {
                break candidate;
            }
        };

        if let Some(prior_id) = self.by_client_key.write().await.insert(session.client_key.clone(), id.clone()) {
            self.evict(&prior_id).await;
        }

        let session = Session { id: id.clone(), ..session };
        self.insert(id.clone(), session).await;
        self.events.emit(DomainEvent::SessionCreationSuccess { session_id: id.clone() });
        Ok(id)
    }

    async fn insert(&self, id: String, session: Session) {
        let evicted_client_key = {
            let mut sessions = self.sessions.write().await;
            let mut recency = self.recency.write().await;

            let mut evicted_client_key = None;
            if sessions.len() >= self.capacity && !sessions.contains_key(&id) {
                if let Some(oldest) = recency.pop_front() {
                    evicted_client_key = sessions.remove(&oldest).map(|s| s.client_key);
                }
            }

            sessions.insert(id.clone(), session);
            recency.retain(|existing| existing != &id);
            recency.push_back(id);
            evicted_client_key
        };

        if let Some(client_key) = evicted_client_key {
            self.by_client_key.write().await.remove(&client_key);
        }
    }

    pub async fn find_session(&self, id: &str) -> Option<Session> {
        let session = self.sessions.read().await.get(id).cloned()?;
        let mut recency = self.recency.write().await;
        recency.retain(|existing| existing != id);
        recency.push_back(id.to_string());
        Some(session)
    }

    pub async fn close_session(&self, id: &str) {
        self.evict(id).await;
    }

    async fn evict(&self, id: &str) {
        let removed = self.sessions.write().await.remove(id);
        self.recency.write().await.retain(|existing| existing != id);
        if let Some(session) = removed {
            self.by_client_key.write().await.remove(&session.client_key);
        }
    }
}
