//! Things and their trust model for thing↔certificate attachments
//! (§4.5, §3).
//!
//! Grounded on `security.rs`'s `Arc<RwLock<HashMap<..>>>` registry idiom,
//! generalized from certificate storage to the attachment-with-trust-
//! window model this spec requires.

use crate::cloud::CloudIdentityClient;
use crate::error::{CloudError, ThingError};
use crate::usecase::UseCase;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// `SHA-256` hex digest of a certificate's PEM bytes -- the local
/// attachment key, shared with `certregistry.rs` (§3: `DeviceCertificate`).
pub fn certificate_id_of_pem(pem: &str) -> String {
    hex::encode(Sha256::digest(pem.as_bytes()))
}

static THING_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_:\-]+$").expect("valid regex"));

pub fn validate_thing_name(name: &str) -> Result<(), ThingError> {
    if !name.is_empty() && THING_NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ThingError::InvalidName(name.to_string()))
    }
}

/// Where a verification decision came from (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentSource {
    Cloud,
    Local,
}

/// Result of `VerifyThingAttachedToCertificate` (§4.5).
#[derive(Debug, Clone)]
pub struct AttachmentDecision {
    pub attached: bool,
    pub source: AttachmentSource,
    pub last_attached: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A registered thing with its set of locally-known certificate
/// attachments, each timestamped with its last confirmation.
pub struct Thing {
    pub thing_name: String,
    attachments: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl Thing {
    fn new(thing_name: String) -> Self {
        Self {
            thing_name,
            attachments: RwLock::new(HashMap::new()),
        }
    }

    async fn record_attachment(&self, cert_id: &str, now: DateTime<Utc>) {
        self.attachments.write().await.insert(cert_id.to_string(), now);
    }

    /// Trusted iff `now < lastAttached + trustDuration` (§3 invariant).
    async fn local_decision(
        &self,
        cert_id: &str,
        now: DateTime<Utc>,
        trust_duration: ChronoDuration,
    ) -> AttachmentDecision {
        match self.attachments.read().await.get(cert_id) {
            Some(last_attached) => {
                let expires_at = *last_attached + trust_duration;
                AttachmentDecision {
                    attached: now < expires_at,
                    source: AttachmentSource::Local,
                    last_attached: Some(*last_attached),
                    expires_at: Some(expires_at),
                }
            }
            None => AttachmentDecision {
                attached: false,
                source: AttachmentSource::Local,
                last_attached: None,
                expires_at: None,
            },
        }
    }
}

/// Registry of things, plus the cloud-first/local-fallback verification
/// policy (§4.5).
pub struct ThingRegistry {
    things: RwLock<HashMap<String, Arc<Thing>>>,
    cloud: Arc<dyn CloudIdentityClient>,
    /// Mutable per `SecurityConfigurationChanged` (§4.5): a change takes
    /// effect on the next evaluation.
    trust_duration_minutes: RwLock<u64>,
}

impl ThingRegistry {
    pub fn new(cloud: Arc<dyn CloudIdentityClient>, trust_duration_minutes: u64) -> Self {
        Self {
            things: RwLock::new(HashMap::new()),
            cloud,
            trust_duration_minutes: RwLock::new(trust_duration_minutes),
        }
    }

    pub async fn set_trust_duration_minutes(&self, minutes: u64) {
        *self.trust_duration_minutes.write().await = minutes;
    }

    pub async fn get_or_create(&self, thing_name: &str) -> Result<Arc<Thing>, ThingError> {
        validate_thing_name(thing_name)?;
        let mut things = self.things.write().await;
        Ok(things
            .entry(thing_name.to_string())
            .or_insert_with(|| Arc::new(Thing::new(thing_name.to_string())))
            .clone())
    }

    /// `VerifyThingAttachedToCertificate` (§4.5): cloud-first when the
    /// network is up, falling back to the local trust window on
    /// indefinite cloud answers or when offline. `certificate_pem` is
    /// hashed into the local attachment key via [`certificate_id_of_pem`].
    pub async fn verify_attached(
        &self,
        thing_name: &str,
        certificate_pem: &str,
        network_up: bool,
        now: DateTime<Utc>,
    ) -> Result<AttachmentDecision, ThingError> {
        let thing = self.get_or_create(thing_name).await?;
        let trust_duration = ChronoDuration::minutes(*self.trust_duration_minutes.read().await as i64);
        let cert_id = certificate_id_of_pem(certificate_pem);

        if network_up {
            match self.cloud.verify_certificate(thing_name, certificate_pem).await {
                Ok(crate::cloud::VerifyOutcome::Attached { .. }) => {
                    thing.record_attachment(&cert_id, now).await;
                    let expires_at = now + trust_duration;
                    return Ok(AttachmentDecision {
                        attached: true,
                        source: AttachmentSource::Cloud,
                        last_attached: Some(now),
                        expires_at: Some(expires_at),
                    });
                }
                Ok(crate::cloud::VerifyOutcome::NotAttached) => {
                    return Ok(AttachmentDecision {
                        attached: false,
                        source: AttachmentSource::Cloud,
                        last_attached: None,
                        expires_at: None,
                    });
                }
                Err(err) if err.is_definite_negative() => {
                    return Ok(AttachmentDecision {
                        attached: false,
                        source: AttachmentSource::Cloud,
                        last_attached: None,
                        expires_at: None,
                    });
                }
                Err(CloudError::Unavailable(_))
                | Err(CloudError::Throttled(_))
                | Err(CloudError::Interrupted) => {
                    // Indefinite: fall through to the local decision below.
                }
                Err(err) => {
                    tracing::warn!(error = %err, "unexpected cloud verification error; falling back to local trust");
                }
            }
        }

        Ok(thing.local_decision(&cert_id, now, trust_duration).await)
    }
}

/// Marker type naming the `VerifyThingAttachedToCertificate` use case
/// (§4.5, §4.9), resolved from a `UseCaseRegistry`.
pub struct VerifyThingAttachedToCertificate;

/// Input to the `VerifyThingAttachedToCertificate` use case.
pub struct VerifyAttachedInput {
    pub thing_name: String,
    pub certificate_pem: String,
    pub network_up: bool,
    pub now: DateTime<Utc>,
}

/// Concrete implementation resolved for the
/// `VerifyThingAttachedToCertificate` marker: a thin wrapper around a
/// shared [`ThingRegistry`], so handlers invoke the use case rather
/// than calling the registry directly (§4.9).
#[derive(Clone)]
pub struct VerifyThingAttachedUseCase {
    registry: Arc<ThingRegistry>,
}

impl VerifyThingAttachedUseCase {
    pub fn new(registry: Arc<ThingRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl UseCase<VerifyAttachedInput, AttachmentDecision, ThingError> for VerifyThingAttachedUseCase {
    async fn execute(&self, input: VerifyAttachedInput) -> Result<AttachmentDecision, ThingError> {
        self.registry
            .verify_attached(&input.thing_name, &input.certificate_pem, input.network_up, input.now)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudIdentityClient;

    #[test]
    fn thing_name_validation() {
        assert!(validate_thing_name("device-1:sensor_A").is_ok());
        assert!(validate_thing_name("").is_err());
        assert!(validate_thing_name("bad name").is_err());
        assert!(validate_thing_name("bad/name").is_err());
    }

    #[tokio::test]
    async fn cloud_attached_records_local_attachment() {
        let cloud = Arc::new(MockCloudIdentityClient::new());
        cloud.attach("thing-1", "PEM-1", "iot-cert-1").await;
        let registry = ThingRegistry::new(cloud, 60);

        let decision = registry
            .verify_attached("thing-1", "PEM-1", true, Utc::now())
            .await
            .unwrap();
        assert!(decision.attached);
        assert_eq!(decision.source, AttachmentSource::Cloud);
    }

    #[tokio::test]
    async fn offline_falls_back_to_local_trust_window() {
        let cloud = Arc::new(MockCloudIdentityClient::new());
        cloud.attach("thing-1", "PEM-1", "iot-cert-1").await;
        let registry = ThingRegistry::new(cloud, 60);

        let now = Utc::now();
        registry.verify_attached("thing-1", "PEM-1", true, now).await.unwrap();

        let later = now + ChronoDuration::minutes(5);
        let decision = registry
            .verify_attached("thing-1", "PEM-1", false, later)
            .await
            .unwrap();
        assert!(decision.attached);
        assert_eq!(decision.source, AttachmentSource::Local);
    }

    #[tokio::test]
    async fn expired_local_attachment_is_not_attached() {
        let cloud = Arc::new(MockCloudIdentityClient::new());
        cloud.attach("thing-1", "PEM-1", "iot-cert-1").await;
        let registry = ThingRegistry::new(cloud, 5);

        let now = Utc::now();
        registry.verify_attached("thing-1", "PEM-1", true, now).await.unwrap();

        let later = now + ChronoDuration::minutes(10);
        let decision = registry
            .verify_attached("thing-1", "PEM-1", false, later)
            .await
            .unwrap();
        assert!(!decision.attached);
    }

    #[tokio::test]
    async fn use_case_wrapper_delegates_to_the_registry() {
        let cloud = Arc::new(MockCloudIdentityClient::new());
        cloud.attach("thing-1", "PEM-1", "iot-cert-1").await;
        let registry = Arc::new(ThingRegistry::new(cloud, 60));
        let use_case = VerifyThingAttachedUseCase::new(registry);

        let decision = use_case
            .execute(VerifyAttachedInput {
                thing_name: "thing-1".to_string(),
                certificate_pem: "PEM-1".to_string(),
                network_up: true,
                now: Utc::now(),
            })
            .await
            .unwrap();
        assert!(decision.attached);
        assert_eq!(decision.source, AttachmentSource::Cloud);
    }
}
