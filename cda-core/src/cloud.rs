//! The cloud identity collaborator.
//!
//! The concrete cloud SDK bindings are an external collaborator per the
//! scope note in §1: this module defines only the interface the core
//! consumes, grounded on the teacher's certificate/security traits
//! (`security.rs::CertificateStore`) and enriched with the definite-
//! negative/transient split from §4.5 and §7.

use crate::error::CloudError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome of a cloud-side certificate verification. A definite negative
/// (`NotAttached`) must never be cached as positive; transport/service
/// failures are `Err(CloudError)` and are "indefinite" per §4.5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Attached { iot_certificate_id: String },
    NotAttached,
}

#[derive(Debug, Clone, Default)]
pub struct ThingAttributes {
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ThingDescription {
    pub thing_name: String,
    pub attributes: HashMap<String, String>,
}

/// The cloud identity seam consumed by [`crate::thing`], [`crate::certregistry`],
/// and [`crate::attributes_cache`].
#[async_trait]
pub trait CloudIdentityClient: Send + Sync {
    async fn verify_certificate(
        &self,
        thing_name: &str,
        certificate_pem: &str,
    ) -> Result<VerifyOutcome, CloudError>;

    async fn get_thing_attributes(&self, thing_name: &str) -> Result<ThingAttributes, CloudError>;

    async fn describe_thing(&self, thing_name: &str) -> Result<ThingDescription, CloudError>;
}

/// Deterministic in-memory cloud client for tests.
#[derive(Clone, Default)]
pub struct MockCloudIdentityClient {
    /// (thing_name, pem) -> outcome. Absent entries are treated as
    /// `CloudError::NotFound`.
    attachments: Arc<RwLock<HashMap<(String, String), VerifyOutcome>>>,
    attributes: Arc<RwLock<HashMap<String, ThingAttributes>>>,
    /// When set, every call returns this error instead (simulates an
    /// offline/unavailable cloud).
    force_error: Arc<RwLock<Option<CloudError>>>,
}

impl MockCloudIdentityClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, thing_name: &str, pem: &str, iot_certificate_id: &str) {
        self.attachments.write().await.insert(
            (thing_name.to_string(), pem.to_string()),
            VerifyOutcome::Attached {
                iot_certificate_id: iot_certificate_id.to_string(),
            },
        );
    }

    pub async fn set_attributes(&self, thing_name: &str, attrs: HashMap<String, String>) {
        self.attributes
            .write()
            .await
            .insert(thing_name.to_string(), ThingAttributes { attributes: attrs });
    }

    pub async fn set_force_error(&self, error: Option<CloudError>) {
        *self.force_error.write().await = error;
    }
}

#[async_trait]
impl CloudIdentityClient for MockCloudIdentityClient {
    async fn verify_certificate(
        &self,
        thing_name: &str,
        certificate_pem: &str,
    ) -> Result<VerifyOutcome, CloudError> {
        if let Some(err) = self.force_error.read().await.clone() {
            return Err(err);
        }
        let key = (thing_name.to_string(), certificate_pem.to_string());
        Ok(self
            .attachments
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or(VerifyOutcome::NotAttached))
    }

    async fn get_thing_attributes(&self, thing_name: &str) -> Result<ThingAttributes, CloudError> {
        if let Some(err) = self.force_error.read().await.clone() {
            return Err(err);
        }
        self.attributes
            .read()
            .await
            .get(thing_name)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(thing_name.to_string()))
    }

    async fn describe_thing(&self, thing_name: &str) -> Result<ThingDescription, CloudError> {
        if let Some(err) = self.force_error.read().await.clone() {
            return Err(err);
        }
        let attrs = self
            .attributes
            .read()
            .await
            .get(thing_name)
            .cloned()
            .unwrap_or_default();
        Ok(ThingDescription {
            thing_name: thing_name.to_string(),
            attributes: attrs.attributes,
        })
    }
}
