//! Typed configuration surface.
//!
//! Parsing the on-disk config file format is an external collaborator's
//! job (§1); this module only defines the already-typed shape the core
//! consumes plus the defaults and clamping rules from §4/§6.

use crate::ca::KeyAlgorithm;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SESSION_CACHE_MIN: usize = 1;
pub const SESSION_CACHE_MAX: usize = 10_000;

/// The configured CA key algorithm. Reuses [`crate::ca::KeyAlgorithm`]
/// directly rather than duplicating the variant list.
pub type CaType = KeyAlgorithm;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomCaConfig {
    pub certificate_uri: String,
    pub private_key_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthorityConfig {
    pub ca_type: CaType,
    pub custom_ca: Option<CustomCaConfig>,
    #[serde(with = "humantime_secs")]
    pub server_lifetime: Duration,
    #[serde(with = "humantime_secs")]
    pub client_lifetime: Duration,
    /// Fraction of the lifetime at which a leaf is renewed, in (0, 1].
    pub renewal_fraction: f64,
}

impl Default for CertificateAuthorityConfig {
    fn default() -> Self {
        Self {
            ca_type: CaType::default(),
            custom_ca: None,
            server_lifetime: Duration::from_secs(7 * 24 * 3600),
            client_lifetime: Duration::from_secs(24 * 3600),
            renewal_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub client_device_trust_duration_minutes: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            client_device_trust_duration_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_active_auth_tokens: i64,
    pub certificate_registry_capacity: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_active_auth_tokens: 100,
            certificate_registry_capacity: 10_000,
        }
    }
}

impl PerformanceConfig {
    /// Clamp a possibly malformed/overflowing configured bound into
    /// `[SESSION_CACHE_MIN, SESSION_CACHE_MAX]`, per §4.6.
    pub fn session_cache_capacity(&self) -> usize {
        if self.max_active_auth_tokens < SESSION_CACHE_MIN as i64 {
            SESSION_CACHE_MIN
        } else if self.max_active_auth_tokens > SESSION_CACHE_MAX as i64 {
            SESSION_CACHE_MAX
        } else {
            self.max_active_auth_tokens as usize
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub disable_metrics: bool,
    #[serde(with = "humantime_secs")]
    pub aggregate_period: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            disable_metrics: false,
            aggregate_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    pub host_addresses: Vec<String>,
    pub shadow_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThingAttributesCacheConfig {
    #[serde(with = "humantime_secs")]
    pub refresh_delay: Duration,
    pub association_trust_minutes: u64,
    pub description_trust_minutes: u64,
}

impl Default for ThingAttributesCacheConfig {
    fn default() -> Self {
        Self {
            refresh_delay: Duration::from_secs(60),
            association_trust_minutes: 5,
            description_trust_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdaConfig {
    pub certificate_authority: CertificateAuthorityConfig,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub metrics: MetricsConfig,
    pub connectivity: ConnectivityConfig,
    pub thing_attributes_cache: ThingAttributesCacheConfig,
    pub keystore_dir: String,
    pub certificate_dir: String,
}

impl CdaConfig {
    /// Validate cross-field invariants, turning a malformed configuration
    /// into `ConfigError` rather than panicking downstream.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keystore_dir.is_empty() {
            return Err(ConfigError::Missing("keystore_dir".into()));
        }
        if self.certificate_dir.is_empty() {
            return Err(ConfigError::Missing("certificate_dir".into()));
        }
        if !(0.0..=1.0).contains(&self.certificate_authority.renewal_fraction)
            || self.certificate_authority.renewal_fraction <= 0.0
        {
            return Err(ConfigError::Invalid {
                key: "certificateAuthority.ca.renewalFraction".into(),
                reason: "must be in (0, 1]".into(),
            });
        }
        let custom_ca_partial = self.certificate_authority.custom_ca.as_ref().is_some_and(|c| {
            c.certificate_uri.is_empty() != c.private_key_uri.is_empty()
        });
        if custom_ca_partial {
            return Err(ConfigError::Invalid {
                key: "certificateAuthority.ca".into(),
                reason: "certificateUri and privateKeyUri must both be set or both absent".into(),
            });
        }
        Ok(())
    }

    /// True when both `certificateUri` and `privateKeyUri` are set,
    /// entering custom-CA mode per §6.
    pub fn is_custom_ca(&self) -> bool {
        self.certificate_authority
            .custom_ca
            .as_ref()
            .is_some_and(|c| !c.certificate_uri.is_empty() && !c.private_key_uri.is_empty())
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
