//! Certificate Authority: produces X.509 v3 CA and leaf certificates
//! (§4.2).
//!
//! The teacher crate has no certificate-issuance code of its own; this
//! module is enriched from the `rcgen`-based CA construction in
//! `TheCowboyAI-cim-keys`, `lexe-app-lexe-public/lexe-tls/src/lexe_ca.rs`,
//! and the other_examples PKI snippets (`hypermesh-online-hypermesh`
//! trustchain CA, `LucaXiang-Crab` cert profiles), kept in the teacher's
//! module-per-concern style and error handling (`CaError` via
//! `thiserror`).

use crate::error::CaError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Ia5String, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Algorithm tag for a CA or leaf key. `Rsa2048` is the default per §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Rsa2048,
    Rsa4096,
    EcdsaP256,
    EcdsaP384,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Rsa2048
    }
}

impl KeyAlgorithm {
    fn rsa_bits(self) -> Option<usize> {
        match self {
            KeyAlgorithm::Rsa2048 => Some(2048),
            KeyAlgorithm::Rsa4096 => Some(4096),
            _ => None,
        }
    }
}

/// A leaf certificate's intended use, selecting the extended key usage
/// and SAN handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Server,
    Client,
}

/// A CA's private key plus its self-signed certificate. Exactly one
/// current CA exists at a time in [`crate::certstore::CertificateStore`].
pub struct CaKeyPair {
    pub algorithm: KeyAlgorithm,
    pub(crate) key_pair: KeyPair,
    pub certificate_pem: String,
    pub(crate) params: CertificateParams,
}

impl CaKeyPair {
    pub fn subject_common_name(&self) -> Option<String> {
        self.params
            .distinguished_name
            .get(&DnType::CommonName)
            .map(|s| s.to_string())
    }

    /// PEM encoding of the CA's private key, for persistence in the
    /// keystore. Never logged.
    pub fn key_pair_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }
}

/// A freshly issued leaf certificate plus the key pair it was issued
/// for, ready to be handed to a subscriber's callback.
pub struct IssuedLeaf {
    pub certificate_pem: String,
    pub key_pair_pem: String,
    pub not_before: chrono::DateTime<chrono::Utc>,
    pub not_after: chrono::DateTime<chrono::Utc>,
}

fn new_key_pair(algorithm: KeyAlgorithm) -> Result<KeyPair, CaError> {
    match algorithm {
        KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::GenerationFailed(e.to_string())),
        KeyAlgorithm::EcdsaP384 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::GenerationFailed(e.to_string())),
        KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa4096 => {
            let bits = algorithm.rsa_bits().expect("rsa variant has bit size");
            let mut csprng = rand::rngs::OsRng;
            let private_key = rsa::RsaPrivateKey::new(&mut csprng, bits)
                .map_err(|e| CaError::GenerationFailed(e.to_string()))?;
            let pkcs8 = private_key
                .to_pkcs8_der()
                .map_err(|e| CaError::GenerationFailed(e.to_string()))?;
            KeyPair::try_from(pkcs8.as_bytes())
                .map_err(|e| CaError::GenerationFailed(e.to_string()))
        }
    }
}

/// A fresh RSA-2048 key pair, for device certificate requests that
/// specify RSA (§4.1: `newRSAKeyPair`).
pub fn new_rsa_key_pair() -> Result<KeyPair, CaError> {
    new_key_pair(KeyAlgorithm::Rsa2048)
}

/// A fresh NIST P-256 key pair (§4.1: `newECKeyPair`).
pub fn new_ec_key_pair() -> Result<KeyPair, CaError> {
    new_key_pair(KeyAlgorithm::EcdsaP256)
}

fn signature_algorithm_name(algorithm: KeyAlgorithm) -> &'static str {
    match algorithm {
        KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa4096 => "SHA256withRSA",
        KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => "SHA256withECDSA",
    }
}

fn ca_distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn random_serial_number() -> SerialNumber {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 20]; // 160 random bits, per §4.2
    rng.fill(&mut bytes).expect("system RNG must not fail");
    SerialNumber::from_slice(&bytes)
}

/// Produce a new self-signed CA certificate for `algorithm`, subject =
/// issuer = a fixed X.500 name with `common_name` as its CN.
pub fn generate_self_signed_ca(
    algorithm: KeyAlgorithm,
    common_name: &str,
) -> Result<CaKeyPair, CaError> {
    let key_pair = new_key_pair(algorithm)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = ca_distinguished_name(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(random_serial_number());
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(3650);

    let cert = params
        .clone()
        .self_signed(&key_pair)
        .map_err(|e| CaError::GenerationFailed(e.to_string()))?;

    tracing::info!(
        algorithm = ?algorithm,
        signature_algorithm = signature_algorithm_name(algorithm),
        "generated self-signed CA certificate"
    );

    Ok(CaKeyPair {
        algorithm,
        key_pair,
        certificate_pem: cert.pem(),
        params,
    })
}

/// Load a CA from a caller-supplied certificate + private key PEM pair
/// (custom-CA mode, §6).
pub fn load_custom_ca(
    algorithm: KeyAlgorithm,
    certificate_pem: &str,
    private_key_pem: &str,
) -> Result<CaKeyPair, CaError> {
    let key_pair =
        KeyPair::from_pem(private_key_pem).map_err(|e| CaError::GenerationFailed(e.to_string()))?;
    let params = CertificateParams::from_ca_cert_pem(certificate_pem)
        .map_err(|e| CaError::GenerationFailed(e.to_string()))?;
    Ok(CaKeyPair {
        algorithm,
        key_pair,
        certificate_pem: certificate_pem.to_string(),
        params,
    })
}

/// Parse each `host_or_ip` entry as an IPv4/IPv6 address (-> `iPAddress`
/// SAN) or else treat it as a DNS name (-> `dNSName` SAN). Duplicates are
/// filtered, preserving first occurrence.
fn build_san_list(hosts: &[String]) -> Result<Vec<SanType>, CaError> {
    let mut seen = std::collections::HashSet::new();
    let mut sans = Vec::new();
    for host in hosts {
        if !seen.insert(host.clone()) {
            continue;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            sans.push(SanType::IpAddress(ip));
        } else {
            let name = Ia5String::try_from(host.as_str())
                .map_err(|_| CaError::InvalidSanEntry(host.clone()))?;
            sans.push(SanType::DnsName(name));
        }
    }
    Ok(sans)
}

/// Issue a leaf certificate signed by `ca`, for `kind` with subject
/// common name `common_name`. `hosts` is only consulted for
/// `LeafKind::Server` (§4.2: client leaves carry no SAN).
pub fn issue_leaf(
    ca: &CaKeyPair,
    kind: LeafKind,
    common_name: &str,
    hosts: &[String],
    lifetime: Duration,
) -> Result<IssuedLeaf, CaError> {
    let leaf_algorithm = ca.algorithm;
    let leaf_key = new_key_pair(leaf_algorithm)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.serial_number = Some(random_serial_number());

    params.extended_key_usages = vec![match kind {
        LeafKind::Server => ExtendedKeyUsagePurpose::ServerAuth,
        LeafKind::Client => ExtendedKeyUsagePurpose::ClientAuth,
    }];

    if matches!(kind, LeafKind::Server) {
        params.subject_alt_names = build_san_list(hosts)?;
    }

    let now = time::OffsetDateTime::now_utc();
    let not_before = now - time::Duration::minutes(5);
    let not_after = now + time::Duration::seconds(lifetime.as_secs() as i64);
    params.not_before = not_before;
    params.not_after = not_after;

    let issuer = rcgen::Issuer::from_params(&ca.params, &ca.key_pair);
    let cert = params
        .signed_by(&leaf_key, &issuer)
        .map_err(|e| CaError::GenerationFailed(e.to_string()))?;

    Ok(IssuedLeaf {
        certificate_pem: cert.pem(),
        key_pair_pem: leaf_key.serialize_pem(),
        not_before: chrono_from_offset(not_before),
        not_after: chrono_from_offset(not_after),
    })
}

fn chrono_from_offset(t: time::OffsetDateTime) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(t.unix_timestamp(), 0).unwrap_or_else(chrono::Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_ca_is_well_formed() {
        let ca = generate_self_signed_ca(KeyAlgorithm::EcdsaP256, "core").unwrap();
        assert_eq!(ca.subject_common_name().as_deref(), Some("core"));
        assert!(ca.certificate_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn server_leaf_san_parses_ip_and_dns() {
        let ca = generate_self_signed_ca(KeyAlgorithm::EcdsaP256, "core").unwrap();
        let hosts = vec!["1.2.3.4".to_string(), "gw.example".to_string(), "1.2.3.4".to_string()];
        let leaf = issue_leaf(
            &ca,
            LeafKind::Server,
            "core",
            &hosts,
            Duration::from_secs(3600),
        )
        .unwrap();
        assert!(leaf.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.not_after > leaf.not_before);
    }

    #[test]
    fn client_leaf_has_no_san() {
        let ca = generate_self_signed_ca(KeyAlgorithm::EcdsaP256, "core").unwrap();
        let leaf = issue_leaf(&ca, LeafKind::Client, "device-1", &[], Duration::from_secs(3600))
            .unwrap();
        assert!(leaf.certificate_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn rsa2048_key_generation_succeeds() {
        let ca = generate_self_signed_ca(KeyAlgorithm::Rsa2048, "core-rsa").unwrap();
        assert_eq!(ca.algorithm, KeyAlgorithm::Rsa2048);
    }
}
