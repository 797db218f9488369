//! Certificate storage: the CA keystore plus the content-addressed
//! device certificate directory (§4.1, §6).
//!
//! Grounded on `security.rs`'s `CertificateStore` trait shape (store/get
//! by id, `Arc<RwLock<..>>` state), generalized from an in-memory map to
//! the passphrase-encrypted on-disk keystore this spec requires.

pub mod keystore;

use crate::ca::{self, CaKeyPair, KeyAlgorithm};
use crate::error::KeystoreError;
use ring::rand::{SecureRandom, SystemRandom};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Owns the CA keystore and the device certificate directory. The CA
/// itself is guarded by a single writer lock with cheap shared reads
/// (`tokio::sync::RwLock` around an `Arc`, per §5); device certificate
/// writes are serialized behind one directory-wide lock.
pub struct CertificateStore {
    keystore_path: PathBuf,
    cert_dir: PathBuf,
    ca: RwLock<Option<Arc<CaKeyPair>>>,
    write_lock: Mutex<()>,
}

impl CertificateStore {
    pub fn new(keystore_path: impl Into<PathBuf>, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            keystore_path: keystore_path.into(),
            cert_dir: cert_dir.into(),
            ca: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the keystore at startup. Creates a new `RSA-2048` CA under
    /// `passphrase` if none is present or the passphrase does not
    /// decrypt the existing file (§4.1).
    pub async fn init(&self, passphrase: &str) -> Result<(), KeystoreError> {
        let ca = keystore::open_or_create(&self.keystore_path, passphrase, KeyAlgorithm::Rsa2048)?;
        *self.ca.write().await = Some(Arc::new(ca));
        Ok(())
    }

    /// Open the keystore with an explicit default algorithm, used when
    /// no keystore exists yet and the configured `caType` is not the
    /// RSA-2048 default.
    pub async fn init_with_algorithm(
        &self,
        passphrase: &str,
        default_algorithm: KeyAlgorithm,
    ) -> Result<(), KeystoreError> {
        let ca = keystore::open_or_create(&self.keystore_path, passphrase, default_algorithm)?;
        *self.ca.write().await = Some(Arc::new(ca));
        Ok(())
    }

    pub async fn current_ca(&self) -> Result<Arc<CaKeyPair>, KeystoreError> {
        self.ca
            .read()
            .await
            .clone()
            .ok_or_else(|| KeystoreError::Unavailable("CA keystore not initialized".into()))
    }

    /// Replace the current CA, persisting it under `passphrase`. Used by
    /// `CertificateManager::generate_ca`/`configure_custom_ca` (§4.3).
    pub async fn replace_ca(
        &self,
        passphrase: &str,
        ca: CaKeyPair,
    ) -> Result<Arc<CaKeyPair>, KeystoreError> {
        keystore::persist(&self.keystore_path, passphrase, &ca)?;
        let ca = Arc::new(ca);
        *self.ca.write().await = Some(ca.clone());
        Ok(ca)
    }

    /// Create-if-absent write of a device certificate PEM under its
    /// content-addressed path. A second write with the same `id` is a
    /// no-op and preserves the first content (§4.1).
    pub async fn store_device_certificate_if_absent(
        &self,
        id: &str,
        pem: &str,
    ) -> Result<(), KeystoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.certificate_id_to_path(id);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, pem)?;
        Ok(())
    }

    pub async fn load_device_certificate(&self, id: &str) -> Result<String, KeystoreError> {
        let path = self.certificate_id_to_path(id);
        std::fs::read_to_string(&path).map_err(|_| KeystoreError::NotFound(id.to_string()))
    }

    /// `<first-2-hex-chars>/<id>.pem`, always rooted under the configured
    /// certificate directory (§4.1, §6).
    pub fn certificate_id_to_path(&self, id: &str) -> PathBuf {
        let prefix_len = id.len().min(2);
        self.cert_dir.join(&id[..prefix_len]).join(format!("{id}.pem"))
    }

    /// Exactly 16 printable-ASCII characters, each in `[0x20, 0x7E]`
    /// (§4.1).
    pub fn generate_random_passphrase(&self) -> String {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes).expect("system RNG must not fail");
        bytes.iter().map(|b| byte_to_ascii_char(*b) as char).collect()
    }

    pub fn new_rsa_key_pair(&self) -> Result<rcgen::KeyPair, crate::error::CaError> {
        ca::new_rsa_key_pair()
    }

    pub fn new_ec_key_pair(&self) -> Result<rcgen::KeyPair, crate::error::CaError> {
        ca::new_ec_key_pair()
    }
}

/// Maps every signed 8-bit input into `[0x20, 0x7E]` (95 printable ASCII
/// characters), so every CSPRNG byte yields a valid passphrase character
/// without discarding entropy (§4.1).
pub fn byte_to_ascii_char(b: u8) -> u8 {
    0x20 + (b % 95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> CertificateStore {
        CertificateStore::new(dir.join("ca.keystore"), dir.join("certs"))
    }

    #[tokio::test]
    async fn init_then_current_ca_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.init("a passphrase of 16+ chars").await.unwrap();
        let ca = store.current_ca().await.unwrap();
        assert!(ca.certificate_pem.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn device_certificate_store_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .store_device_certificate_if_absent("abcd1234", "FIRST")
            .await
            .unwrap();
        store
            .store_device_certificate_if_absent("abcd1234", "SECOND")
            .await
            .unwrap();
        let loaded = store.load_device_certificate("abcd1234").await.unwrap();
        assert_eq!(loaded, "FIRST");
    }

    #[tokio::test]
    async fn missing_device_certificate_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load_device_certificate("deadbeef").await.is_err());
    }

    #[test]
    fn passphrase_is_sixteen_printable_ascii_chars() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let pass = store.generate_random_passphrase();
        assert_eq!(pass.chars().count(), 16);
        assert!(pass.bytes().all(|b| (0x20..=0x7E).contains(&b)));
    }

    #[test]
    fn certificate_id_to_path_is_rooted_and_content_addressed() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.certificate_id_to_path("abcd1234");
        assert!(path.starts_with(dir.path().join("certs")));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "abcd1234.pem");
    }
}
