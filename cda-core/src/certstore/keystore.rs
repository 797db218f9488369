//! Passphrase-encrypted, at-rest persistence of the CA key pair (§4.1,
//! §6: "CA keystore file").
//!
//! Grounded on `security.rs`'s use of `ring::{aead, rand}` for the
//! teacher's in-memory store, extended with an Argon2 passphrase KDF and
//! `zeroize` for sensitive buffers -- the pairing `TheCowboyAI-cim-keys`
//! uses for exactly this purpose.

use crate::ca::{self, CaKeyPair, KeyAlgorithm};
use crate::error::KeystoreError;
use argon2::Argon2;
use ring::aead::{Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroize;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct StoredCa {
    algorithm: KeyAlgorithm,
    certificate_pem: String,
    private_key_pem: String,
}

struct FixedNonce([u8; NONCE_LEN]);

impl NonceSequence for FixedNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        Nonce::try_assume_unique_for_key(&self.0)
    }
}

fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN]) -> Result<[u8; 32], KeystoreError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| KeystoreError::Crypto(e.to_string()))?;
    Ok(key)
}

fn encrypt(passphrase: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| KeystoreError::Crypto("rng failure".into()))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| KeystoreError::Crypto("rng failure".into()))?;

    let mut key_bytes = derive_key(passphrase, &salt)?;
    let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
        .map_err(|_| KeystoreError::Crypto("key construction failed".into()))?;
    key_bytes.zeroize();
    let mut sealing = SealingKey::new(unbound, FixedNonce(nonce_bytes));

    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| KeystoreError::Crypto("encryption failed".into()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + in_out.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

fn decrypt(passphrase: &str, blob: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    if blob.len() < SALT_LEN + NONCE_LEN {
        return Err(KeystoreError::Crypto("keystore file truncated".into()));
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
    let salt: [u8; SALT_LEN] = salt.try_into().unwrap();
    let nonce_bytes: [u8; NONCE_LEN] = nonce_bytes.try_into().unwrap();

    let mut key_bytes = derive_key(passphrase, &salt)?;
    let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
        .map_err(|_| KeystoreError::Crypto("key construction failed".into()))?;
    key_bytes.zeroize();
    let mut opening = OpeningKey::new(unbound, FixedNonce(nonce_bytes));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| KeystoreError::Crypto("wrong passphrase or corrupted keystore".into()))?;
    Ok(plaintext.to_vec())
}

/// Open the keystore at `path`. If the file exists and `passphrase`
/// decrypts it, the stored CA is returned. If the file exists but the
/// passphrase does not decrypt it, or the file is absent, a fresh
/// `default_algorithm` CA is generated and persisted under `passphrase`,
/// replacing whatever was there (§4.1: "wrong passphrase -> fresh
/// keystore is created").
pub fn open_or_create(
    path: &Path,
    passphrase: &str,
    default_algorithm: KeyAlgorithm,
) -> Result<CaKeyPair, KeystoreError> {
    if path.exists() {
        let blob = std::fs::read(path)?;
        if let Ok(mut plaintext) = decrypt(passphrase, &blob) {
            let stored: StoredCa = serde_json::from_slice(&plaintext)
                .map_err(|e| KeystoreError::Crypto(e.to_string()))?;
            plaintext.zeroize();
            let ca = ca::load_custom_ca(
                stored.algorithm,
                &stored.certificate_pem,
                &stored.private_key_pem,
            )
            .map_err(|e| KeystoreError::Crypto(e.to_string()))?;
            tracing::info!(path = %path.display(), "opened existing CA keystore");
            return Ok(ca);
        }
        tracing::warn!(
            path = %path.display(),
            "keystore present but passphrase did not decrypt it; replacing with a fresh CA"
        );
    }

    let ca = ca::generate_self_signed_ca(default_algorithm, "cda-gateway-ca")
        .map_err(|e| KeystoreError::Crypto(e.to_string()))?;
    persist(path, passphrase, &ca)?;
    Ok(ca)
}

/// Persist `ca` to `path`, encrypted under `passphrase`, replacing any
/// existing file. Called after CA replacement (`generateCa`/
/// `configureCustomCa`, §4.3).
pub fn persist(path: &Path, passphrase: &str, ca: &CaKeyPair) -> Result<(), KeystoreError> {
    let mut stored = StoredCa {
        algorithm: ca.algorithm,
        certificate_pem: ca.certificate_pem.clone(),
        private_key_pem: ca.key_pair_pem(),
    };
    let mut plaintext = serde_json::to_vec(&stored).map_err(|e| KeystoreError::Crypto(e.to_string()))?;
    stored.private_key_pem.zeroize();
    let blob = encrypt(passphrase, &plaintext)?;
    plaintext.zeroize();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, blob)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reopening_with_same_passphrase_returns_identical_ca() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ca.keystore");

        let first = open_or_create(&path, "correct horse battery", KeyAlgorithm::EcdsaP256).unwrap();
        let first_pem = first.certificate_pem.clone();

        let second = open_or_create(&path, "correct horse battery", KeyAlgorithm::EcdsaP256).unwrap();
        assert_eq!(first_pem, second.certificate_pem);
    }

    #[test]
    fn wrong_passphrase_replaces_keystore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ca.keystore");

        let first = open_or_create(&path, "passphrase-one-xxxx", KeyAlgorithm::EcdsaP256).unwrap();
        let second = open_or_create(&path, "passphrase-two-xxxx", KeyAlgorithm::EcdsaP256).unwrap();
        assert_ne!(first.certificate_pem, second.certificate_pem);
    }
}
