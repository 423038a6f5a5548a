// Payload encryption: PBKDF2-HMAC-SHA256 + ChaCha20-Poly1305
//
// Flow:
// 1. KDF: PBKDF2-HMAC-SHA256(passphrase, NETWORK_SALT, 100_000 rounds) → 256-bit key
// 2. Generate random 96-bit nonce
// 3. Encrypt: ChaCha20-Poly1305(key, nonce, plaintext)
// 4. Output: EncryptedPayload { ciphertext, iv: nonce }
//
// Recipient reverses with the same passphrase. Every node on the mesh shares
// one passphrase, so this hides payloads from outsiders only, never from
// other mesh members.

use crate::message::EncryptedPayload;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Application-wide salt. Changing this breaks compatibility with every
/// node on the mesh.
pub const NETWORK_SALT: &[u8] = b"mesh_network_salt_2025";

/// PBKDF2 iteration count
pub const KDF_ITERATIONS: u32 = 100_000;

/// Nonce length for ChaCha20-Poly1305
pub const IV_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Payload encryption failed")]
pub struct EncryptError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("Invalid IV length: {0} bytes (expected 12)")]
    InvalidIv(usize),
    #[error("Decryption failed: wrong passphrase or tampered ciphertext")]
    Authentication,
}

/// Symmetric key shared by every node that knows the network passphrase.
///
/// Deriving it is deliberately slow; callers on an async runtime should do
/// it on a blocking worker and keep the result.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NetworkKey {
    bytes: [u8; 32],
}

impl NetworkKey {
    /// Stretch the shared passphrase into the network key
    pub fn derive(passphrase: &str) -> Self {
        let mut bytes = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), NETWORK_SALT, KDF_ITERATIONS, &mut bytes);
        Self { bytes }
    }

    /// Encrypt with a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, EncryptError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.bytes));

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| EncryptError)?;

        Ok(EncryptedPayload {
            ciphertext,
            iv: iv.to_vec(),
        })
    }

    /// Decrypt and authenticate. Fails closed: no partial plaintext is ever
    /// returned.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, DecryptError> {
        if payload.iv.len() != IV_LEN {
            return Err(DecryptError::InvalidIv(payload.iv.len()));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.bytes));
        cipher
            .decrypt(Nonce::from_slice(&payload.iv), payload.ciphertext.as_slice())
            .map_err(|_| DecryptError::Authentication)
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(..)")
    }
}

/// Encrypt `plaintext` under the key derived from `passphrase`.
///
/// Stateless: derives the key on every call.
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<EncryptedPayload, EncryptError> {
    NetworkKey::derive(passphrase).encrypt(plaintext)
}

/// Decrypt `payload` under the key derived from `passphrase`.
///
/// Stateless: derives the key on every call.
pub fn decrypt(payload: &EncryptedPayload, passphrase: &str) -> Result<Vec<u8>, DecryptError> {
    NetworkKey::derive(passphrase).decrypt(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::OnceLock;

    fn key() -> &'static NetworkKey {
        static KEY: OnceLock<NetworkKey> = OnceLock::new();
        KEY.get_or_init(|| NetworkKey::derive("mesh2025"))
    }

    #[test]
    fn test_passphrase_roundtrip() {
        let payload = encrypt(b"hi", "mesh2025").unwrap();
        let plaintext = decrypt(&payload, "mesh2025").unwrap();
        assert_eq!(plaintext, b"hi");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let payload = key().encrypt(b"secret").unwrap();
        let result = decrypt(&payload, "not-the-passphrase");
        assert_eq!(result, Err(DecryptError::Authentication));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let payload = key().encrypt(b"same key").unwrap();
        let again = NetworkKey::derive("mesh2025");
        assert_eq!(again.decrypt(&payload).unwrap(), b"same key");
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let a = key().encrypt(b"repeat").unwrap();
        let b = key().encrypt(b"repeat").unwrap();

        assert_eq!(a.iv.len(), IV_LEN);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut payload = key().encrypt(b"tamper me").unwrap();
        payload.ciphertext[0] ^= 0x01;
        assert_eq!(key().decrypt(&payload), Err(DecryptError::Authentication));
    }

    #[test]
    fn test_tampered_iv_fails() {
        let mut payload = key().encrypt(b"tamper me").unwrap();
        payload.iv[5] ^= 0x80;
        assert_eq!(key().decrypt(&payload), Err(DecryptError::Authentication));
    }

    #[test]
    fn test_bad_iv_length_fails() {
        let mut payload = key().encrypt(b"short").unwrap();
        payload.iv.truncate(8);
        assert_eq!(key().decrypt(&payload), Err(DecryptError::InvalidIv(8)));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let payload = EncryptedPayload {
            ciphertext: vec![1, 2, 3],
            iv: vec![0u8; IV_LEN],
        };
        assert_eq!(key().decrypt(&payload), Err(DecryptError::Authentication));
    }

    #[test]
    fn test_debug_hides_key() {
        assert_eq!(format!("{:?}", key()), "NetworkKey(..)");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn roundtrip_any_plaintext(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let payload = key().encrypt(&plaintext).unwrap();
            prop_assert_eq!(key().decrypt(&payload).unwrap(), plaintext);
        }

        #[test]
        fn any_bit_flip_is_rejected(plaintext in proptest::collection::vec(any::<u8>(), 1..256), bit in 0usize..8) {
            let mut payload = key().encrypt(&plaintext).unwrap();
            let last = payload.ciphertext.len() - 1;
            payload.ciphertext[last] ^= 1 << bit;
            prop_assert!(key().decrypt(&payload).is_err());
        }
    }
}
