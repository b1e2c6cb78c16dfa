//! AES-256-GCM encryption for credentials at rest
//!
//! Sealed values are `base64(nonce || ciphertext || tag)`. The associated data
//! binds a ciphertext to its (tenant, provider) row so a credential blob copied
//! to another row fails to open.

use crate::{BridgeError, Result};
use base64::{engine::general_purpose, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

const KEY_LEN: usize = 32;

/// Symmetric cipher for stored credentials
pub struct SecretCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SecretCipher {
    /// Build from raw key bytes (must be 32 bytes)
    pub fn new(key_bytes: &[u8]) -> Result<Self> {
        if key_bytes.len() != KEY_LEN {
            return Err(BridgeError::Crypto(format!(
                "Encryption key must be {} bytes, got {}",
                KEY_LEN,
                key_bytes.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|e| BridgeError::Crypto(format!("Failed to create encryption key: {}", e)))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from a base64-encoded 32-byte key
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| BridgeError::Crypto(format!("Failed to decode encryption key: {}", e)))?;
        Self::new(&bytes)
    }

    /// Build from the key stored in environment variable `var`
    pub fn from_env(var: &str) -> Result<Self> {
        let encoded = std::env::var(var).map_err(|_| {
            BridgeError::Config(format!(
                "Environment variable {} must hold a base64 32-byte key (see `bugbridge keygen`)",
                var
            ))
        })?;
        Self::from_base64_key(&encoded)
    }

    /// Generate a fresh random key, base64-encoded
    pub fn generate_key() -> Result<String> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|e| BridgeError::Crypto(format!("Failed to generate key: {}", e)))?;
        Ok(general_purpose::STANDARD.encode(key))
    }

    /// Encrypt `plaintext`, binding it to `aad`
    pub fn seal(&self, plaintext: &str, aad: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|e| BridgeError::Crypto(format!("Failed to generate nonce: {}", e)))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut data = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(aad.as_bytes()), &mut data)
            .map_err(|e| BridgeError::Crypto(format!("Failed to encrypt data: {}", e)))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(data);
        Ok(general_purpose::STANDARD.encode(combined))
    }

    /// Decrypt a value produced by [`SecretCipher::seal`] with the same `aad`
    pub fn open(&self, sealed: &str, aad: &str) -> Result<String> {
        let combined = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| BridgeError::Crypto(format!("Failed to decode base64: {}", e)))?;

        if combined.len() < NONCE_LEN {
            return Err(BridgeError::Crypto(
                "Invalid encrypted data: too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|e| BridgeError::Crypto(format!("Invalid nonce: {}", e)))?;

        let mut data = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad.as_bytes()), &mut data)
            .map_err(|e| BridgeError::Crypto(format!("Failed to decrypt data: {}", e)))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| BridgeError::Crypto(format!("Decrypted data is not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("algorithm", &"AES-256-GCM")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_base64_key(&SecretCipher::generate_key().unwrap()).unwrap()
    }

    #[test]
    fn test_seal_and_open() {
        let cipher = cipher();
        let sealed = cipher.seal("access-token-123", "t1:issue_tracker").unwrap();
        assert!(!sealed.contains("access-token-123"));
        assert_eq!(
            cipher.open(&sealed, "t1:issue_tracker").unwrap(),
            "access-token-123"
        );
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let cipher = cipher();
        let a = cipher.seal("same", "aad").unwrap();
        let b = cipher.seal("same", "aad").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let cipher = cipher();
        let sealed = cipher.seal("secret", "t1:board").unwrap();
        let err = cipher.open(&sealed, "t2:board").unwrap_err();
        assert!(matches!(err, BridgeError::Crypto(_)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher().seal("secret", "aad").unwrap();
        assert!(cipher().open(&sealed, "aad").is_err());
    }

    #[test]
    fn test_bad_key_length() {
        let err = SecretCipher::from_base64_key("c2hvcnQ=").unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let debug = format!("{:?}", cipher());
        assert!(debug.contains("AES-256-GCM"));
    }
}
