//! Message payload encryption.
//!
//! Each message body is sealed with a fresh AES-128-GCM key and IV. The
//! ciphertext travels without its authentication tag; the tag is appended
//! to the key, and that 32-byte key material is what gets wrapped once per
//! recipient device.

use crate::transport::IV_LEN;
use crate::utils::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use rand::RngCore;

/// AES-128 key length
pub const PAYLOAD_KEY_LEN: usize = 16;

/// GCM authentication tag length
pub const AUTH_TAG_LEN: usize = 16;

/// Length of the key material wrapped for each device
pub const KEY_MATERIAL_LEN: usize = PAYLOAD_KEY_LEN + AUTH_TAG_LEN;

/// A sealed message body and what a recipient needs to open it
#[derive(Debug, Clone)]
pub struct SealedPayload {
    /// Ciphertext without tag
    pub ciphertext: Vec<u8>,
    /// `key ‖ tag`, to be wrapped per device
    pub key_material: Vec<u8>,
    /// IV used for this payload
    pub iv: [u8; IV_LEN],
}

/// Encrypt `plaintext` under a fresh key and IV
pub fn seal(plaintext: &[u8]) -> Result<SealedPayload> {
    let mut key = [0u8; PAYLOAD_KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes128Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey {
        reason: "payload key length".to_string(),
    })?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encryption {
            reason: "payload encryption failed".to_string(),
        })?;

    let tag = sealed.split_off(sealed.len() - AUTH_TAG_LEN);
    let mut key_material = key.to_vec();
    key_material.extend_from_slice(&tag);

    Ok(SealedPayload {
        ciphertext: sealed,
        key_material,
        iv,
    })
}

/// Generate key material for a key-transport message, which carries no payload
pub fn fresh_key_material() -> (Vec<u8>, [u8; IV_LEN]) {
    let mut key_material = vec![0u8; KEY_MATERIAL_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut key_material);
    rand::thread_rng().fill_bytes(&mut iv);
    (key_material, iv)
}

/// Decrypt a payload with unwrapped `key ‖ tag` material
///
/// # Errors
///
/// `CryptoError::InvalidKey` for malformed inputs, `CryptoError::Decryption`
/// when authentication fails
pub fn open(key_material: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if key_material.len() != KEY_MATERIAL_LEN {
        return Err(CryptoError::InvalidKey {
            reason: format!(
                "key material must be {} bytes, got {}",
                KEY_MATERIAL_LEN,
                key_material.len()
            ),
        }
        .into());
    }
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidKey {
            reason: format!("iv must be {} bytes, got {}", IV_LEN, iv.len()),
        }
        .into());
    }

    let (key, tag) = key_material.split_at(PAYLOAD_KEY_LEN);
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey {
        reason: "payload key length".to_string(),
    })?;

    let mut sealed = ciphertext.to_vec();
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(iv), sealed.as_slice())
        .map_err(|_| {
            CryptoError::Decryption {
                reason: "payload authentication failed".to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let sealed = seal(b"Hello, Bob!").unwrap();

        assert_eq!(sealed.key_material.len(), KEY_MATERIAL_LEN);
        assert_eq!(sealed.ciphertext.len(), b"Hello, Bob!".len());

        let plaintext = open(&sealed.key_material, &sealed.iv, &sealed.ciphertext).unwrap();
        assert_eq!(plaintext, b"Hello, Bob!");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut sealed = seal(b"Hello, Bob!").unwrap();
        sealed.ciphertext[0] ^= 1;

        let result = open(&sealed.key_material, &sealed.iv, &sealed.ciphertext);
        assert!(result.unwrap_err().is_security_violation());
    }

    #[test]
    fn test_bad_lengths_rejected() {
        let sealed = seal(b"x").unwrap();
        assert!(open(&sealed.key_material[..16], &sealed.iv, &sealed.ciphertext).is_err());
        assert!(open(&sealed.key_material, &sealed.iv[..8], &sealed.ciphertext).is_err());
    }

    #[test]
    fn test_fresh_key_material() {
        let (first, _) = fresh_key_material();
        let (second, _) = fresh_key_material();
        assert_eq!(first.len(), KEY_MATERIAL_LEN);
        assert_ne!(first, second);
    }
}
