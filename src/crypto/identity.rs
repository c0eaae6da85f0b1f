//! Identity keys and Ed25519 signatures.
//!
//! The identity key is the long-term key a device publishes in its bundle.
//! Its only job inside this crate is to sign the signed prekey, so that a
//! fetcher can check the prekey really belongs to the device.

use crate::utils::{CryptoError, Result};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;

/// Ed25519 key pair for a device's long-term identity
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    ///
    /// # Example
    ///
    /// ```rust
    /// use omemo_engine::crypto::IdentityKeyPair;
    ///
    /// let keypair = IdentityKeyPair::generate();
    /// assert_eq!(keypair.public_key_bytes().len(), 32);
    /// ```
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Sign a message with this identity
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify `signature` over `message` with a raw Ed25519 public key
///
/// # Errors
///
/// `CryptoError::InvalidKey` for a malformed key,
/// `CryptoError::SignatureVerification` for a bad signature
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] =
        public_key.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: format!("identity key must be {PUBLIC_KEY_LENGTH} bytes"),
        })?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey {
            reason: "identity key is not a valid Ed25519 point".to_string(),
        })?;

    let sig_bytes: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureVerification)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(message, &sig)
        .map_err(|_| CryptoError::SignatureVerification.into())
}
