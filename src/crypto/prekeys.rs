//! Device bundles and the local prekey pool.
//!
//! A [`Bundle`] is what a device publishes so that others can start a session
//! with it: identity key, one signed prekey and a pool of one-time prekeys.
//! [`LocalDevice`] holds the matching private halves for this device.

use crate::crypto::IdentityKeyPair;
use crate::device::DeviceId;
use crate::utils::{BundleError, Result};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use x25519_dalek::{PublicKey, StaticSecret};

/// Protocol floor for the number of one-time prekeys in a bundle
pub const MIN_PREKEY_COUNT: usize = 20;

/// Number of one-time prekeys a device should keep published
pub const RECOMMENDED_PREKEY_COUNT: usize = 100;

/// Maximum age of a signed prekey before rotation (30 days in seconds)
pub const SIGNED_PREKEY_MAX_AGE: u64 = 30 * 24 * 60 * 60;

/// A one-time prekey as published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    /// Prekey id, unique within the bundle
    pub id: u32,
    /// Opaque public key material
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
}

/// The signed prekey as published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Signed prekey id
    pub id: u32,
    /// Opaque public key material
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    /// Signature over `public_key` by the identity key
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Public key material of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Device this bundle belongs to
    pub device_id: DeviceId,
    /// Opaque identity public key
    #[serde(with = "serde_bytes")]
    pub identity_key: Vec<u8>,
    /// Current signed prekey
    pub signed_pre_key: SignedPreKey,
    /// One-time prekey pool
    pub pre_keys: Vec<PreKey>,
}

impl Bundle {
    /// Check the structural invariants every published or fetched bundle
    /// must satisfy
    ///
    /// # Errors
    ///
    /// The first violated invariant as a [`BundleError`]
    pub fn validate(&self, min_pre_keys: usize) -> std::result::Result<(), BundleError> {
        if self.identity_key.is_empty() {
            return Err(BundleError::MissingIdentityKey);
        }

        if self.signed_pre_key.public_key.is_empty() || self.signed_pre_key.signature.is_empty() {
            return Err(BundleError::MissingSignedPreKey);
        }

        if self.pre_keys.len() < min_pre_keys {
            return Err(BundleError::TooFewPreKeys {
                count: self.pre_keys.len(),
                min: min_pre_keys,
            });
        }

        let mut seen = HashSet::with_capacity(self.pre_keys.len());
        for pre_key in &self.pre_keys {
            if pre_key.public_key.is_empty() {
                return Err(BundleError::EmptyPreKey { id: pre_key.id });
            }
            if !seen.insert(pre_key.id) {
                return Err(BundleError::DuplicatePreKey { id: pre_key.id });
            }
        }

        Ok(())
    }

    /// Verify the signed prekey signature against the identity key
    pub fn verify_signature(&self) -> std::result::Result<(), BundleError> {
        crate::crypto::verify_signature(
            &self.identity_key,
            &self.signed_pre_key.public_key,
            &self.signed_pre_key.signature,
        )
        .map_err(|_| BundleError::BadSignature)
    }

    /// Identity key fingerprint as lowercase hex in groups of eight, the
    /// form users compare during key verification
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.identity_key)
            .as_bytes()
            .chunks(8)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Deserialize from JSON and check the protocol floor
    pub fn from_json(json: &str) -> Result<Self> {
        let bundle: Self = serde_json::from_str(json)?;
        bundle.validate(MIN_PREKEY_COUNT)?;
        Ok(bundle)
    }
}

struct SignedPreKeyPair {
    id: u32,
    secret: StaticSecret,
    public: PublicKey,
    signature: [u8; 64],
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Private key material of the local device
pub struct LocalDevice {
    device_id: DeviceId,
    identity: IdentityKeyPair,
    signed_pre_key: SignedPreKeyPair,
    /// Retired signed prekeys stay around so late key-transport messages
    /// can still be unwrapped
    previous_signed_pre_keys: BTreeMap<u32, StaticSecret>,
    pre_keys: BTreeMap<u32, StaticSecret>,
    next_pre_key_id: u32,
}

impl std::fmt::Debug for LocalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDevice")
            .field("device_id", &self.device_id)
            .field("identity", &"[REDACTED]")
            .field("signed_pre_key_id", &self.signed_pre_key.id)
            .field("pre_keys", &self.pre_keys.len())
            .finish()
    }
}

impl LocalDevice {
    /// Generate fresh key material with `pre_key_count` one-time prekeys
    ///
    /// # Errors
    ///
    /// `BundleError::TooFewPreKeys` when asked for fewer than the protocol floor
    pub fn generate(device_id: DeviceId, pre_key_count: usize) -> Result<Self> {
        if pre_key_count < MIN_PREKEY_COUNT {
            return Err(BundleError::TooFewPreKeys {
                count: pre_key_count,
                min: MIN_PREKEY_COUNT,
            }
            .into());
        }

        let identity = IdentityKeyPair::generate();
        let signed_pre_key = Self::new_signed_pre_key(1, &identity);

        let mut device = Self {
            device_id,
            identity,
            signed_pre_key,
            previous_signed_pre_keys: BTreeMap::new(),
            pre_keys: BTreeMap::new(),
            next_pre_key_id: 1,
        };
        device.replenish_pre_keys(pre_key_count);
        Ok(device)
    }

    fn new_signed_pre_key(id: u32, identity: &IdentityKeyPair) -> SignedPreKeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let signature = identity.sign(public.as_bytes());

        SignedPreKeyPair {
            id,
            secret,
            public,
            signature,
            created_at: chrono::Utc::now(),
        }
    }

    /// This device's id
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Identity key pair
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Number of unused one-time prekeys
    pub fn pre_key_count(&self) -> usize {
        self.pre_keys.len()
    }

    /// Top the one-time prekey pool up to `target`, returning how many were added
    pub fn replenish_pre_keys(&mut self, target: usize) -> usize {
        let missing = target.saturating_sub(self.pre_keys.len());
        for _ in 0..missing {
            let id = self.next_pre_key_id;
            self.next_pre_key_id = self.next_pre_key_id.wrapping_add(1).max(1);
            self.pre_keys.insert(id, StaticSecret::random_from_rng(OsRng));
        }
        missing
    }

    /// Remove a one-time prekey once a peer has used it
    pub fn consume_pre_key(&mut self, id: u32) -> Option<StaticSecret> {
        self.pre_keys.remove(&id)
    }

    /// Secret of the current or a retired signed prekey
    pub fn signed_pre_key_secret(&self, id: u32) -> Option<&StaticSecret> {
        if id == self.signed_pre_key.id {
            Some(&self.signed_pre_key.secret)
        } else {
            self.previous_signed_pre_keys.get(&id)
        }
    }

    /// Whether the signed prekey is older than [`SIGNED_PREKEY_MAX_AGE`]
    pub fn should_rotate_signed_pre_key(&self) -> bool {
        let age = chrono::Utc::now()
            .signed_duration_since(self.signed_pre_key.created_at)
            .num_seconds();
        u64::try_from(age).unwrap_or(0) > SIGNED_PREKEY_MAX_AGE
    }

    /// Replace the signed prekey, keeping the old secret for late messages
    pub fn rotate_signed_pre_key(&mut self) {
        let next_id = self.signed_pre_key.id.wrapping_add(1).max(1);
        let old = std::mem::replace(
            &mut self.signed_pre_key,
            Self::new_signed_pre_key(next_id, &self.identity),
        );
        self.previous_signed_pre_keys.insert(old.id, old.secret);
    }

    /// The publishable bundle for the current key material
    pub fn bundle(&self) -> Bundle {
        Bundle {
            device_id: self.device_id,
            identity_key: self.identity.public_key_bytes().to_vec(),
            signed_pre_key: SignedPreKey {
                id: self.signed_pre_key.id,
                public_key: self.signed_pre_key.public.as_bytes().to_vec(),
                signature: self.signed_pre_key.signature.to_vec(),
            },
            pre_keys: self
                .pre_keys
                .iter()
                .map(|(id, secret)| PreKey {
                    id: *id,
                    public_key: PublicKey::from(secret).as_bytes().to_vec(),
                })
                .collect(),
        }
    }
}
