//! Session backend interface and a static reference implementation.
//!
//! The engine treats sessions as opaque: it only asks whether one exists,
//! hands over a fetched bundle to create one, and wraps payload keys for a
//! device. Anything implementing [`SessionBackend`] can be plugged in, for
//! instance a Double Ratchet library.

use crate::crypto::{Bundle, LocalDevice};
use crate::device::{DeviceId, Jid};
use crate::utils::SessionError;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use x25519_dalek::{PublicKey, StaticSecret};

type SessionResult<T> = std::result::Result<T, SessionError>;

/// Per-device session operations used by the engine
pub trait SessionBackend: Send + Sync {
    /// Whether a usable session with `(identity, device_id)` exists
    fn is_session_valid(&self, identity: &Jid, device_id: DeviceId) -> bool;

    /// Create a session from a fetched bundle
    fn establish_session(
        &self,
        identity: &Jid,
        device_id: DeviceId,
        bundle: &Bundle,
    ) -> SessionResult<()>;

    /// Encrypt payload key material for one device
    fn wrap(&self, payload_key: &[u8], identity: &Jid, device_id: DeviceId)
        -> SessionResult<Vec<u8>>;

    /// Recover payload key material addressed to the local device
    fn unwrap(
        &self,
        wrapped: &[u8],
        sender: &Jid,
        sender_device_id: DeviceId,
    ) -> SessionResult<Vec<u8>>;
}

/// Wrapped key format version
const WRAP_VERSION: u8 = 1;

/// HKDF info for the wrapping key
const WRAP_KEY_INFO: &[u8] = b"OMEMO-StaticSession-WrapKey";

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const HEADER_SIZE: usize = 1 + 4 + KEY_SIZE;

#[derive(Clone)]
struct RemoteSession {
    signed_pre_key_id: u32,
    signed_pre_key: PublicKey,
}

/// A one-step session: every wrap performs a fresh X25519 agreement with
/// the remote signed prekey and seals the key with ChaCha20-Poly1305.
///
/// There is no ratchet and no forward secrecy beyond signed prekey rotation.
pub struct StaticSessionBackend {
    local: Mutex<LocalDevice>,
    sessions: Mutex<HashMap<(Jid, DeviceId), RemoteSession>>,
}

impl std::fmt::Debug for StaticSessionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSessionBackend")
            .field("local", &"[REDACTED]")
            .field("sessions", &lock(&self.sessions).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StaticSessionBackend {
    /// Create a backend owning the local device's key material
    pub fn new(local: LocalDevice) -> Self {
        Self {
            local: Mutex::new(local),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Local device id
    pub fn device_id(&self) -> DeviceId {
        lock(&self.local).device_id()
    }

    /// Current local bundle
    pub fn bundle(&self) -> Bundle {
        lock(&self.local).bundle()
    }

    /// Run `f` with mutable access to the local key material
    pub fn with_local_device<R>(&self, f: impl FnOnce(&mut LocalDevice) -> R) -> R {
        f(&mut lock(&self.local))
    }

    /// Drop the session with a device
    pub fn forget(&self, identity: &Jid, device_id: DeviceId) -> bool {
        lock(&self.sessions)
            .remove(&(identity.bare(), device_id))
            .is_some()
    }

    /// Number of established sessions
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn derive_key(shared: &[u8]) -> SessionResult<[u8; KEY_SIZE]> {
        let hkdf = Hkdf::<Sha256>::new(None, shared);
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(WRAP_KEY_INFO, &mut key)
            .map_err(|_| SessionError::Wrap {
                reason: "wrap key derivation failed".to_string(),
            })?;
        Ok(key)
    }
}

impl SessionBackend for StaticSessionBackend {
    fn is_session_valid(&self, identity: &Jid, device_id: DeviceId) -> bool {
        lock(&self.sessions).contains_key(&(identity.bare(), device_id))
    }

    fn establish_session(
        &self,
        identity: &Jid,
        device_id: DeviceId,
        bundle: &Bundle,
    ) -> SessionResult<()> {
        let key_bytes: [u8; KEY_SIZE] = bundle
            .signed_pre_key
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::Establishment {
                reason: format!(
                    "signed prekey must be {} bytes, got {}",
                    KEY_SIZE,
                    bundle.signed_pre_key.public_key.len()
                ),
            })?;

        let session = RemoteSession {
            signed_pre_key_id: bundle.signed_pre_key.id,
            signed_pre_key: PublicKey::from(key_bytes),
        };
        lock(&self.sessions).insert((identity.bare(), device_id), session);
        log::debug!("Session established with {}:{}", identity.bare(), device_id);
        Ok(())
    }

    fn wrap(
        &self,
        payload_key: &[u8],
        identity: &Jid,
        device_id: DeviceId,
    ) -> SessionResult<Vec<u8>> {
        let session = lock(&self.sessions)
            .get(&(identity.bare(), device_id))
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                identity: identity.bare().to_string(),
                device_id: device_id.value(),
            })?;

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&session.signed_pre_key);
        let key = Self::derive_key(shared.as_bytes())?;

        let mut out = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + payload_key.len() + 16);
        out.push(WRAP_VERSION);
        out.extend_from_slice(&session.signed_pre_key_id.to_be_bytes());
        out.extend_from_slice(ephemeral_public.as_bytes());

        let cipher = ChaCha20Poly1305::new((&key).into());
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: payload_key,
                    aad: &out,
                },
            )
            .map_err(|_| SessionError::Wrap {
                reason: "key encryption failed".to_string(),
            })?;

        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unwrap(
        &self,
        wrapped: &[u8],
        sender: &Jid,
        sender_device_id: DeviceId,
    ) -> SessionResult<Vec<u8>> {
        let failed = |reason: &str| SessionError::Unwrap {
            reason: format!("from {}:{}: {}", sender.bare(), sender_device_id, reason),
        };

        if wrapped.len() < HEADER_SIZE + NONCE_SIZE {
            return Err(failed("wrapped key too short"));
        }
        if wrapped[0] != WRAP_VERSION {
            return Err(failed("unknown wrap version"));
        }

        let (header, rest) = wrapped.split_at(HEADER_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&header[1..5]);
        let signed_pre_key_id = u32::from_be_bytes(id_bytes);

        let mut ephemeral_bytes = [0u8; KEY_SIZE];
        ephemeral_bytes.copy_from_slice(&header[5..]);
        let ephemeral_public = PublicKey::from(ephemeral_bytes);

        let shared = {
            let local = lock(&self.local);
            let secret = local
                .signed_pre_key_secret(signed_pre_key_id)
                .ok_or_else(|| failed("unknown signed prekey"))?;
            secret.diffie_hellman(&ephemeral_public)
        };
        let key = Self::derive_key(shared.as_bytes()).map_err(|_| failed("key derivation"))?;

        let cipher = ChaCha20Poly1305::new((&key).into());
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| failed("authentication failed"))
    }
}
