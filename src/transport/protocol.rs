//! Encrypted message envelopes and their wire form.
//!
//! An [`Envelope`] mirrors the OMEMO `<encrypted>` element: a header with
//! the sender device, the IV and one wrapped key per recipient device, plus
//! an optional payload. An envelope without payload is a key-transport
//! message, used to set up or refresh sessions without sending content.
//!
//! On the wire the envelope is a versioned bincode structure. Keys travel as
//! a list rather than a map so that a repeated device id is detected when
//! parsing instead of silently collapsed.

use crate::device::{DeviceId, Jid};
use crate::transport::element_id_or_new;
use crate::utils::EnvelopeError;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire format version understood by this codec
pub const WIRE_VERSION: u8 = 1;

/// Length of the payload IV in bytes
pub const IV_LEN: usize = 12;

/// Maximum encoded envelope size (1MB)
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

type CodecResult<T> = std::result::Result<T, EnvelopeError>;

/// Fixed-width integers like `bincode::serialize`, but nothing may follow
/// the envelope
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// A built or parsed encrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Addressed account
    pub recipient: Jid,
    /// Device that produced the envelope
    pub sender_device_id: DeviceId,
    /// Correlation id
    pub element_id: String,
    /// Payload IV
    pub iv: [u8; IV_LEN],
    /// Wrapped key material per recipient device
    pub keys: BTreeMap<DeviceId, Vec<u8>>,
    /// Encrypted body, absent for key transport
    pub payload: Option<Vec<u8>>,
}

impl Envelope {
    /// Whether this envelope only transports keys
    pub fn is_key_transport(&self) -> bool {
        self.payload.is_none()
    }

    /// Wrapped key for `device_id`, if the envelope carries one
    pub fn key_for(&self, device_id: DeviceId) -> Option<&[u8]> {
        self.keys.get(&device_id).map(Vec::as_slice)
    }
}

#[derive(Serialize, Deserialize)]
struct WireKey {
    rid: u32,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    version: u8,
    to: String,
    id: String,
    sid: u32,
    #[serde(with = "serde_bytes")]
    iv: Option<Vec<u8>>,
    keys: Vec<WireKey>,
    #[serde(with = "serde_bytes")]
    payload: Option<Vec<u8>>,
}

/// Assemble an envelope from already wrapped keys
///
/// A missing or empty `element_id` is replaced by a fresh UUID.
///
/// # Errors
///
/// `EnvelopeError::NoKeys`, `EnvelopeError::EmptyKey` or
/// `EnvelopeError::InvalidIvLength`
pub fn build_envelope(
    payload: Option<Vec<u8>>,
    iv: &[u8],
    wrapped_keys: BTreeMap<DeviceId, Vec<u8>>,
    recipient: &Jid,
    sender_device_id: DeviceId,
    element_id: Option<String>,
) -> CodecResult<Envelope> {
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| EnvelopeError::InvalidIvLength {
        expected: IV_LEN,
        actual: iv.len(),
    })?;

    if wrapped_keys.is_empty() {
        return Err(EnvelopeError::NoKeys);
    }
    if let Some((device_id, _)) = wrapped_keys.iter().find(|(_, key)| key.is_empty()) {
        return Err(EnvelopeError::EmptyKey {
            device_id: device_id.value(),
        });
    }

    Ok(Envelope {
        recipient: recipient.clone(),
        sender_device_id,
        element_id: element_id_or_new(element_id),
        iv,
        keys: wrapped_keys,
        payload,
    })
}

/// Serialize an envelope for the transport
pub fn encode(envelope: &Envelope) -> CodecResult<Vec<u8>> {
    let wire = WireEnvelope {
        version: WIRE_VERSION,
        to: envelope.recipient.to_string(),
        id: envelope.element_id.clone(),
        sid: envelope.sender_device_id.value(),
        iv: Some(envelope.iv.to_vec()),
        keys: envelope
            .keys
            .iter()
            .map(|(rid, data)| WireKey {
                rid: rid.value(),
                data: data.clone(),
            })
            .collect(),
        payload: envelope.payload.clone(),
    };

    let bytes = wire_options().serialize(&wire)?;
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(EnvelopeError::TooLarge {
            size: bytes.len(),
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(bytes)
}

/// Parse and check an inbound envelope
///
/// # Errors
///
/// Any structural problem as an [`EnvelopeError`]; nothing is dispatched
/// for a rejected envelope
pub fn parse_envelope(raw: &[u8]) -> CodecResult<Envelope> {
    if raw.len() > MAX_ENVELOPE_SIZE {
        return Err(EnvelopeError::TooLarge {
            size: raw.len(),
            max: MAX_ENVELOPE_SIZE,
        });
    }

    // bincode writes the leading u8 as a single byte
    match raw.first() {
        None => {
            return Err(EnvelopeError::Malformed {
                reason: "empty input".to_string(),
            })
        }
        Some(&version) if version != WIRE_VERSION => {
            return Err(EnvelopeError::UnsupportedVersion { version })
        }
        Some(_) => {}
    }

    let wire: WireEnvelope = wire_options()
        .with_limit(MAX_ENVELOPE_SIZE as u64)
        .deserialize(raw)?;

    let recipient = Jid::parse(&wire.to).map_err(|e| EnvelopeError::Malformed {
        reason: e.to_string(),
    })?;
    let sender_device_id = DeviceId::new(wire.sid).map_err(|e| EnvelopeError::Malformed {
        reason: e.to_string(),
    })?;
    if wire.id.is_empty() {
        return Err(EnvelopeError::MissingElementId);
    }

    let iv_bytes = wire.iv.ok_or(EnvelopeError::MissingIv)?;
    let iv: [u8; IV_LEN] =
        iv_bytes
            .as_slice()
            .try_into()
            .map_err(|_| EnvelopeError::InvalidIvLength {
                expected: IV_LEN,
                actual: iv_bytes.len(),
            })?;

    if wire.keys.is_empty() {
        return Err(EnvelopeError::NoKeys);
    }

    let mut keys = BTreeMap::new();
    for key in wire.keys {
        if key.data.is_empty() {
            return Err(EnvelopeError::EmptyKey { device_id: key.rid });
        }
        let rid = DeviceId::new(key.rid).map_err(|e| EnvelopeError::Malformed {
            reason: e.to_string(),
        })?;
        if keys.insert(rid, key.data).is_some() {
            return Err(EnvelopeError::DuplicateKey { device_id: key.rid });
        }
    }

    Ok(Envelope {
        recipient,
        sender_device_id,
        element_id: wire.id,
        iv,
        keys,
        payload: wire.payload,
    })
}
