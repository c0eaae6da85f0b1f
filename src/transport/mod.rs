//! Transport collaborator and the envelope wire format.
//!
//! The engine never speaks XMPP itself. It asks a [`Transport`] to publish
//! pubsub items, fetch bundles and deliver envelopes, and it receives
//! inbound traffic as [`Stanza`]s.

pub mod memory;
pub mod protocol;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::*;

use crate::crypto::Bundle;
use crate::device::{DeviceId, Jid};
use crate::utils::{FetchError, TransportError};
use async_trait::async_trait;
use uuid::Uuid;

/// OMEMO namespace
pub const NS_OMEMO: &str = "urn:xmpp:omemo:0";

/// Pubsub node carrying an account's device list
pub const DEVICE_LIST_NODE: &str = "urn:xmpp:omemo:0:devicelist";

/// Pubsub node carrying the bundle of `device_id`
pub fn bundle_node(device_id: DeviceId) -> String {
    format!("{NS_OMEMO}:bundles:{device_id}")
}

/// Use the caller's correlation id, or make a fresh one if absent or empty
pub fn element_id_or_new(element_id: Option<String>) -> String {
    match element_id {
        Some(id) if !id.is_empty() => id,
        _ => Uuid::new_v4().to_string(),
    }
}

/// A bundle fetch for one remote device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleRequest {
    /// Account owning the device
    pub identity: Jid,
    /// Device whose bundle is wanted
    pub device_id: DeviceId,
    /// Correlation id of the request
    pub element_id: String,
}

impl BundleRequest {
    /// Create a request, generating an element id when none is given
    pub fn new(identity: &Jid, device_id: DeviceId, element_id: Option<String>) -> Self {
        Self {
            identity: identity.bare(),
            device_id,
            element_id: element_id_or_new(element_id),
        }
    }
}

/// Payload of an inbound stanza
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StanzaKind {
    /// A device list notification or query result
    DeviceList { device_ids: Vec<DeviceId> },
    /// An encoded [`Envelope`]
    Encrypted { raw: Vec<u8> },
    /// Anything the engine does not handle
    Other { name: String },
}

/// Inbound traffic handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    /// Sender address
    pub from: Jid,
    /// Addressed connection
    pub to: Jid,
    /// Correlation id
    pub element_id: String,
    /// What the stanza carries
    pub kind: StanzaKind,
}

/// Network side of the engine
///
/// Every call may suspend; the engine only ever awaits these from spawned
/// tasks. `fetch_bundle` owns its timeout and reports it as
/// [`FetchError::Timeout`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish the local device list
    async fn publish_device_list(
        &self,
        account: &Jid,
        device_ids: &[DeviceId],
        element_id: &str,
    ) -> Result<(), TransportError>;

    /// Publish a bundle for one local device
    async fn publish_bundle(
        &self,
        account: &Jid,
        bundle: &Bundle,
        element_id: &str,
    ) -> Result<(), TransportError>;

    /// Fetch a remote device's bundle
    async fn fetch_bundle(&self, request: &BundleRequest) -> Result<Bundle, FetchError>;

    /// Ask for an account's device list; the answer arrives as a stanza
    async fn request_device_list(&self, identity: &Jid) -> Result<(), TransportError>;

    /// Deliver an encoded envelope
    async fn send_message(
        &self,
        to: &Jid,
        element_id: &str,
        envelope: Vec<u8>,
    ) -> Result<(), TransportError>;
}
