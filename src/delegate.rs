//! Application callbacks.
//!
//! The engine reports everything it learns from the network through an
//! [`OmemoDelegate`]. Callbacks run on the engine task, so implementations
//! should hand work off rather than block.

use crate::crypto::Bundle;
use crate::device::{DeviceId, Jid};
use crate::transport::{BundleRequest, Envelope, Stanza, IV_LEN};
use crate::utils::OmemoError;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Receiver of engine notifications
pub trait OmemoDelegate: Send + Sync {
    /// A device list was announced for `from`
    fn on_device_list_update(&self, device_ids: &[DeviceId], from: &Jid, raw: &Stanza);

    /// A bundle fetch succeeded
    fn on_bundle_received(&self, bundle: &Bundle, from: &Jid, request: &BundleRequest);

    /// An envelope was parsed; unwrapping the local key is up to the application
    fn on_payload_received(
        &self,
        payload: Option<&[u8]>,
        keys: &BTreeMap<DeviceId, Vec<u8>>,
        iv: &[u8; IV_LEN],
        raw: &Stanza,
    );

    /// A full envelope was parsed; forwards to [`Self::on_payload_received`]
    /// unless overridden
    fn on_envelope_received(&self, envelope: &Envelope, raw: &Stanza) {
        self.on_payload_received(envelope.payload.as_deref(), &envelope.keys, &envelope.iv, raw);
    }

    /// A soft failure the engine recovered from
    fn on_error(&self, _error: &OmemoError) {}
}

/// Notification forwarded by [`ChannelDelegate`]
#[derive(Debug, Clone)]
pub enum OmemoEvent {
    /// See [`OmemoDelegate::on_device_list_update`]
    DeviceListUpdate {
        from: Jid,
        device_ids: Vec<DeviceId>,
        element_id: String,
    },
    /// See [`OmemoDelegate::on_bundle_received`]
    BundleReceived {
        from: Jid,
        bundle: Bundle,
        request: BundleRequest,
    },
    /// See [`OmemoDelegate::on_payload_received`]
    PayloadReceived {
        from: Jid,
        sender_device_id: Option<DeviceId>,
        payload: Option<Vec<u8>>,
        keys: BTreeMap<DeviceId, Vec<u8>>,
        iv: [u8; IV_LEN],
        element_id: String,
    },
    /// See [`OmemoDelegate::on_error`]
    Error(OmemoError),
}

/// Delegate that turns every callback into an [`OmemoEvent`] on a channel
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<OmemoEvent>,
}

impl ChannelDelegate {
    /// Create the delegate and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OmemoEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: OmemoEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("Event receiver dropped");
        }
    }
}

impl OmemoDelegate for ChannelDelegate {
    fn on_device_list_update(&self, device_ids: &[DeviceId], from: &Jid, raw: &Stanza) {
        self.emit(OmemoEvent::DeviceListUpdate {
            from: from.clone(),
            device_ids: device_ids.to_vec(),
            element_id: raw.element_id.clone(),
        });
    }

    fn on_bundle_received(&self, bundle: &Bundle, from: &Jid, request: &BundleRequest) {
        self.emit(OmemoEvent::BundleReceived {
            from: from.clone(),
            bundle: bundle.clone(),
            request: request.clone(),
        });
    }

    fn on_payload_received(
        &self,
        payload: Option<&[u8]>,
        keys: &BTreeMap<DeviceId, Vec<u8>>,
        iv: &[u8; IV_LEN],
        raw: &Stanza,
    ) {
        self.emit(OmemoEvent::PayloadReceived {
            from: raw.from.clone(),
            sender_device_id: None,
            payload: payload.map(<[u8]>::to_vec),
            keys: keys.clone(),
            iv: *iv,
            element_id: raw.element_id.clone(),
        });
    }

    fn on_envelope_received(&self, envelope: &Envelope, raw: &Stanza) {
        self.emit(OmemoEvent::PayloadReceived {
            from: raw.from.clone(),
            sender_device_id: Some(envelope.sender_device_id),
            payload: envelope.payload.clone(),
            keys: envelope.keys.clone(),
            iv: envelope.iv,
            element_id: envelope.element_id.clone(),
        });
    }

    fn on_error(&self, error: &OmemoError) {
        self.emit(OmemoEvent::Error(error.clone()));
    }
}
