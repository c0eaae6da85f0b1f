//! Session availability for outgoing messages.
//!
//! For a send to `recipient` the gateway targets every known device of the
//! recipient plus every other device of our own account. Devices with a
//! valid session are wrapped for immediately. For the rest a bundle fetch is
//! started, but never more than one per device: later requesters attach to
//! the fetch already in flight and are resolved together with it.

use crate::crypto::Bundle;
use crate::device::{DeviceId, Jid};
use crate::session::SessionBackend;
use crate::storage::Storage;
use crate::transport::BundleRequest;
use crate::utils::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::oneshot;

/// A remote device addressed by account and id
pub type DeviceAddress = (Jid, DeviceId);

/// Someone waiting on a bundle fetch
#[derive(Debug)]
pub enum FetchWaiter {
    /// A send waiting for the session to become usable
    Session(oneshot::Sender<Result<()>>),
    /// An explicit fetch waiting for the bundle itself
    Bundle {
        request: BundleRequest,
        reply: oneshot::Sender<Result<Bundle>>,
    },
}

/// Targets of one send, split by session availability
#[derive(Debug, Default)]
pub struct Resolution {
    /// Devices with a usable session
    pub ready: Vec<DeviceAddress>,
    /// Devices waiting on a bundle fetch
    pub pending: Vec<(DeviceAddress, oneshot::Receiver<Result<()>>)>,
    /// Fetches the caller must start; each appears here exactly once
    pub to_fetch: Vec<BundleRequest>,
}

/// Wrapped keys and the devices left out
#[derive(Debug, Default)]
pub struct WrapOutcome {
    /// Device id to wrapped key
    pub keys: BTreeMap<DeviceId, Vec<u8>>,
    /// Devices that could not be wrapped for
    pub excluded: Vec<DeviceAddress>,
}

/// In-flight fetch bookkeeping
#[derive(Debug, Default)]
pub struct SessionGateway {
    in_flight: HashMap<DeviceAddress, Vec<FetchWaiter>>,
}

impl SessionGateway {
    /// Create a gateway with nothing in flight
    pub fn new() -> Self {
        Self::default()
    }

    /// All devices a send to `recipient` must cover
    ///
    /// Our own device is never a target; everything else of our own account is.
    pub fn targets(
        recipient: &Jid,
        recipient_devices: &BTreeSet<DeviceId>,
        account: &Jid,
        own_devices: &BTreeSet<DeviceId>,
        own_device: DeviceId,
    ) -> BTreeSet<DeviceAddress> {
        let recipient = recipient.bare();
        let account = account.bare();

        let mut targets: BTreeSet<DeviceAddress> = recipient_devices
            .iter()
            .map(|device_id| (recipient.clone(), *device_id))
            .collect();
        targets.extend(
            own_devices
                .iter()
                .filter(|device_id| **device_id != own_device)
                .map(|device_id| (account.clone(), *device_id)),
        );
        targets.remove(&(account, own_device));
        targets
    }

    /// Whether a session may be reused without a fetch
    pub fn has_valid_session(
        storage: &dyn Storage,
        backend: &dyn SessionBackend,
        identity: &Jid,
        device_id: DeviceId,
    ) -> bool {
        storage.is_session_valid(identity, device_id) && backend.is_session_valid(identity, device_id)
    }

    /// Split targets into ready devices and devices that need a fetch
    pub fn resolve(
        &mut self,
        targets: BTreeSet<DeviceAddress>,
        storage: &dyn Storage,
        backend: &dyn SessionBackend,
    ) -> Resolution {
        let mut resolution = Resolution::default();

        for (identity, device_id) in targets {
            if Self::has_valid_session(storage, backend, &identity, device_id) {
                resolution.ready.push((identity, device_id));
                continue;
            }

            let (tx, rx) = oneshot::channel();
            if self.attach(&identity, device_id, FetchWaiter::Session(tx)) {
                resolution
                    .to_fetch
                    .push(BundleRequest::new(&identity, device_id, None));
            }
            resolution.pending.push(((identity, device_id), rx));
        }

        resolution
    }

    /// Register a waiter; returns true if no fetch was in flight yet
    pub fn attach(&mut self, identity: &Jid, device_id: DeviceId, waiter: FetchWaiter) -> bool {
        let key = (identity.bare(), device_id);
        match self.in_flight.get_mut(&key) {
            Some(waiters) => {
                log::debug!("Joining in-flight fetch for {}:{}", key.0, device_id);
                waiters.push(waiter);
                false
            }
            None => {
                self.in_flight.insert(key, vec![waiter]);
                true
            }
        }
    }

    /// End a fetch and hand back everyone waiting on it
    pub fn complete(&mut self, identity: &Jid, device_id: DeviceId) -> Vec<FetchWaiter> {
        self.in_flight
            .remove(&(identity.bare(), device_id))
            .unwrap_or_default()
    }

    /// Whether a fetch for the device is in flight
    pub fn is_in_flight(&self, identity: &Jid, device_id: DeviceId) -> bool {
        self.in_flight.contains_key(&(identity.bare(), device_id))
    }

    /// Number of fetches in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of waiters across all fetches
    pub fn waiter_count(&self) -> usize {
        self.in_flight.values().map(Vec::len).sum()
    }

    /// Wrap `payload_key` for every target with a usable session
    ///
    /// A device id used by both the recipient and our own account keeps the
    /// last wrap, since the key map is indexed by device id alone.
    pub fn wrap_all(
        targets: &[DeviceAddress],
        payload_key: &[u8],
        storage: &dyn Storage,
        backend: &dyn SessionBackend,
    ) -> WrapOutcome {
        let mut outcome = WrapOutcome::default();

        for (identity, device_id) in targets {
            if !Self::has_valid_session(storage, backend, identity, *device_id) {
                log::warn!("No session with {}:{}, excluding", identity, device_id);
                outcome.excluded.push((identity.clone(), *device_id));
                continue;
            }

            match backend.wrap(payload_key, identity, *device_id) {
                Ok(wrapped) => {
                    if outcome.keys.insert(*device_id, wrapped).is_some() {
                        log::warn!("Device id {} used by more than one account", device_id);
                    }
                }
                Err(e) => {
                    log::warn!("Excluding {}:{}: {}", identity, device_id, e);
                    outcome.excluded.push((identity.clone(), *device_id));
                }
            }
        }

        outcome
    }
}
