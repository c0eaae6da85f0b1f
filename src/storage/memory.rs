//! In-process storage backed by hash maps.

use crate::crypto::Bundle;
use crate::device::{DeviceId, Jid};
use crate::storage::Storage;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    account: Option<(Jid, DeviceId)>,
    device_lists: HashMap<Jid, Vec<DeviceId>>,
    own_bundle: Option<Bundle>,
    valid_sessions: HashSet<(Jid, DeviceId)>,
}

/// Storage that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    /// Create storage holding the local bundle
    pub fn new(own_bundle: Bundle) -> Self {
        Self {
            state: Mutex::new(State {
                own_bundle: Some(own_bundle),
                ..State::default()
            }),
        }
    }

    /// The account passed to [`Storage::configure`]
    pub fn configured_account(&self) -> Option<(Jid, DeviceId)> {
        self.lock().account.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another thread panicked mid-insert;
        // the maps are still structurally sound.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn configure(&self, account: &Jid, device_id: DeviceId) -> bool {
        let mut state = self.lock();
        match &state.own_bundle {
            Some(bundle) if bundle.device_id != device_id => false,
            _ => {
                state.account = Some((account.bare(), device_id));
                true
            }
        }
    }

    fn store_device_ids(&self, device_ids: &[DeviceId], identity: &Jid) {
        self.lock()
            .device_lists
            .insert(identity.bare(), device_ids.to_vec());
    }

    fn fetch_device_ids_for_identity(&self, identity: &Jid) -> Option<Vec<DeviceId>> {
        self.lock().device_lists.get(&identity.bare()).cloned()
    }

    fn fetch_my_bundle(&self) -> Option<Bundle> {
        self.lock().own_bundle.clone()
    }

    fn is_session_valid(&self, identity: &Jid, device_id: DeviceId) -> bool {
        self.lock()
            .valid_sessions
            .contains(&(identity.bare(), device_id))
    }

    fn store_session_validity(&self, identity: &Jid, device_id: DeviceId, valid: bool) {
        let key = (identity.bare(), device_id);
        let mut state = self.lock();
        if valid {
            state.valid_sessions.insert(key);
        } else {
            state.valid_sessions.remove(&key);
        }
    }
}
