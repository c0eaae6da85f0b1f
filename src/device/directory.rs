//! Per-account device lists.
//!
//! The directory caches the most recent list announced for every account.
//! An announced list always replaces the cached one; there is no merge. The
//! only exception is the local account: a list that no longer contains our
//! own device is never cached, and the caller is told to republish it with
//! our device added back.

use crate::device::{DeviceId, Jid};
use crate::storage::Storage;
use crate::transport::element_id_or_new;
use crate::utils::{DirectoryError, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// What the engine must do after an inbound device list was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceListOutcome {
    /// The list replaced the cached one
    Stored,
    /// Our own device was missing; publish this set to restore it
    Reannounce(BTreeSet<DeviceId>),
}

/// Result of a device lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLookup {
    /// Devices known for the account, possibly empty
    pub devices: BTreeSet<DeviceId>,
    /// Nothing is known yet and a list should be requested
    pub fetch_hint: bool,
}

/// A device list publication that has been checked but not yet confirmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPublish {
    /// Devices to announce
    pub device_ids: BTreeSet<DeviceId>,
    /// Correlation id for the publish
    pub element_id: String,
}

/// Cache of device lists, keyed by bare account
pub struct DeviceDirectory {
    account: Jid,
    device_id: DeviceId,
    lists: HashMap<Jid, BTreeSet<DeviceId>>,
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for DeviceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDirectory")
            .field("account", &self.account)
            .field("device_id", &self.device_id)
            .field("lists", &self.lists.len())
            .finish()
    }
}

impl DeviceDirectory {
    /// Create a directory for the local `account` and `device_id`
    pub fn new(account: &Jid, device_id: DeviceId, storage: Arc<dyn Storage>) -> Self {
        Self {
            account: account.bare(),
            device_id,
            lists: HashMap::new(),
            storage,
        }
    }

    /// Local bare account
    pub fn account(&self) -> &Jid {
        &self.account
    }

    /// Local device id
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Check a local device list before it goes out
    ///
    /// # Errors
    ///
    /// `DirectoryError::SelfDeviceOmitted` if the local device is not listed
    pub fn publish(
        &self,
        device_ids: &[DeviceId],
        element_id: Option<String>,
    ) -> Result<PreparedPublish> {
        if !device_ids.contains(&self.device_id) {
            return Err(DirectoryError::SelfDeviceOmitted {
                device_id: self.device_id.value(),
            }
            .into());
        }

        Ok(PreparedPublish {
            device_ids: device_ids.iter().copied().collect(),
            element_id: element_id_or_new(element_id),
        })
    }

    /// Record a local list once the transport confirmed its publication
    pub fn confirm_local_publish(&mut self, device_ids: &BTreeSet<DeviceId>) {
        let account = self.account.clone();
        self.replace(&account, device_ids.clone());
    }

    /// Apply an announced device list
    pub fn on_device_list_update(
        &mut self,
        identity: &Jid,
        device_ids: &[DeviceId],
    ) -> DeviceListOutcome {
        let identity = identity.bare();
        let received: BTreeSet<DeviceId> = device_ids.iter().copied().collect();

        if identity == self.account && !received.contains(&self.device_id) {
            log::info!(
                "Own device {} missing from announced list of {}, republishing",
                self.device_id,
                identity
            );
            let mut repaired = received;
            repaired.insert(self.device_id);
            return DeviceListOutcome::Reannounce(repaired);
        }

        log::debug!("Device list for {}: {:?}", identity, received);
        self.replace(&identity, received);
        DeviceListOutcome::Stored
    }

    /// Devices known for `identity`, from cache, then storage
    pub fn known_devices(&mut self, identity: &Jid) -> DeviceLookup {
        let identity = identity.bare();

        if let Some(devices) = self.lists.get(&identity) {
            return DeviceLookup {
                devices: devices.clone(),
                fetch_hint: false,
            };
        }

        match self.storage.fetch_device_ids_for_identity(&identity) {
            Some(stored) => {
                let devices: BTreeSet<DeviceId> = stored.into_iter().collect();
                self.lists.insert(identity, devices.clone());
                DeviceLookup {
                    devices,
                    fetch_hint: false,
                }
            }
            None => DeviceLookup {
                devices: BTreeSet::new(),
                fetch_hint: true,
            },
        }
    }

    /// The local list to announce: everything known plus our own device
    pub fn local_announcement(&mut self) -> BTreeSet<DeviceId> {
        let account = self.account.clone();
        let mut devices = self.known_devices(&account).devices;
        devices.insert(self.device_id);
        devices
    }

    fn replace(&mut self, identity: &Jid, devices: BTreeSet<DeviceId>) {
        let ids: Vec<DeviceId> = devices.iter().copied().collect();
        self.storage.store_device_ids(&ids, identity);
        self.lists.insert(identity.clone(), devices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn id(value: u32) -> DeviceId {
        DeviceId::new(value).unwrap()
    }

    fn jid(value: &str) -> Jid {
        Jid::parse(value).unwrap()
    }

    fn directory() -> (DeviceDirectory, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::default());
        let directory = DeviceDirectory::new(&jid("alice@example.org/phone"), id(1), storage.clone());
        (directory, storage)
    }

    #[test]
    fn test_publish_requires_own_device() {
        let (directory, _) = directory();

        let err = directory.publish(&[id(2), id(3)], None).unwrap_err();
        assert!(err.to_string().contains("omits own device 1"));

        let prepared = directory.publish(&[id(2), id(1)], None).unwrap();
        assert!(!prepared.element_id.is_empty());
        assert_eq!(prepared.device_ids, BTreeSet::from([id(1), id(2)]));

        let prepared = directory.publish(&[id(1)], Some("pub-1".to_string())).unwrap();
        assert_eq!(prepared.element_id, "pub-1");
    }

    #[test]
    fn test_update_replaces_list() {
        let (mut directory, storage) = directory();
        let bob = jid("bob@example.org");

        directory.on_device_list_update(&bob, &[id(10), id(11)]);
        directory.on_device_list_update(&bob, &[id(12)]);

        assert_eq!(directory.known_devices(&bob).devices, BTreeSet::from([id(12)]));
        assert_eq!(storage.fetch_device_ids_for_identity(&bob), Some(vec![id(12)]));
    }

    #[test]
    fn test_empty_list_clears() {
        let (mut directory, _) = directory();
        let bob = jid("bob@example.org/desktop");

        directory.on_device_list_update(&bob, &[id(10)]);
        assert_eq!(directory.on_device_list_update(&bob, &[]), DeviceListOutcome::Stored);

        let lookup = directory.known_devices(&bob);
        assert!(lookup.devices.is_empty());
        assert!(!lookup.fetch_hint);
    }

    #[test]
    fn test_own_list_without_self_triggers_reannounce() {
        let (mut directory, storage) = directory();
        let alice = jid("alice@example.org");

        let outcome = directory.on_device_list_update(&alice, &[id(5), id(6)]);
        assert_eq!(
            outcome,
            DeviceListOutcome::Reannounce(BTreeSet::from([id(1), id(5), id(6)]))
        );
        assert_eq!(storage.fetch_device_ids_for_identity(&alice), None);

        // The echo of our republish contains us and is simply stored.
        let echo = directory.on_device_list_update(&alice, &[id(1), id(5), id(6)]);
        assert_eq!(echo, DeviceListOutcome::Stored);
        assert_eq!(
            directory.known_devices(&alice).devices,
            BTreeSet::from([id(1), id(5), id(6)])
        );
    }

    #[test]
    fn test_known_devices_falls_back_to_storage() {
        let (mut directory, storage) = directory();
        let carol = jid("carol@example.org");

        let lookup = directory.known_devices(&carol);
        assert!(lookup.devices.is_empty());
        assert!(lookup.fetch_hint);

        storage.store_device_ids(&[id(40), id(41)], &carol);
        let lookup = directory.known_devices(&carol);
        assert_eq!(lookup.devices, BTreeSet::from([id(40), id(41)]));
        assert!(!lookup.fetch_hint);
    }

    #[test]
    fn test_confirm_local_publish_and_announcement() {
        let (mut directory, storage) = directory();
        assert_eq!(directory.local_announcement(), BTreeSet::from([id(1)]));

        directory.confirm_local_publish(&BTreeSet::from([id(1), id(7)]));
        assert_eq!(
            storage.fetch_device_ids_for_identity(&jid("alice@example.org")),
            Some(vec![id(1), id(7)])
        );
        assert_eq!(directory.local_announcement(), BTreeSet::from([id(1), id(7)]));
    }
}
