//! In-process transport for testing and demos.
//!
//! [`MemoryNetwork`] plays the server: it keeps each account's device list
//! and bundle nodes, pushes device-list notifications to every connection
//! and routes envelopes to all connections of the addressed account, with a
//! carbon copy to the sender's other connections.

use crate::crypto::Bundle;
use crate::device::{DeviceId, Jid};
use crate::transport::{
    bundle_node, element_id_or_new, BundleRequest, Stanza, StanzaKind, Transport,
    DEVICE_LIST_NODE,
};
use crate::utils::{FetchError, TransportConfig, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Hub {
    device_lists: HashMap<Jid, Vec<DeviceId>>,
    bundles: HashMap<(Jid, DeviceId), Bundle>,
    connections: HashMap<Jid, mpsc::UnboundedSender<Stanza>>,
    fetches: usize,
}

/// Shared in-memory server
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
    fetch_timeout: Duration,
    latency: Duration,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(crate::defaults::DEFAULT_FETCH_TIMEOUT),
            Duration::ZERO,
        )
    }
}

impl MemoryNetwork {
    /// Create a network with the given fetch timeout and per-request latency
    pub fn new(fetch_timeout: Duration, latency: Duration) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            fetch_timeout,
            latency,
        }
    }

    /// Create a network from the transport configuration section
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.fetch_timeout(), config.latency())
    }

    /// Attach a connection for the full address `jid`
    pub fn connect(&self, jid: &Jid) -> (MemoryTransport, mpsc::UnboundedReceiver<Stanza>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().connections.insert(jid.clone(), tx);
        log::debug!("{} connected", jid);

        (
            MemoryTransport {
                jid: jid.clone(),
                network: self.clone(),
            },
            rx,
        )
    }

    /// Drop a connection; stanzas for it are discarded from now on
    pub fn disconnect(&self, jid: &Jid) {
        self.lock().connections.remove(jid);
    }

    /// Device list currently stored on the server for `account`
    pub fn published_devices(&self, account: &Jid) -> Option<Vec<DeviceId>> {
        self.lock().device_lists.get(&account.bare()).cloned()
    }

    /// Bundle currently stored on the server
    pub fn published_bundle(&self, account: &Jid, device_id: DeviceId) -> Option<Bundle> {
        self.lock()
            .bundles
            .get(&(account.bare(), device_id))
            .cloned()
    }

    /// Store a bundle directly, bypassing any validation
    pub fn insert_bundle(&self, account: &Jid, bundle: Bundle) {
        self.lock()
            .bundles
            .insert((account.bare(), bundle.device_id), bundle);
    }

    /// Delete a bundle node
    pub fn remove_bundle(&self, account: &Jid, device_id: DeviceId) {
        self.lock().bundles.remove(&(account.bare(), device_id));
    }

    /// Number of bundle fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn deliver(&self, targets: Vec<(Jid, mpsc::UnboundedSender<Stanza>)>, stanza: &Stanza) {
        for (to, tx) in targets {
            let stanza = Stanza {
                to: to.clone(),
                ..stanza.clone()
            };
            if tx.send(stanza).is_err() {
                log::debug!("Dropping stanza for closed connection {}", to);
            }
        }
    }
}

/// One client connection to a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    jid: Jid,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Full address of this connection
    pub fn jid(&self) -> &Jid {
        &self.jid
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish_device_list(
        &self,
        account: &Jid,
        device_ids: &[DeviceId],
        element_id: &str,
    ) -> Result<(), TransportError> {
        self.network.delay().await;

        if !account.same_account(&self.jid) {
            return Err(TransportError::PublishFailed {
                node: DEVICE_LIST_NODE.to_string(),
                reason: "forbidden".to_string(),
            });
        }

        let targets: Vec<_> = {
            let mut hub = self.network.lock();
            hub.device_lists.insert(account.bare(), device_ids.to_vec());
            hub.connections
                .iter()
                .map(|(jid, tx)| (jid.clone(), tx.clone()))
                .collect()
        };
        log::info!("{} published device list {:?}", account.bare(), device_ids);

        self.network.deliver(
            targets,
            &Stanza {
                from: account.bare(),
                to: account.bare(),
                element_id: element_id.to_string(),
                kind: StanzaKind::DeviceList {
                    device_ids: device_ids.to_vec(),
                },
            },
        );
        Ok(())
    }

    async fn publish_bundle(
        &self,
        account: &Jid,
        bundle: &Bundle,
        _element_id: &str,
    ) -> Result<(), TransportError> {
        self.network.delay().await;

        if !account.same_account(&self.jid) {
            return Err(TransportError::PublishFailed {
                node: bundle_node(bundle.device_id),
                reason: "forbidden".to_string(),
            });
        }

        self.network.insert_bundle(account, bundle.clone());
        log::info!("{} published {}", account.bare(), bundle_node(bundle.device_id));
        Ok(())
    }

    async fn fetch_bundle(&self, request: &BundleRequest) -> Result<Bundle, FetchError> {
        let lookup = async {
            self.network.delay().await;
            let mut hub = self.network.lock();
            hub.fetches += 1;
            hub.bundles
                .get(&(request.identity.bare(), request.device_id))
                .cloned()
        };

        match tokio::time::timeout(self.network.fetch_timeout, lookup).await {
            Ok(Some(bundle)) => Ok(bundle),
            Ok(None) => Err(FetchError::Failed {
                identity: request.identity.to_string(),
                device_id: request.device_id.value(),
                reason: "item-not-found".to_string(),
            }),
            Err(_) => Err(FetchError::Timeout {
                identity: request.identity.to_string(),
                device_id: request.device_id.value(),
            }),
        }
    }

    async fn request_device_list(&self, identity: &Jid) -> Result<(), TransportError> {
        self.network.delay().await;

        let (devices, own) = {
            let hub = self.network.lock();
            (
                hub.device_lists.get(&identity.bare()).cloned(),
                hub.connections.get(&self.jid).cloned(),
            )
        };

        let own = own.ok_or(TransportError::Disconnected)?;
        if let Some(device_ids) = devices {
            self.network.deliver(
                vec![(self.jid.clone(), own)],
                &Stanza {
                    from: identity.bare(),
                    to: self.jid.clone(),
                    element_id: element_id_or_new(None),
                    kind: StanzaKind::DeviceList { device_ids },
                },
            );
        }
        Ok(())
    }

    async fn send_message(
        &self,
        to: &Jid,
        element_id: &str,
        envelope: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.network.delay().await;

        let targets: Vec<_> = {
            let hub = self.network.lock();
            hub.connections
                .iter()
                .filter(|(jid, _)| **jid != self.jid)
                .filter(|(jid, _)| jid.same_account(to) || jid.same_account(&self.jid))
                .map(|(jid, tx)| (jid.clone(), tx.clone()))
                .collect()
        };

        if !targets.iter().any(|(jid, _)| jid.same_account(to)) && !to.same_account(&self.jid) {
            return Err(TransportError::DeliveryFailed {
                recipient: to.to_string(),
                reason: "recipient offline".to_string(),
            });
        }

        log::debug!("{} -> {} ({} connections)", self.jid, to, targets.len());
        self.network.deliver(
            targets,
            &Stanza {
                from: self.jid.clone(),
                to: to.clone(),
                element_id: element_id.to_string(),
                kind: StanzaKind::Encrypted { raw: envelope },
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalDevice;

    fn jid(value: &str) -> Jid {
        Jid::parse(value).unwrap()
    }

    fn id(value: u32) -> DeviceId {
        DeviceId::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_device_list_notifies_everyone() {
        let network = MemoryNetwork::default();
        let (alice, _alice_rx) = network.connect(&jid("alice@example.org/phone"));
        let (_bob, mut bob_rx) = network.connect(&jid("bob@example.org/laptop"));

        alice
            .publish_device_list(&jid("alice@example.org"), &[id(1), id(2)], "dl-1")
            .await
            .unwrap();

        let stanza = bob_rx.recv().await.unwrap();
        assert_eq!(stanza.from, jid("alice@example.org"));
        assert_eq!(stanza.to, jid("bob@example.org/laptop"));
        assert_eq!(
            stanza.kind,
            StanzaKind::DeviceList {
                device_ids: vec![id(1), id(2)]
            }
        );
        assert_eq!(
            network.published_devices(&jid("alice@example.org")),
            Some(vec![id(1), id(2)])
        );
    }

    #[tokio::test]
    async fn test_publish_for_other_account_forbidden() {
        let network = MemoryNetwork::default();
        let (alice, _rx) = network.connect(&jid("alice@example.org/phone"));

        let result = alice
            .publish_device_list(&jid("bob@example.org"), &[id(1)], "dl-1")
            .await;
        assert!(matches!(result, Err(TransportError::PublishFailed { .. })));
    }

    #[tokio::test]
    async fn test_bundle_fetch() {
        let network = MemoryNetwork::default();
        let (bob, _bob_rx) = network.connect(&jid("bob@example.org/laptop"));
        let (alice, _alice_rx) = network.connect(&jid("alice@example.org/phone"));
        let bundle = LocalDevice::generate(id(20), 20).unwrap().bundle();

        bob.publish_bundle(&jid("bob@example.org"), &bundle, "b-1")
            .await
            .unwrap();

        let request = BundleRequest::new(&jid("bob@example.org"), id(20), None);
        assert_eq!(alice.fetch_bundle(&request).await.unwrap(), bundle);

        let missing = BundleRequest::new(&jid("bob@example.org"), id(21), None);
        assert!(matches!(
            alice.fetch_bundle(&missing).await,
            Err(FetchError::Failed { .. })
        ));
        assert_eq!(network.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_bundle_fetch_timeout() {
        let network = MemoryNetwork::new(Duration::from_millis(10), Duration::from_millis(200));
        let (alice, _rx) = network.connect(&jid("alice@example.org/phone"));

        let request = BundleRequest::new(&jid("bob@example.org"), id(20), None);
        assert!(matches!(
            alice.fetch_bundle(&request).await,
            Err(FetchError::Timeout { device_id: 20, .. })
        ));
    }

    #[tokio::test]
    async fn test_messages_reach_recipient_and_carbons() {
        let network = MemoryNetwork::default();
        let (alice_phone, mut phone_rx) = network.connect(&jid("alice@example.org/phone"));
        let (_alice_laptop, mut laptop_rx) = network.connect(&jid("alice@example.org/laptop"));
        let (_bob, mut bob_rx) = network.connect(&jid("bob@example.org/desktop"));

        alice_phone
            .send_message(&jid("bob@example.org"), "m-1", vec![1, 2, 3])
            .await
            .unwrap();

        let to_bob = bob_rx.recv().await.unwrap();
        assert_eq!(to_bob.kind, StanzaKind::Encrypted { raw: vec![1, 2, 3] });
        assert_eq!(to_bob.from, jid("alice@example.org/phone"));

        let carbon = laptop_rx.recv().await.unwrap();
        assert_eq!(carbon.element_id, "m-1");
        assert!(phone_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_offline_account_fails() {
        let network = MemoryNetwork::default();
        let (alice, _rx) = network.connect(&jid("alice@example.org/phone"));

        let result = alice
            .send_message(&jid("carol@example.org"), "m-1", vec![1])
            .await;
        assert!(matches!(result, Err(TransportError::DeliveryFailed { .. })));
    }

    #[tokio::test]
    async fn test_request_device_list_answers_requester() {
        let network = MemoryNetwork::default();
        let (bob, _bob_rx) = network.connect(&jid("bob@example.org/laptop"));
        let (alice, mut alice_rx) = network.connect(&jid("alice@example.org/phone"));

        bob.publish_device_list(&jid("bob@example.org"), &[id(5)], "dl-1")
            .await
            .unwrap();
        // drain the publish notification
        alice_rx.recv().await.unwrap();

        alice.request_device_list(&jid("bob@example.org")).await.unwrap();
        let stanza = alice_rx.recv().await.unwrap();
        assert_eq!(stanza.from, jid("bob@example.org"));
        assert_eq!(stanza.kind, StanzaKind::DeviceList { device_ids: vec![id(5)] });
    }
}
