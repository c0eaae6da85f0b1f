//! The engine actor and its public handle.
//!
//! All protocol state (device lists, in-flight fetches) lives in a single
//! [`EngineActor`] task that processes commands one at a time from a bounded
//! queue. Command handlers never await: network calls run in spawned tasks
//! and their results come back through the same queue before they touch
//! any state. Callers talk to the actor through the cloneable
//! [`OmemoEngine`] handle.

use crate::bundle::BundleExchange;
use crate::crypto::{payload, Bundle, MIN_PREKEY_COUNT};
use crate::delegate::OmemoDelegate;
use crate::device::{DeviceDirectory, DeviceId, DeviceListOutcome, Jid, PreparedPublish};
use crate::session::{DeviceAddress, FetchWaiter, Resolution, SessionBackend, SessionGateway};
use crate::storage::Storage;
use crate::transport::{
    build_envelope, element_id_or_new, encode, parse_envelope, BundleRequest, Stanza, StanzaKind,
    Transport,
};
use crate::utils::{
    EngineConfig, FetchError, OmemoError, Result, SendError, SessionError, StorageError,
    TransportError,
};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Runtime settings of one engine instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Local account
    pub account: Jid,
    /// Local device id
    pub device_id: DeviceId,
    /// Minimum number of prekeys accepted in a bundle
    pub min_pre_keys: usize,
    /// Verify signed prekey signatures of fetched bundles
    pub verify_signatures: bool,
    /// Capacity of the command queue
    pub queue_capacity: usize,
}

impl EngineSettings {
    /// Settings with protocol defaults
    pub fn new(account: Jid, device_id: DeviceId) -> Self {
        Self {
            account,
            device_id,
            min_pre_keys: MIN_PREKEY_COUNT,
            verify_signatures: false,
            queue_capacity: crate::defaults::DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Derive settings from a validated configuration
    ///
    /// A configuration without a device id gets a random one.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let device_id = match config.account.device_id {
            Some(value) => DeviceId::new(value)?,
            None => DeviceId::random(),
        };

        Ok(Self {
            account: Jid::parse(&config.account.jid)?,
            device_id,
            min_pre_keys: config.bundle.min_prekey_count,
            verify_signatures: config.bundle.verify_signatures,
            queue_capacity: config.transport.queue_capacity,
        })
    }
}

/// Everything the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Persistent state
    pub storage: Arc<dyn Storage>,
    /// Session cryptography
    pub backend: Arc<dyn SessionBackend>,
    /// Network
    pub transport: Arc<dyn Transport>,
    /// Application callbacks
    pub delegate: Arc<dyn OmemoDelegate>,
}

/// Outcome of [`OmemoEngine::encrypt_and_send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Correlation id of the sent envelope
    pub element_id: String,
    /// Devices a key was wrapped for
    pub recipients: Vec<DeviceAddress>,
    /// Devices left out because no session could be established
    pub excluded: Vec<DeviceAddress>,
}

/// Snapshot of the engine's fetch bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Bundle fetches currently in flight
    pub in_flight_fetches: usize,
    /// Requesters waiting on those fetches
    pub fetch_waiters: usize,
}

/// An operation whose correlation id is known before it completes
#[derive(Debug)]
pub struct PendingOperation<T> {
    element_id: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingOperation<T> {
    /// Correlation id of the operation
    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    /// Wait for the transport to confirm
    pub async fn wait(self) -> Result<T> {
        self.rx.await.map_err(|_| OmemoError::EngineStopped)?
    }
}

struct WrapRequest {
    recipient: Jid,
    targets: Vec<DeviceAddress>,
    excluded: Vec<DeviceAddress>,
    payload: Option<Vec<u8>>,
    payload_key: Vec<u8>,
    iv: Vec<u8>,
    element_id: String,
}

enum Command {
    PublishDeviceIds {
        device_ids: Vec<DeviceId>,
        element_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DeviceListPublished {
        prepared: PreparedPublish,
        result: std::result::Result<(), TransportError>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    PublishBundle {
        bundle: Bundle,
        element_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Announce {
        reply: oneshot::Sender<Result<()>>,
    },
    FetchBundle {
        request: BundleRequest,
        reply: oneshot::Sender<Result<Bundle>>,
    },
    BundleFetched {
        request: BundleRequest,
        result: std::result::Result<Bundle, FetchError>,
    },
    SendEnvelope {
        recipient: Jid,
        payload: Option<Vec<u8>>,
        keys: BTreeMap<DeviceId, Vec<u8>>,
        iv: Vec<u8>,
        element_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Resolve {
        recipient: Jid,
        reply: oneshot::Sender<Resolution>,
    },
    WrapAndSend {
        request: WrapRequest,
        reply: oneshot::Sender<Result<SendReport>>,
    },
    KnownDevices {
        identity: Jid,
        reply: oneshot::Sender<BTreeSet<DeviceId>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Inbound {
        stanza: Stanza,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct EngineActor {
    account: Jid,
    device_id: DeviceId,
    inbox: mpsc::Receiver<Command>,
    // Weak so that dropping every handle stops the actor.
    outbox: mpsc::WeakSender<Command>,
    directory: DeviceDirectory,
    exchange: BundleExchange,
    gateway: SessionGateway,
    storage: Arc<dyn Storage>,
    backend: Arc<dyn SessionBackend>,
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn OmemoDelegate>,
}

impl EngineActor {
    async fn run(mut self) {
        log::debug!("Engine for {}:{} running", self.account, self.device_id);

        while let Some(command) = self.inbox.recv().await {
            match command {
                Command::Shutdown { reply } => {
                    reply.send(()).ok();
                    break;
                }
                command => self.on_command(command),
            }
        }

        log::info!("Engine for {}:{} stopped", self.account, self.device_id);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::PublishDeviceIds {
                device_ids,
                element_id,
                reply,
            } => match self.directory.publish(&device_ids, Some(element_id)) {
                Ok(prepared) => self.spawn_device_list_publish(prepared, Some(reply)),
                Err(e) => {
                    reply.send(Err(e)).ok();
                }
            },
            Command::DeviceListPublished {
                prepared,
                result,
                reply,
            } => self.on_device_list_published(prepared, result, reply),
            Command::PublishBundle {
                bundle,
                element_id,
                reply,
            } => self.on_publish_bundle(bundle, element_id, reply),
            Command::Announce { reply } => self.on_announce(reply),
            Command::FetchBundle { request, reply } => {
                let identity = request.identity.clone();
                let device_id = request.device_id;
                let waiter = FetchWaiter::Bundle {
                    request: request.clone(),
                    reply,
                };
                if self.gateway.attach(&identity, device_id, waiter) {
                    self.spawn_fetch(request);
                }
            }
            Command::BundleFetched { request, result } => self.on_bundle_fetched(request, result),
            Command::SendEnvelope {
                recipient,
                payload,
                keys,
                iv,
                element_id,
                reply,
            } => {
                let encoded = build_envelope(
                    payload,
                    &iv,
                    keys,
                    &recipient,
                    self.device_id,
                    Some(element_id),
                )
                .and_then(|envelope| encode(&envelope).map(|raw| (envelope.element_id, raw)));

                match encoded {
                    Ok((element_id, raw)) => self.spawn_send(recipient, element_id, raw, reply, ()),
                    Err(e) => {
                        reply.send(Err(e.into())).ok();
                    }
                }
            }
            Command::Resolve { recipient, reply } => {
                let resolution = self.resolve(&recipient);
                reply.send(resolution).ok();
            }
            Command::WrapAndSend { request, reply } => self.on_wrap_and_send(request, reply),
            Command::KnownDevices { identity, reply } => {
                reply.send(self.lookup(&identity)).ok();
            }
            Command::Stats { reply } => {
                reply
                    .send(EngineStats {
                        in_flight_fetches: self.gateway.in_flight_count(),
                        fetch_waiters: self.gateway.waiter_count(),
                    })
                    .ok();
            }
            Command::Inbound { stanza } => self.on_stanza(stanza),
            Command::Shutdown { reply } => {
                reply.send(()).ok();
            }
        }
    }

    fn on_device_list_published(
        &mut self,
        prepared: PreparedPublish,
        result: std::result::Result<(), TransportError>,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let outcome = match result {
            Ok(()) => {
                log::info!(
                    "Published device list {:?} ({})",
                    prepared.device_ids,
                    prepared.element_id
                );
                self.directory.confirm_local_publish(&prepared.device_ids);
                Ok(())
            }
            Err(e) => {
                let error = OmemoError::from(e);
                log::warn!("Device list publish {} failed: {}", prepared.element_id, error);
                self.delegate.on_error(&error);
                Err(error)
            }
        };

        if let Some(reply) = reply {
            reply.send(outcome).ok();
        }
    }

    fn on_publish_bundle(
        &mut self,
        bundle: Bundle,
        element_id: String,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if let Err(e) = self.exchange.validate(&bundle) {
            log::warn!("Refusing to publish bundle {}: {}", element_id, e);
            reply.send(Err(e.into())).ok();
            return;
        }

        let transport = self.transport.clone();
        let exchange = self.exchange;
        let account = self.account.clone();
        self.spawn(async move {
            let result = exchange
                .publish(transport.as_ref(), &account, &bundle, &element_id)
                .await;
            reply.send(result).ok();
            None
        });
    }

    fn on_announce(&mut self, reply: oneshot::Sender<Result<()>>) {
        let bundle = match self.exchange.my_bundle(self.storage.as_ref()) {
            Ok(bundle) => bundle,
            Err(e) => {
                reply.send(Err(e)).ok();
                return;
            }
        };

        let prepared = PreparedPublish {
            device_ids: self.directory.local_announcement(),
            element_id: element_id_or_new(None),
        };
        let (list_tx, list_rx) = oneshot::channel();
        self.spawn_device_list_publish(prepared, Some(list_tx));

        let transport = self.transport.clone();
        let exchange = self.exchange;
        let account = self.account.clone();
        self.spawn(async move {
            let result = announce_bundle(list_rx, exchange, transport, account, bundle).await;
            reply.send(result).ok();
            None
        });
    }

    fn on_bundle_fetched(
        &mut self,
        request: BundleRequest,
        result: std::result::Result<Bundle, FetchError>,
    ) {
        let identity = request.identity.clone();
        let device_id = request.device_id;
        let waiters = self.gateway.complete(&identity, device_id);

        match result {
            Ok(bundle) => {
                let session = self
                    .backend
                    .establish_session(&identity, device_id, &bundle)
                    .map_err(OmemoError::from);

                match &session {
                    Ok(()) => {
                        self.storage
                            .store_session_validity(&identity, device_id, true);
                        log::debug!("Session ready for {}:{}", identity, device_id);
                    }
                    Err(e) => {
                        log::warn!("Could not set up session with {}:{}: {}", identity, device_id, e);
                        self.delegate.on_error(e);
                    }
                }
                self.delegate.on_bundle_received(&bundle, &identity, &request);

                for waiter in waiters {
                    match waiter {
                        FetchWaiter::Session(tx) => {
                            tx.send(session.clone()).ok();
                        }
                        FetchWaiter::Bundle {
                            request: attached,
                            reply,
                        } => {
                            // Requests that joined the fetch are reported
                            // under their own element id.
                            if attached.element_id != request.element_id {
                                self.delegate
                                    .on_bundle_received(&bundle, &identity, &attached);
                            }
                            reply.send(Ok(bundle.clone())).ok();
                        }
                    }
                }
            }
            Err(e) => {
                let error = OmemoError::from(e);
                log::warn!("Dropping {}:{}: {}", identity, device_id, error);
                self.delegate.on_error(&error);

                for waiter in waiters {
                    match waiter {
                        FetchWaiter::Session(tx) => {
                            tx.send(Err(error.clone())).ok();
                        }
                        FetchWaiter::Bundle { reply, .. } => {
                            reply.send(Err(error.clone())).ok();
                        }
                    }
                }
            }
        }
    }

    fn resolve(&mut self, recipient: &Jid) -> Resolution {
        let recipient = recipient.bare();
        let account = self.account.clone();

        let theirs = self.lookup(&recipient);
        let ours = self.lookup(&account);
        let targets = SessionGateway::targets(&recipient, &theirs, &account, &ours, self.device_id);

        let mut resolution =
            self.gateway
                .resolve(targets, self.storage.as_ref(), self.backend.as_ref());
        for request in std::mem::take(&mut resolution.to_fetch) {
            self.spawn_fetch(request);
        }
        resolution
    }

    fn on_wrap_and_send(&mut self, request: WrapRequest, reply: oneshot::Sender<Result<SendReport>>) {
        let outcome = SessionGateway::wrap_all(
            &request.targets,
            &request.payload_key,
            self.storage.as_ref(),
            self.backend.as_ref(),
        );

        if outcome.keys.is_empty() {
            log::warn!(
                "No valid recipient devices for {} ({})",
                request.recipient,
                request.element_id
            );
            reply
                .send(Err(SendError::NoValidRecipients {
                    recipient: request.recipient.to_string(),
                }
                .into()))
                .ok();
            return;
        }

        let recipients: Vec<DeviceAddress> = request
            .targets
            .into_iter()
            .filter(|target| !outcome.excluded.contains(target))
            .collect();
        let mut excluded = request.excluded;
        excluded.extend(outcome.excluded);

        let encoded = build_envelope(
            request.payload,
            &request.iv,
            outcome.keys,
            &request.recipient,
            self.device_id,
            Some(request.element_id),
        )
        .and_then(|envelope| encode(&envelope).map(|raw| (envelope.element_id, raw)));

        match encoded {
            Ok((element_id, raw)) => {
                let report = SendReport {
                    element_id: element_id.clone(),
                    recipients,
                    excluded,
                };
                self.spawn_send(request.recipient, element_id, raw, reply, report);
            }
            Err(e) => {
                reply.send(Err(e.into())).ok();
            }
        }
    }

    fn on_stanza(&mut self, stanza: Stanza) {
        match &stanza.kind {
            StanzaKind::DeviceList { device_ids } => {
                let from = stanza.from.bare();
                let outcome = self.directory.on_device_list_update(&from, device_ids);
                self.delegate.on_device_list_update(device_ids, &from, &stanza);

                if let DeviceListOutcome::Reannounce(device_ids) = outcome {
                    let prepared = PreparedPublish {
                        device_ids,
                        element_id: element_id_or_new(None),
                    };
                    self.spawn_device_list_publish(prepared, None);
                }
            }
            StanzaKind::Encrypted { raw } => match parse_envelope(raw) {
                Ok(envelope) => {
                    log::debug!(
                        "Envelope {} from {} ({} keys)",
                        envelope.element_id,
                        stanza.from,
                        envelope.keys.len()
                    );
                    self.delegate.on_envelope_received(&envelope, &stanza);
                }
                Err(e) => {
                    log::warn!("Dropping envelope from {}: {}", stanza.from, e);
                    self.delegate.on_error(&e.into());
                }
            },
            StanzaKind::Other { name } => {
                log::trace!("Ignoring {} from {}", name, stanza.from);
            }
        }
    }

    /// Known devices, asking the network when nothing is known yet
    fn lookup(&mut self, identity: &Jid) -> BTreeSet<DeviceId> {
        let lookup = self.directory.known_devices(identity);
        if lookup.fetch_hint {
            let transport = self.transport.clone();
            let identity = identity.bare();
            self.spawn(async move {
                if let Err(e) = transport.request_device_list(&identity).await {
                    log::warn!("Device list request for {} failed: {}", identity, e);
                }
                None
            });
        }
        lookup.devices
    }

    fn spawn_device_list_publish(
        &self,
        prepared: PreparedPublish,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let transport = self.transport.clone();
        let account = self.account.clone();
        self.spawn(async move {
            let device_ids: Vec<DeviceId> = prepared.device_ids.iter().copied().collect();
            let result = transport
                .publish_device_list(&account, &device_ids, &prepared.element_id)
                .await;
            Some(Command::DeviceListPublished {
                prepared,
                result,
                reply,
            })
        });
    }

    fn spawn_fetch(&self, request: BundleRequest) {
        log::debug!(
            "Fetching bundle {}:{} ({})",
            request.identity,
            request.device_id,
            request.element_id
        );

        let transport = self.transport.clone();
        let exchange = self.exchange;
        self.spawn(async move {
            let result = exchange.fetch(transport.as_ref(), &request).await;
            Some(Command::BundleFetched { request, result })
        });
    }

    fn spawn_send<T: Send + 'static>(
        &self,
        to: Jid,
        element_id: String,
        raw: Vec<u8>,
        reply: oneshot::Sender<Result<T>>,
        on_success: T,
    ) {
        let transport = self.transport.clone();
        self.spawn(async move {
            let result = transport
                .send_message(&to, &element_id, raw)
                .await
                .map(|()| on_success)
                .map_err(OmemoError::from);
            if let Err(e) = &result {
                log::warn!("Sending {} to {} failed: {}", element_id, to, e);
            }
            reply.send(result).ok();
            None
        });
    }

    /// Run network work off the queue; a returned command is fed back in
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Option<Command>> + Send + 'static,
    {
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            let Some(command) = task.await else {
                return;
            };
            match outbox.upgrade() {
                Some(tx) => {
                    if tx.send(command).await.is_err() {
                        log::debug!("Engine stopped before a result was delivered");
                    }
                }
                None => log::debug!("Engine gone, discarding result"),
            }
        });
    }
}

async fn announce_bundle(
    list_published: oneshot::Receiver<Result<()>>,
    exchange: BundleExchange,
    transport: Arc<dyn Transport>,
    account: Jid,
    bundle: Bundle,
) -> Result<()> {
    list_published
        .await
        .map_err(|_| OmemoError::EngineStopped)??;
    exchange
        .publish(transport.as_ref(), &account, &bundle, &element_id_or_new(None))
        .await
}

/// Handle to a running engine
///
/// Cloning is cheap; every clone talks to the same actor.
#[derive(Debug, Clone)]
pub struct OmemoEngine {
    tx: mpsc::Sender<Command>,
    account: Jid,
    device_id: DeviceId,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::PublishDeviceIds { .. } => "PublishDeviceIds",
            Command::DeviceListPublished { .. } => "DeviceListPublished",
            Command::PublishBundle { .. } => "PublishBundle",
            Command::Announce { .. } => "Announce",
            Command::FetchBundle { .. } => "FetchBundle",
            Command::BundleFetched { .. } => "BundleFetched",
            Command::SendEnvelope { .. } => "SendEnvelope",
            Command::Resolve { .. } => "Resolve",
            Command::WrapAndSend { .. } => "WrapAndSend",
            Command::KnownDevices { .. } => "KnownDevices",
            Command::Stats { .. } => "Stats",
            Command::Inbound { .. } => "Inbound",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl OmemoEngine {
    /// Configure storage and spawn the engine task
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `StorageError::ConfigureRejected` if storage refuses the account
    pub fn start(settings: EngineSettings, collaborators: Collaborators) -> Result<Self> {
        let account = settings.account.bare();
        let device_id = settings.device_id;

        if !collaborators.storage.configure(&account, device_id) {
            return Err(StorageError::ConfigureRejected {
                account: account.to_string(),
            }
            .into());
        }

        let (tx, inbox) = mpsc::channel(settings.queue_capacity.max(1));
        let actor = EngineActor {
            account: account.clone(),
            device_id,
            inbox,
            outbox: tx.downgrade(),
            directory: DeviceDirectory::new(&account, device_id, collaborators.storage.clone()),
            exchange: BundleExchange::new(settings.min_pre_keys, settings.verify_signatures),
            gateway: SessionGateway::new(),
            storage: collaborators.storage,
            backend: collaborators.backend,
            transport: collaborators.transport,
            delegate: collaborators.delegate,
        };
        tokio::spawn(actor.run());

        log::info!("Started engine for {} as device {}", account, device_id);
        Ok(Self {
            tx,
            account,
            device_id,
        })
    }

    /// Local bare account
    pub fn account(&self) -> &Jid {
        &self.account
    }

    /// Local device id
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Publish the local device list; it must contain the local device
    pub async fn publish_device_ids(
        &self,
        device_ids: Vec<DeviceId>,
        element_id: Option<String>,
    ) -> PendingOperation<()> {
        let element_id = element_id_or_new(element_id);
        let id = element_id.clone();
        self.pending(element_id, |reply| Command::PublishDeviceIds {
            device_ids,
            element_id: id,
            reply,
        })
        .await
    }

    /// Validate and publish a bundle
    pub async fn publish_bundle(
        &self,
        bundle: Bundle,
        element_id: Option<String>,
    ) -> PendingOperation<()> {
        let element_id = element_id_or_new(element_id);
        let id = element_id.clone();
        self.pending(element_id, |reply| Command::PublishBundle {
            bundle,
            element_id: id,
            reply,
        })
        .await
    }

    /// Fetch a device's bundle, joining a fetch already in flight
    pub async fn fetch_bundle_for_device(
        &self,
        identity: &Jid,
        device_id: DeviceId,
        element_id: Option<String>,
    ) -> PendingOperation<Bundle> {
        let request = BundleRequest::new(identity, device_id, element_id);
        self.pending(request.element_id.clone(), |reply| Command::FetchBundle {
            request,
            reply,
        })
        .await
    }

    /// Send an envelope built from already wrapped keys
    pub async fn send_payload(
        &self,
        payload: Option<Vec<u8>>,
        recipient: &Jid,
        wrapped_keys: BTreeMap<DeviceId, Vec<u8>>,
        iv: Vec<u8>,
        element_id: Option<String>,
    ) -> PendingOperation<()> {
        let element_id = element_id_or_new(element_id);
        let id = element_id.clone();
        let recipient = recipient.bare();
        self.pending(element_id, |reply| Command::SendEnvelope {
            recipient,
            payload,
            keys: wrapped_keys,
            iv,
            element_id: id,
            reply,
        })
        .await
    }

    /// Send a key-transport envelope, which carries keys but no payload
    pub async fn send_key_transport(
        &self,
        recipient: &Jid,
        wrapped_keys: BTreeMap<DeviceId, Vec<u8>>,
        iv: Vec<u8>,
        element_id: Option<String>,
    ) -> PendingOperation<()> {
        self.send_payload(None, recipient, wrapped_keys, iv, element_id)
            .await
    }

    /// Send a key-transport envelope with fresh key material to every device
    /// of `recipient` and every other device of our own account
    ///
    /// Used to set up or refresh sessions without sending content.
    pub async fn send_key_transport_fresh(
        &self,
        recipient: &Jid,
        element_id: Option<String>,
    ) -> Result<SendReport> {
        let (key_material, iv) = payload::fresh_key_material();
        self.encrypt_and_send(recipient, None, key_material, iv.to_vec(), element_id)
            .await
    }

    /// Wrap `payload_key` for every device of `recipient` and every other
    /// device of our own account, fetching bundles where needed, and send
    ///
    /// Devices whose bundle fetch fails are left out. The send fails only
    /// if no device is left.
    pub async fn encrypt_and_send(
        &self,
        recipient: &Jid,
        payload: Option<Vec<u8>>,
        payload_key: Vec<u8>,
        iv: Vec<u8>,
        element_id: Option<String>,
    ) -> Result<SendReport> {
        let element_id = element_id_or_new(element_id);
        let recipient = recipient.bare();

        let resolution = self
            .request(|reply| Command::Resolve {
                recipient: recipient.clone(),
                reply,
            })
            .await?;

        let mut targets = resolution.ready;
        let mut excluded = Vec::new();
        let fetched = join_all(
            resolution
                .pending
                .into_iter()
                .map(|(address, rx)| async move { (address, rx.await) }),
        )
        .await;

        for (address, outcome) in fetched {
            match outcome {
                Ok(Ok(())) => targets.push(address),
                Ok(Err(e)) => {
                    log::warn!(
                        "Excluding {}:{} from {}: {}",
                        address.0,
                        address.1,
                        element_id,
                        e
                    );
                    excluded.push(address);
                }
                Err(_) => return Err(OmemoError::EngineStopped),
            }
        }

        self.request(|reply| Command::WrapAndSend {
            request: WrapRequest {
                recipient,
                targets,
                excluded,
                payload,
                payload_key,
                iv,
                element_id,
            },
            reply,
        })
        .await?
    }

    /// Encrypt `plaintext` with a fresh payload key and send it
    pub async fn send_message(
        &self,
        recipient: &Jid,
        plaintext: &[u8],
        element_id: Option<String>,
    ) -> Result<SendReport> {
        let sealed = payload::seal(plaintext)?;
        self.encrypt_and_send(
            recipient,
            Some(sealed.ciphertext),
            sealed.key_material,
            sealed.iv.to_vec(),
            element_id,
        )
        .await
    }

    /// Publish our device list (everything known plus us) and our bundle
    pub async fn announce(&self) -> Result<()> {
        self.request(|reply| Command::Announce { reply }).await?
    }

    /// Devices currently known for `identity`
    pub async fn known_devices(&self, identity: &Jid) -> Result<BTreeSet<DeviceId>> {
        self.request(|reply| Command::KnownDevices {
            identity: identity.bare(),
            reply,
        })
        .await
    }

    /// Fetch bookkeeping counters
    pub async fn stats(&self) -> Result<EngineStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Queue an inbound stanza
    pub async fn handle_stanza(&self, stanza: Stanza) -> Result<()> {
        self.tx
            .send(Command::Inbound { stanza })
            .await
            .map_err(|_| OmemoError::EngineStopped)
    }

    /// Forward every stanza from `inbound` into the engine
    pub fn spawn_inbound_pump(&self, mut inbound: mpsc::UnboundedReceiver<Stanza>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(stanza) = inbound.recv().await {
                if engine.handle_stanza(stanza).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Stop the engine task; outstanding operations resolve as `EngineStopped`
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| OmemoError::EngineStopped)?;
        rx.await.map_err(|_| OmemoError::EngineStopped)
    }

    async fn pending<T>(
        &self,
        element_id: String,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> PendingOperation<T> {
        let (reply, rx) = oneshot::channel();
        // On failure the reply sender is dropped with the command and
        // `wait` reports `EngineStopped`.
        if self.tx.send(command(reply)).await.is_err() {
            log::debug!("Engine stopped, {} not queued", element_id);
        }
        PendingOperation { element_id, rx }
    }
}

/// Recover a received payload with the local device's wrapped key
///
/// Returns `None` for key-transport envelopes once the key unwraps.
pub fn decrypt_payload(
    backend: &dyn SessionBackend,
    local_device: DeviceId,
    sender: &Jid,
    sender_device_id: DeviceId,
    keys: &BTreeMap<DeviceId, Vec<u8>>,
    iv: &[u8],
    ciphertext: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
    let wrapped = keys.get(&local_device).ok_or_else(|| SessionError::Unwrap {
        reason: format!("envelope carries no key for device {local_device}"),
    })?;
    let key_material = backend.unwrap(wrapped, sender, sender_device_id)?;

    ciphertext
        .map(|ciphertext| payload::open(&key_material, iv, ciphertext))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalDevice;
    use crate::delegate::{ChannelDelegate, OmemoEvent};
    use crate::session::StaticSessionBackend;
    use crate::storage::MemoryStorage;
    use crate::transport::{Envelope, MemoryNetwork};
    use crate::utils::{BundleError, DirectoryError, EnvelopeError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn id(value: u32) -> DeviceId {
        DeviceId::new(value).unwrap()
    }

    fn alice() -> Jid {
        Jid::parse("alice@example.org").unwrap()
    }

    fn bob() -> Jid {
        Jid::parse("bob@example.org").unwrap()
    }

    /// Transport with canned bundles that records every call
    #[derive(Default)]
    struct ScriptedTransport {
        bundles: Mutex<HashMap<DeviceId, Bundle>>,
        gate: Option<Arc<Semaphore>>,
        fetches: AtomicUsize,
        device_lists: Mutex<Vec<Vec<DeviceId>>>,
        bundle_publishes: AtomicUsize,
        list_requests: AtomicUsize,
        sent: Mutex<Vec<(Jid, String, Vec<u8>)>>,
    }

    impl ScriptedTransport {
        fn with_bundles(bundles: impl IntoIterator<Item = Bundle>) -> Self {
            let transport = Self::default();
            transport
                .bundles
                .lock()
                .unwrap()
                .extend(bundles.into_iter().map(|bundle| (bundle.device_id, bundle)));
            transport
        }

        fn gated(mut self, gate: Arc<Semaphore>) -> Self {
            self.gate = Some(gate);
            self
        }

        fn sent(&self) -> Vec<(Jid, String, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn publish_device_list(
            &self,
            _account: &Jid,
            device_ids: &[DeviceId],
            _element_id: &str,
        ) -> std::result::Result<(), TransportError> {
            self.device_lists.lock().unwrap().push(device_ids.to_vec());
            Ok(())
        }

        async fn publish_bundle(
            &self,
            _account: &Jid,
            _bundle: &Bundle,
            _element_id: &str,
        ) -> std::result::Result<(), TransportError> {
            self.bundle_publishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_bundle(
            &self,
            request: &BundleRequest,
        ) -> std::result::Result<Bundle, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }

            let bundle = self.bundles.lock().unwrap().get(&request.device_id).cloned();
            bundle.ok_or_else(|| FetchError::Failed {
                identity: request.identity.to_string(),
                device_id: request.device_id.value(),
                reason: "item-not-found".to_string(),
            })
        }

        async fn request_device_list(
            &self,
            _identity: &Jid,
        ) -> std::result::Result<(), TransportError> {
            self.list_requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_message(
            &self,
            to: &Jid,
            element_id: &str,
            envelope: Vec<u8>,
        ) -> std::result::Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((to.clone(), element_id.to_string(), envelope));
            Ok(())
        }
    }

    struct Fixture {
        engine: OmemoEngine,
        transport: Arc<ScriptedTransport>,
        storage: Arc<MemoryStorage>,
        backend: Arc<StaticSessionBackend>,
        events: mpsc::UnboundedReceiver<OmemoEvent>,
    }

    impl Fixture {
        fn drain_events(&mut self) -> Vec<OmemoEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn start(transport: ScriptedTransport) -> Fixture {
        let local = LocalDevice::generate(id(1), 20).unwrap();
        let storage = Arc::new(MemoryStorage::new(local.bundle()));
        let backend = Arc::new(StaticSessionBackend::new(local));
        let transport = Arc::new(transport);
        let (delegate, events) = ChannelDelegate::new();

        let engine = OmemoEngine::start(
            EngineSettings::new(Jid::parse("alice@example.org/phone").unwrap(), id(1)),
            Collaborators {
                storage: storage.clone(),
                backend: backend.clone(),
                transport: transport.clone(),
                delegate: Arc::new(delegate),
            },
        )
        .unwrap();

        Fixture {
            engine,
            transport,
            storage,
            backend,
            events,
        }
    }

    fn device_list(from: Jid, device_ids: &[u32]) -> Stanza {
        Stanza {
            to: alice(),
            from,
            element_id: "devicelist".to_string(),
            kind: StanzaKind::DeviceList {
                device_ids: device_ids.iter().map(|value| id(*value)).collect(),
            },
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_rejected_by_storage() {
        let storage = Arc::new(MemoryStorage::new(
            LocalDevice::generate(id(2), 20).unwrap().bundle(),
        ));
        let (delegate, _events) = ChannelDelegate::new();

        let result = OmemoEngine::start(
            EngineSettings::new(alice(), id(1)),
            Collaborators {
                storage,
                backend: Arc::new(StaticSessionBackend::new(
                    LocalDevice::generate(id(1), 20).unwrap(),
                )),
                transport: Arc::new(ScriptedTransport::default()),
                delegate: Arc::new(delegate),
            },
        );

        assert!(matches!(
            result,
            Err(OmemoError::Storage(StorageError::ConfigureRejected { .. }))
        ));
    }

    #[tokio::test]
    async fn test_own_list_without_self_is_repaired_once() {
        let mut fx = start(ScriptedTransport::default());
        assert_eq!(fx.engine.account(), &alice());

        fx.engine
            .handle_stanza(device_list(alice(), &[5, 6]))
            .await
            .unwrap();
        eventually(|| fx.transport.device_lists.lock().unwrap().len() == 1).await;
        assert_eq!(
            fx.transport.device_lists.lock().unwrap()[0],
            vec![id(1), id(5), id(6)]
        );

        // the server echoes the repaired list back
        fx.engine
            .handle_stanza(device_list(alice(), &[1, 5, 6]))
            .await
            .unwrap();
        fx.engine.stats().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.transport.device_lists.lock().unwrap().len(), 1);
        assert_eq!(
            fx.engine.known_devices(&alice()).await.unwrap(),
            BTreeSet::from([id(1), id(5), id(6)])
        );

        let updates = fx
            .drain_events()
            .into_iter()
            .filter(|event| matches!(event, OmemoEvent::DeviceListUpdate { .. }))
            .count();
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn test_remote_list_replaces_previous() {
        let fx = start(ScriptedTransport::default());

        fx.engine.handle_stanza(device_list(bob(), &[3, 4])).await.unwrap();
        fx.engine.handle_stanza(device_list(bob(), &[4])).await.unwrap();

        assert_eq!(
            fx.engine.known_devices(&bob()).await.unwrap(),
            BTreeSet::from([id(4)])
        );
        assert_eq!(
            fx.storage.fetch_device_ids_for_identity(&bob()),
            Some(vec![id(4)])
        );
        assert!(fx.transport.device_lists.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_device_ids() {
        let fx = start(ScriptedTransport::default());

        let first = fx.engine.publish_device_ids(vec![id(1), id(2)], None).await;
        let second = fx
            .engine
            .publish_device_ids(vec![id(1)], Some(String::new()))
            .await;
        assert!(!first.element_id().is_empty());
        assert_ne!(first.element_id(), second.element_id());
        first.wait().await.unwrap();
        second.wait().await.unwrap();

        let named = fx
            .engine
            .publish_device_ids(vec![id(1)], Some("dl-7".to_string()))
            .await;
        assert_eq!(named.element_id(), "dl-7");
        named.wait().await.unwrap();

        let missing_self = fx.engine.publish_device_ids(vec![id(2)], None).await;
        assert!(matches!(
            missing_self.wait().await,
            Err(OmemoError::Directory(DirectoryError::SelfDeviceOmitted { device_id: 1 }))
        ));
        assert_eq!(fx.transport.device_lists.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_publish_bundle_validates_before_transport() {
        let fx = start(ScriptedTransport::default());
        let mut bundle = LocalDevice::generate(id(1), 20).unwrap().bundle();
        bundle.pre_keys.pop();

        let op = fx.engine.publish_bundle(bundle, None).await;
        assert!(!op.element_id().is_empty());
        assert!(matches!(
            op.wait().await,
            Err(OmemoError::Bundle(BundleError::TooFewPreKeys { count: 19, min: 20 }))
        ));
        assert_eq!(fx.transport.bundle_publishes.load(Ordering::SeqCst), 0);

        let valid = fx.backend.bundle();
        fx.engine.publish_bundle(valid, None).await.wait().await.unwrap();
        assert_eq!(fx.transport.bundle_publishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_announce_publishes_list_and_bundle() {
        let fx = start(ScriptedTransport::default());
        fx.storage.store_device_ids(&[id(2)], &alice());

        fx.engine.announce().await.unwrap();

        assert_eq!(
            fx.transport.device_lists.lock().unwrap().clone(),
            vec![vec![id(1), id(2)]]
        );
        assert_eq!(fx.transport.bundle_publishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_bundle_establishes_session() {
        let remote = LocalDevice::generate(id(10), 20).unwrap();
        let mut fx = start(ScriptedTransport::with_bundles([remote.bundle()]));

        let op = fx
            .engine
            .fetch_bundle_for_device(&bob(), id(10), Some("b-1".to_string()))
            .await;
        assert_eq!(op.element_id(), "b-1");
        let bundle = op.wait().await.unwrap();

        assert_eq!(bundle, remote.bundle());
        assert!(fx.storage.is_session_valid(&bob(), id(10)));
        assert!(fx.backend.is_session_valid(&bob(), id(10)));
        assert!(fx.drain_events().iter().any(|event| matches!(
            event,
            OmemoEvent::BundleReceived { request, .. } if request.element_id == "b-1"
        )));

        let missing = fx.engine.fetch_bundle_for_device(&bob(), id(11), None).await;
        assert!(matches!(
            missing.wait().await,
            Err(OmemoError::Fetch(FetchError::Failed { device_id: 11, .. }))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_sends_share_one_fetch() {
        let remote = StaticSessionBackend::new(LocalDevice::generate(id(10), 20).unwrap());
        let gate = Arc::new(Semaphore::new(0));
        let fx = start(ScriptedTransport::with_bundles([remote.bundle()]).gated(gate.clone()));
        fx.storage.store_device_ids(&[id(10)], &bob());

        let send = |engine: OmemoEngine| {
            tokio::spawn(async move {
                engine
                    .encrypt_and_send(&bob(), Some(vec![1, 2, 3]), vec![7; 32], vec![0; 12], None)
                    .await
            })
        };
        let first = send(fx.engine.clone());
        let second = send(fx.engine.clone());

        let mut stats = EngineStats::default();
        for _ in 0..200 {
            stats = fx.engine.stats().await.unwrap();
            if stats.fetch_waiters == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            stats,
            EngineStats {
                in_flight_fetches: 1,
                fetch_waiters: 2
            }
        );

        gate.add_permits(1);
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(fx.transport.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(first.recipients, vec![(bob(), id(10))]);
        assert_eq!(second.recipients, vec![(bob(), id(10))]);
        assert_ne!(first.element_id, second.element_id);
        assert_eq!(fx.engine.stats().await.unwrap(), EngineStats::default());

        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 2);
        let envelope = parse_envelope(&sent[0].2).unwrap();
        let key = remote
            .unwrap(envelope.key_for(id(10)).unwrap(), &alice(), id(1))
            .unwrap();
        assert_eq!(key, vec![7; 32]);
    }

    #[tokio::test]
    async fn test_failed_fetch_excludes_only_that_device() {
        let remote = StaticSessionBackend::new(LocalDevice::generate(id(10), 20).unwrap());
        let mut fx = start(ScriptedTransport::default());
        fx.storage.store_device_ids(&[id(10), id(11)], &bob());
        fx.storage.store_device_ids(&[id(1)], &alice());
        fx.backend
            .establish_session(&bob(), id(10), &remote.bundle())
            .unwrap();
        fx.storage.store_session_validity(&bob(), id(10), true);

        let report = fx
            .engine
            .encrypt_and_send(
                &bob(),
                Some(b"ciphertext".to_vec()),
                vec![9; 32],
                vec![0; 12],
                Some("m-1".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(report.element_id, "m-1");
        assert_eq!(report.recipients, vec![(bob(), id(10))]);
        assert_eq!(report.excluded, vec![(bob(), id(11))]);

        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, bob());
        let envelope = parse_envelope(&sent[0].2).unwrap();
        assert_eq!(envelope.keys.keys().copied().collect::<Vec<_>>(), vec![id(10)]);
        assert_eq!(envelope.sender_device_id, id(1));

        assert!(fx.drain_events().iter().any(|event| matches!(
            event,
            OmemoEvent::Error(OmemoError::Fetch(FetchError::Failed { device_id: 11, .. }))
        )));
    }

    #[tokio::test]
    async fn test_short_fetched_bundle_excludes_device() {
        let remote = StaticSessionBackend::new(LocalDevice::generate(id(10), 20).unwrap());
        let mut short = LocalDevice::generate(id(11), 20).unwrap().bundle();
        short.pre_keys.pop();
        let mut fx = start(ScriptedTransport::with_bundles([short]));
        fx.storage.store_device_ids(&[id(10), id(11)], &bob());
        fx.storage.store_device_ids(&[id(1)], &alice());
        fx.backend
            .establish_session(&bob(), id(10), &remote.bundle())
            .unwrap();
        fx.storage.store_session_validity(&bob(), id(10), true);

        let report = fx
            .engine
            .encrypt_and_send(&bob(), Some(vec![1]), vec![9; 32], vec![0; 12], None)
            .await
            .unwrap();

        assert_eq!(fx.transport.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(report.recipients, vec![(bob(), id(10))]);
        assert_eq!(report.excluded, vec![(bob(), id(11))]);
        assert!(!fx.storage.is_session_valid(&bob(), id(11)));

        let envelope = parse_envelope(&fx.transport.sent()[0].2).unwrap();
        assert!(envelope.key_for(id(11)).is_none());
        assert!(fx.drain_events().iter().any(|event| matches!(
            event,
            OmemoEvent::Error(OmemoError::Fetch(FetchError::Invalid {
                device_id: 11,
                source: BundleError::TooFewPreKeys { count: 19, min: 20 },
                ..
            }))
        )));
    }

    #[tokio::test]
    async fn test_attached_bundle_request_keeps_its_element_id() {
        let remote = LocalDevice::generate(id(10), 20).unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let mut fx = start(ScriptedTransport::with_bundles([remote.bundle()]).gated(gate.clone()));

        let first = fx
            .engine
            .fetch_bundle_for_device(&bob(), id(10), Some("b-1".to_string()))
            .await;
        let second = fx
            .engine
            .fetch_bundle_for_device(&bob(), id(10), Some("b-9".to_string()))
            .await;

        for _ in 0..200 {
            if fx.engine.stats().await.unwrap().fetch_waiters == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        gate.add_permits(1);

        assert_eq!(first.wait().await.unwrap(), remote.bundle());
        assert_eq!(second.wait().await.unwrap(), remote.bundle());
        assert_eq!(fx.transport.fetches.load(Ordering::SeqCst), 1);

        let reported: Vec<String> = fx
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                OmemoEvent::BundleReceived { request, .. } => Some(request.element_id),
                _ => None,
            })
            .collect();
        assert_eq!(reported, vec!["b-1".to_string(), "b-9".to_string()]);
    }

    #[tokio::test]
    async fn test_no_devices_is_an_error() {
        let fx = start(ScriptedTransport::default());

        let result = fx
            .engine
            .encrypt_and_send(&bob(), None, vec![7; 32], vec![0; 12], None)
            .await;

        assert!(matches!(
            result,
            Err(OmemoError::Send(SendError::NoValidRecipients { .. }))
        ));
        eventually(|| fx.transport.list_requests.load(Ordering::SeqCst) >= 1).await;
        assert!(fx.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_key_transport() {
        let fx = start(ScriptedTransport::default());

        let op = fx
            .engine
            .send_key_transport(
                &Jid::parse("bob@example.org/laptop").unwrap(),
                BTreeMap::from([(id(10), vec![1, 2, 3])]),
                vec![4; 12],
                Some("kt-1".to_string()),
            )
            .await;
        assert_eq!(op.element_id(), "kt-1");
        op.wait().await.unwrap();

        let sent = fx.transport.sent();
        assert_eq!(sent[0].0, bob());
        let envelope = parse_envelope(&sent[0].2).unwrap();
        assert!(envelope.is_key_transport());
        assert_eq!(envelope.element_id, "kt-1");
        assert_eq!(envelope.iv, [4; 12]);

        let bad_iv = fx
            .engine
            .send_payload(
                Some(vec![1]),
                &bob(),
                BTreeMap::from([(id(10), vec![1])]),
                vec![0; 5],
                None,
            )
            .await;
        assert!(matches!(
            bad_iv.wait().await,
            Err(OmemoError::Envelope(EnvelopeError::InvalidIvLength { .. }))
        ));
        assert_eq!(fx.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_send_key_transport_fresh() {
        let remote = StaticSessionBackend::new(LocalDevice::generate(id(10), 20).unwrap());
        let fx = start(ScriptedTransport::default());
        fx.storage.store_device_ids(&[id(10)], &bob());
        fx.storage.store_device_ids(&[id(1)], &alice());
        fx.backend
            .establish_session(&bob(), id(10), &remote.bundle())
            .unwrap();
        fx.storage.store_session_validity(&bob(), id(10), true);

        let report = fx
            .engine
            .send_key_transport_fresh(&bob(), Some("kt-2".to_string()))
            .await
            .unwrap();
        assert_eq!(report.element_id, "kt-2");
        assert_eq!(report.recipients, vec![(bob(), id(10))]);

        let sent = fx.transport.sent();
        let envelope = parse_envelope(&sent[0].2).unwrap();
        assert!(envelope.is_key_transport());
        assert_eq!(envelope.element_id, "kt-2");
        let key = remote
            .unwrap(envelope.key_for(id(10)).unwrap(), &alice(), id(1))
            .unwrap();
        assert_eq!(key.len(), payload::KEY_MATERIAL_LEN);
    }

    #[tokio::test]
    async fn test_inbound_envelopes() {
        let mut fx = start(ScriptedTransport::default());
        let envelope: Envelope = build_envelope(
            Some(vec![1, 2]),
            &[3; 12],
            BTreeMap::from([(id(1), vec![5])]),
            &alice(),
            id(10),
            Some("in-1".to_string()),
        )
        .unwrap();

        let stanza = |kind| Stanza {
            from: Jid::parse("bob@example.org/laptop").unwrap(),
            to: alice(),
            element_id: "in-1".to_string(),
            kind,
        };
        fx.engine
            .handle_stanza(stanza(StanzaKind::Encrypted {
                raw: encode(&envelope).unwrap(),
            }))
            .await
            .unwrap();
        fx.engine
            .handle_stanza(stanza(StanzaKind::Encrypted { raw: vec![0xff; 8] }))
            .await
            .unwrap();
        fx.engine
            .handle_stanza(stanza(StanzaKind::Other {
                name: "presence".to_string(),
            }))
            .await
            .unwrap();
        fx.engine.stats().await.unwrap();

        let events = fx.drain_events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            OmemoEvent::PayloadReceived {
                sender_device_id,
                payload,
                element_id,
                ..
            } => {
                assert_eq!(*sender_device_id, Some(id(10)));
                assert_eq!(payload.as_deref(), Some(&[1u8, 2][..]));
                assert_eq!(element_id, "in-1");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events[1], OmemoEvent::Error(OmemoError::Envelope(_))));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let fx = start(ScriptedTransport::default());
        fx.engine.shutdown().await.unwrap();

        assert!(matches!(
            fx.engine.stats().await,
            Err(OmemoError::EngineStopped)
        ));
        let op = fx.engine.publish_device_ids(vec![id(1)], None).await;
        assert!(matches!(op.wait().await, Err(OmemoError::EngineStopped)));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = EngineConfig::default();
        config.account.jid = "alice@example.org/phone".to_string();
        config.account.device_id = Some(42);
        config.bundle.verify_signatures = true;

        let settings = EngineSettings::from_config(&config).unwrap();
        assert_eq!(settings.device_id, id(42));
        assert_eq!(settings.account.as_str(), "alice@example.org/phone");
        assert!(settings.verify_signatures);

        config.account.device_id = None;
        assert!(EngineSettings::from_config(&config).is_ok());

        config.account.jid = String::new();
        assert!(EngineSettings::from_config(&config).is_err());
    }

    struct Client {
        engine: OmemoEngine,
        backend: Arc<StaticSessionBackend>,
        events: mpsc::UnboundedReceiver<OmemoEvent>,
    }

    fn client(network: &MemoryNetwork, jid: &str, device: u32) -> Client {
        let jid = Jid::parse(jid).unwrap();
        let local = LocalDevice::generate(id(device), 20).unwrap();
        let storage = Arc::new(MemoryStorage::new(local.bundle()));
        let backend = Arc::new(StaticSessionBackend::new(local));
        let (transport, inbound) = network.connect(&jid);
        let (delegate, events) = ChannelDelegate::new();

        let engine = OmemoEngine::start(
            EngineSettings::new(jid, id(device)),
            Collaborators {
                storage,
                backend: backend.clone(),
                transport: Arc::new(transport),
                delegate: Arc::new(delegate),
            },
        )
        .unwrap();
        engine.spawn_inbound_pump(inbound);

        Client {
            engine,
            backend,
            events,
        }
    }

    async fn wait_for_devices(engine: &OmemoEngine, identity: &Jid, expected: &[u32]) {
        let expected: BTreeSet<DeviceId> = expected.iter().map(|value| id(*value)).collect();
        for _ in 0..200 {
            if engine.known_devices(identity).await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{identity} never reached {expected:?}");
    }

    async fn next_payload(client: &mut Client) -> Option<Vec<u8>> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), client.events.recv())
                .await
                .unwrap()
                .unwrap();

            if let OmemoEvent::PayloadReceived {
                from,
                sender_device_id: Some(sender_device_id),
                payload,
                keys,
                iv,
                ..
            } = event
            {
                return decrypt_payload(
                    client.backend.as_ref(),
                    client.engine.device_id(),
                    &from,
                    sender_device_id,
                    &keys,
                    &iv,
                    payload.as_deref(),
                )
                .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_message_reaches_recipient_and_own_devices() {
        let network = MemoryNetwork::default();
        let phone = client(&network, "alice@example.org/phone", 1);
        let mut laptop = client(&network, "alice@example.org/laptop", 2);
        let mut bob_client = client(&network, "bob@example.org/desktop", 3);

        phone.engine.announce().await.unwrap();
        laptop.engine.announce().await.unwrap();
        bob_client.engine.announce().await.unwrap();

        wait_for_devices(&phone.engine, &alice(), &[1, 2]).await;
        wait_for_devices(&phone.engine, &bob(), &[3]).await;

        let report = phone
            .engine
            .send_message(&bob(), b"Hello, Bob!", None)
            .await
            .unwrap();
        assert_eq!(
            report.recipients.iter().cloned().collect::<BTreeSet<_>>(),
            BTreeSet::from([(alice(), id(2)), (bob(), id(3))])
        );
        assert!(report.excluded.is_empty());
        assert_eq!(network.fetch_count(), 2);

        assert_eq!(
            next_payload(&mut bob_client).await,
            Some(b"Hello, Bob!".to_vec())
        );
        assert_eq!(
            next_payload(&mut laptop).await,
            Some(b"Hello, Bob!".to_vec())
        );

        // sessions are reused for the next message
        phone
            .engine
            .send_message(&bob(), b"Again", None)
            .await
            .unwrap();
        assert_eq!(network.fetch_count(), 2);
        assert_eq!(next_payload(&mut bob_client).await, Some(b"Again".to_vec()));
    }
}
