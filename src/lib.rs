//! # OMEMO Engine
//!
//! Protocol engine for multi-device end-to-end encryption over XMPP-style
//! transports: device list management, bundle exchange, session gating and
//! encrypted envelope handling.
//!
//! ## Features
//!
//! - **Device lists**: last announced list wins, and the local device is
//!   republished whenever a list for our own account omits it
//! - **Bundle exchange**: bundles are validated before publishing and after
//!   fetching, with at most one fetch in flight per device
//! - **Envelopes**: one payload key wrapped for every device of the recipient
//!   and every other device of our own account
//! - **Pluggable seams**: storage, session cryptography, transport and
//!   application callbacks are traits
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use omemo_engine::{
//!     ChannelDelegate, Collaborators, DeviceId, EngineSettings, Jid, LocalDevice, MemoryNetwork,
//!     MemoryStorage, OmemoEngine, StaticSessionBackend,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let jid = Jid::parse("alice@example.org/phone")?;
//!     let device = LocalDevice::generate(DeviceId::random(), 100)?;
//!     let device_id = device.device_id();
//!
//!     let network = MemoryNetwork::default();
//!     let (transport, inbound) = network.connect(&jid);
//!     let (delegate, _events) = ChannelDelegate::new();
//!
//!     let engine = OmemoEngine::start(
//!         EngineSettings::new(jid, device_id),
//!         Collaborators {
//!             storage: Arc::new(MemoryStorage::new(device.bundle())),
//!             backend: Arc::new(StaticSessionBackend::new(device)),
//!             transport: Arc::new(transport),
//!             delegate: Arc::new(delegate),
//!         },
//!     )?;
//!     engine.spawn_inbound_pump(inbound);
//!     engine.announce().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`]: the actor owning all protocol state, and its handle
//! - [`device`]: addresses, device ids and the device directory
//! - [`bundle`]: bundle validation, publishing and fetching
//! - [`session`]: session availability and the session backend seam
//! - [`transport`]: the transport seam, envelope wire format and an
//!   in-memory network
//! - [`crypto`]: identity keys, prekeys and payload encryption
//! - [`storage`]: persistence seam
//! - [`delegate`]: application callbacks
//! - [`utils`]: configuration and errors

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod bundle;
pub mod crypto;
pub mod delegate;
pub mod device;
pub mod engine;
pub mod session;
pub mod storage;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use bundle::BundleExchange;
pub use crypto::{Bundle, IdentityKeyPair, LocalDevice, PreKey, SignedPreKey};
pub use delegate::{ChannelDelegate, OmemoDelegate, OmemoEvent};
pub use device::{DeviceDirectory, DeviceId, Jid};
pub use engine::{
    decrypt_payload, Collaborators, EngineSettings, EngineStats, OmemoEngine, PendingOperation,
    SendReport,
};
pub use session::{SessionBackend, StaticSessionBackend};
pub use storage::{MemoryStorage, Storage};
pub use transport::{Envelope, MemoryNetwork, MemoryTransport, Stanza, StanzaKind, Transport};
pub use utils::{EngineConfig, OmemoError, Result};

/// Default configuration values
pub mod defaults {
    /// Default bundle fetch timeout in seconds
    pub const DEFAULT_FETCH_TIMEOUT: u64 = 30;

    /// Default capacity of the engine command queue
    pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
}
