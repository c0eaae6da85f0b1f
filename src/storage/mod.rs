//! Storage collaborator interface.
//!
//! The engine never persists anything itself: device lists, the local bundle
//! and session validity flags are read and written through [`Storage`].

pub mod memory;

pub use memory::MemoryStorage;

use crate::crypto::Bundle;
use crate::device::{DeviceId, Jid};

/// Durable state the engine depends on.
///
/// Implementations are called from the engine's serial queue and must not
/// block for long.
pub trait Storage: Send + Sync {
    /// Bind the storage to the local account; returning false aborts startup
    fn configure(&self, account: &Jid, device_id: DeviceId) -> bool;

    /// Persist the latest device list for `identity` (bare address)
    fn store_device_ids(&self, device_ids: &[DeviceId], identity: &Jid);

    /// Last persisted device list, `None` if never seen
    fn fetch_device_ids_for_identity(&self, identity: &Jid) -> Option<Vec<DeviceId>>;

    /// The local device's fully populated bundle
    fn fetch_my_bundle(&self) -> Option<Bundle>;

    /// Whether the session with `(identity, device_id)` may be reused
    fn is_session_valid(&self, identity: &Jid, device_id: DeviceId) -> bool;

    /// Record the validity flag for `(identity, device_id)`
    fn store_session_validity(&self, identity: &Jid, device_id: DeviceId, valid: bool);
}
