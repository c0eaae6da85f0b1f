//! Local key material and payload cryptography.
//!
//! This module holds the device's identity key, its bundle and prekey pool,
//! and the AES-GCM payload sealing used before keys are fanned out per
//! device. Session cryptography lives behind [`crate::session::SessionBackend`].

pub mod identity;
pub mod payload;
pub mod prekeys;

pub use identity::*;
pub use prekeys::*;
