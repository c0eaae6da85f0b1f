//! Session availability and the session backend seam.
//!
//! The engine does not implement a ratchet. It decides which devices need a
//! session, fetches bundles for the ones missing, and delegates everything
//! cryptographic to a [`SessionBackend`].

pub mod backend;
pub mod gateway;

pub use backend::*;
pub use gateway::*;
