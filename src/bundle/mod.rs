//! Bundle publication and retrieval.

pub mod exchange;

pub use exchange::*;
