//! Utility modules for configuration, error handling, and common functions.

pub mod config;
pub mod errors;

pub use config::*;
pub use errors::*;