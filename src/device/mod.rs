//! Device identities and the per-account device directory.
//!
//! A [`Jid`] names an account; every account owns a set of [`DeviceId`]s,
//! one per logged-in client. The [`DeviceDirectory`] keeps the most recent
//! list announced for each account.

pub mod directory;

pub use directory::*;

use crate::utils::{DirectoryError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest device id allowed by the protocol (2^31 - 1)
pub const MAX_DEVICE_ID: u32 = i32::MAX as u32;

/// Per-account device identifier in `[1, 2^31 - 1]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Wrap a raw id, rejecting values outside the protocol range
    pub fn new(value: u32) -> Result<Self> {
        if value == 0 || value > MAX_DEVICE_ID {
            return Err(DirectoryError::InvalidDeviceId { value }.into());
        }
        Ok(Self(value))
    }

    /// Generate a uniformly random id; uniqueness is not enforced
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(1..=MAX_DEVICE_ID))
    }

    /// Raw numeric value
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for DeviceId {
    type Error = crate::utils::OmemoError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

/// An addressable account, `local@domain` optionally followed by `/resource`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    /// Parse an address; it must be non-empty, contain no whitespace and
    /// have a non-empty domain part. A local part, when present, must be
    /// non-empty and appear only once.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || DirectoryError::InvalidJid {
            value: value.to_string(),
        };

        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(invalid().into());
        }

        let bare = value.split('/').next().unwrap_or_default();
        let domain = match bare.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.contains('@') => domain,
            Some(_) => return Err(invalid().into()),
            None => bare,
        };
        if domain.is_empty() || value.ends_with('/') {
            return Err(invalid().into());
        }

        Ok(Self(value.to_string()))
    }

    /// The account part without resource
    pub fn bare(&self) -> Jid {
        match self.0.split_once('/') {
            Some((bare, _)) => Jid(bare.to_string()),
            None => self.clone(),
        }
    }

    /// Resource part, if this is a full address
    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, resource)| resource)
    }

    /// Whether two addresses name the same account
    pub fn same_account(&self, other: &Jid) -> bool {
        self.bare() == other.bare()
    }

    /// Address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Jid {
    type Err = crate::utils::OmemoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
