//! Error types and handling for the OMEMO engine.
//!
//! Every component reports through [`OmemoError`], which wraps one enum per
//! concern. Soft failures (fetch timeouts, dropped bundles, malformed
//! envelopes) are surfaced to the application but never stop the engine.

use thiserror::Error;

/// Result type alias for the engine library
pub type Result<T> = std::result::Result<T, OmemoError>;

/// Top-level error type for all engine operations
#[derive(Error, Debug, Clone)]
pub enum OmemoError {
    /// A bundle violated the published-bundle invariants
    #[error("Invalid bundle: {0}")]
    Bundle(#[from] BundleError),

    /// An inbound envelope could not be interpreted
    #[error("Parse error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// A remote bundle fetch did not produce a usable bundle
    #[error("Bundle fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// A send could not be completed
    #[error("Send failed: {0}")]
    Send(#[from] SendError),

    /// Device list bookkeeping errors
    #[error("Device directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Session backend errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Local cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport collaborator errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Storage collaborator errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The engine task is no longer running
    #[error("Engine stopped")]
    EngineStopped,

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Reasons a bundle is rejected (`InvalidBundle`)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    /// Fewer one-time prekeys than the protocol minimum
    #[error("bundle carries {count} prekeys, at least {min} required")]
    TooFewPreKeys { count: usize, min: usize },

    /// Identity key field is empty
    #[error("missing identity key")]
    MissingIdentityKey,

    /// Signed prekey public key or signature is empty
    #[error("missing signed prekey")]
    MissingSignedPreKey,

    /// The same prekey id appears twice
    #[error("duplicate prekey id {id}")]
    DuplicatePreKey { id: u32 },

    /// A prekey with empty key material
    #[error("empty prekey {id}")]
    EmptyPreKey { id: u32 },

    /// Signed prekey signature does not verify against the identity key
    #[error("signed prekey signature does not verify")]
    BadSignature,

    /// A fetched bundle belongs to a different device than requested
    #[error("bundle for device {actual} returned for request of device {expected}")]
    DeviceMismatch { expected: u32, actual: u32 },
}

/// Reasons an inbound envelope is rejected (`ParseError`)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Bytes could not be decoded as an envelope at all
    #[error("malformed envelope: {reason}")]
    Malformed { reason: String },

    /// Envelope wire version is not understood
    #[error("unsupported envelope version {version}")]
    UnsupportedVersion { version: u8 },

    /// IV absent
    #[error("missing iv")]
    MissingIv,

    /// IV present but of the wrong size
    #[error("iv must be {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    /// No per-device keys
    #[error("envelope carries no wrapped keys")]
    NoKeys,

    /// Two key entries for the same device
    #[error("duplicate key for device {device_id}")]
    DuplicateKey { device_id: u32 },

    /// Key entry with no key material
    #[error("empty key for device {device_id}")]
    EmptyKey { device_id: u32 },

    /// Correlation id is empty
    #[error("missing element id")]
    MissingElementId,

    /// Encoded envelope exceeds the size limit
    #[error("envelope too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

/// Soft failures of a remote bundle fetch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The transport gave up waiting for the response
    #[error("fetch of {identity}:{device_id} timed out")]
    Timeout { identity: String, device_id: u32 },

    /// The transport returned an error response
    #[error("fetch of {identity}:{device_id} failed: {reason}")]
    Failed {
        identity: String,
        device_id: u32,
        reason: String,
    },

    /// A response arrived but was not a valid bundle
    #[error("bundle from {identity}:{device_id} dropped: {source}")]
    Invalid {
        identity: String,
        device_id: u32,
        source: BundleError,
    },
}

/// Terminal send failures returned to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No target device ended up with a usable session
    #[error("no valid recipient devices for {recipient}")]
    NoValidRecipients { recipient: String },
}

/// Device list errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The local device must always be part of the published list
    #[error("device list omits own device {device_id}")]
    SelfDeviceOmitted { device_id: u32 },

    /// Device ids live in [1, 2^31 - 1]
    #[error("device id {value} out of range")]
    InvalidDeviceId { value: u32 },

    /// Jid could not be parsed
    #[error("invalid jid: {value:?}")]
    InvalidJid { value: String },
}

/// Session backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session for the pair
    #[error("no session with {identity}:{device_id}")]
    NotFound { identity: String, device_id: u32 },

    /// Bundle could not be turned into a session
    #[error("session establishment failed: {reason}")]
    Establishment { reason: String },

    /// Wrapping the payload key failed
    #[error("key wrap failed: {reason}")]
    Wrap { reason: String },

    /// Unwrapping a received key failed
    #[error("key unwrap failed: {reason}")]
    Unwrap { reason: String },
}

/// Local cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Transport collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Publish to a pubsub node was refused
    #[error("publish to {node} failed: {reason}")]
    PublishFailed { node: String, reason: String },

    /// Message could not be delivered
    #[error("delivery to {recipient} failed: {reason}")]
    DeliveryFailed { recipient: String, reason: String },

    /// Transport not connected
    #[error("transport disconnected")]
    Disconnected,
}

/// Storage collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// `configure` returned false
    #[error("storage refused configuration for {account}")]
    ConfigureRejected { account: String },

    /// Storage has no bundle for the local device
    #[error("no local bundle available")]
    MissingOwnBundle,
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },
}

impl OmemoError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if retrying the operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Fetch(FetchError::Timeout { .. } | FetchError::Failed { .. })
                | Self::Send(SendError::NoValidRecipients { .. })
                | Self::Transport(_)
        )
    }

    /// Returns true if this error indicates tampered or forged material
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Bundle(BundleError::BadSignature)
                | Self::Fetch(FetchError::Invalid {
                    source: BundleError::BadSignature,
                    ..
                })
                | Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::Decryption { .. })
                | Self::Session(SessionError::Unwrap { .. })
        )
    }
}

impl From<std::io::Error> for OmemoError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OmemoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for EnvelopeError {
    fn from(err: bincode::Error) -> Self {
        Self::Malformed {
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        Self::ParseError {
            reason: err.to_string(),
        }
    }
}
