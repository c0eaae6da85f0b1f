//! Publishing and fetching bundles.
//!
//! `BundleExchange` holds no state besides its validation settings. Every
//! bundle that leaves or enters the engine passes through [`BundleExchange::validate`].

use crate::crypto::{Bundle, MIN_PREKEY_COUNT};
use crate::device::Jid;
use crate::storage::Storage;
use crate::transport::{BundleRequest, Transport};
use crate::utils::{BundleError, FetchError, Result, StorageError};

/// Bundle validation and transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleExchange {
    min_pre_keys: usize,
    verify_signatures: bool,
}

impl Default for BundleExchange {
    fn default() -> Self {
        Self::new(MIN_PREKEY_COUNT, false)
    }
}

impl BundleExchange {
    /// Create an exchange; `min_pre_keys` never drops below the protocol floor
    pub fn new(min_pre_keys: usize, verify_signatures: bool) -> Self {
        Self {
            min_pre_keys: min_pre_keys.max(MIN_PREKEY_COUNT),
            verify_signatures,
        }
    }

    /// Check a bundle against the configured rules
    pub fn validate(&self, bundle: &Bundle) -> std::result::Result<(), BundleError> {
        bundle.validate(self.min_pre_keys)?;
        if self.verify_signatures {
            bundle.verify_signature()?;
        }
        Ok(())
    }

    /// Validate and publish a local bundle
    ///
    /// # Errors
    ///
    /// `BundleError` before any network traffic, or the transport's error
    pub async fn publish(
        &self,
        transport: &dyn Transport,
        account: &Jid,
        bundle: &Bundle,
        element_id: &str,
    ) -> Result<()> {
        self.validate(bundle)?;
        transport
            .publish_bundle(&account.bare(), bundle, element_id)
            .await?;
        Ok(())
    }

    /// Fetch a remote bundle and check it belongs to the requested device
    pub async fn fetch(
        &self,
        transport: &dyn Transport,
        request: &BundleRequest,
    ) -> std::result::Result<Bundle, FetchError> {
        let bundle = transport.fetch_bundle(request).await?;

        let invalid = |source| FetchError::Invalid {
            identity: request.identity.to_string(),
            device_id: request.device_id.value(),
            source,
        };

        if bundle.device_id != request.device_id {
            return Err(invalid(BundleError::DeviceMismatch {
                expected: request.device_id.value(),
                actual: bundle.device_id.value(),
            }));
        }
        self.validate(&bundle).map_err(invalid)?;

        Ok(bundle)
    }

    /// The local bundle from storage, validated
    pub fn my_bundle(&self, storage: &dyn Storage) -> Result<Bundle> {
        let bundle = storage
            .fetch_my_bundle()
            .ok_or(StorageError::MissingOwnBundle)?;
        self.validate(&bundle)?;
        Ok(bundle)
    }
}
