//! Credential seam for the blob/clientKey addUser mode
//!
//! Most devices accept the access-token mode; the blob mode needs material
//! only an external helper can produce, so it is injected as a capability
//! rather than baked in. The default provider reports unavailability.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::zeroconf::AddUserCredentials;

/// Supplies `blob_clientKey` credentials for the addUser fallback.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn blob_client_key(&self) -> Result<AddUserCredentials>;
}

/// Default provider: the blob mode is unavailable.
pub struct NoCredentialProvider;

#[async_trait]
impl CredentialProvider for NoCredentialProvider {
    async fn blob_client_key(&self) -> Result<AddUserCredentials> {
        bail!("no blob_clientKey credential provider configured")
    }
}
