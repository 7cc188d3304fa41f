//! Credential port for the session client.
//!
//! Mirrors the server's authorization handler from the submitting side:
//! when the server asks for confirmation, the provider produces whatever
//! bytes the deployment calls a credential, asynchronously.

use std::future::Future;
use std::pin::Pin;

pub type CredentialFuture = Pin<Box<dyn Future<Output = Vec<u8>> + Send>>;

/// Produces the credential submitted during the handshake.
pub trait CredentialProvider: Send + Sync {
    fn produce(&self) -> CredentialFuture;
}

/// Credential known up front, e.g. a display name for deployments that
/// require no real authorization.
pub struct StaticCredential(pub Vec<u8>);

impl CredentialProvider for StaticCredential {
    fn produce(&self) -> CredentialFuture {
        let bytes = self.0.clone();
        Box::pin(async move { bytes })
    }
}
