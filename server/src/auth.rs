//! Authorization port for the session server.
//!
//! Keeps the server platform-agnostic: whether a credential is a plain
//! nickname, a token minted by a web service or a platform ticket, the
//! check runs behind this trait and may take as long as it needs. The
//! server imposes no timeout; a handler that wants one wraps its own
//! future.

use std::future::Future;
use std::pin::Pin;

/// Verdict produced by an authorization check. `data` is opaque to the
/// session layer; it is stored on the peer and shared through roster
/// broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub authorized: bool,
    pub data: Vec<u8>,
}

impl AuthorizationResponse {
    pub fn accepted(data: Vec<u8>) -> Self {
        Self {
            authorized: true,
            data,
        }
    }

    pub fn rejected() -> Self {
        Self {
            authorized: false,
            data: Vec::new(),
        }
    }
}

pub type AuthorizationFuture = Pin<Box<dyn Future<Output = AuthorizationResponse> + Send>>;

/// Decides whether a submitted credential grants a session.
pub trait AuthorizationHandler: Send + Sync {
    fn authorize(&self, credential: Vec<u8>) -> AuthorizationFuture;
}

/// Accepts everyone and echoes the credential back as session data. The
/// usual handler for deployments that only ask for a display name.
pub struct AcceptAll;

impl AuthorizationHandler for AcceptAll {
    fn authorize(&self, credential: Vec<u8>) -> AuthorizationFuture {
        Box::pin(async move { AuthorizationResponse::accepted(credential) })
    }
}

/// Refuses every credential.
pub struct RejectAll;

impl AuthorizationHandler for RejectAll {
    fn authorize(&self, _credential: Vec<u8>) -> AuthorizationFuture {
        Box::pin(async move { AuthorizationResponse::rejected() })
    }
}
