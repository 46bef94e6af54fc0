//! Credential resolution for HTTP requests and live connections.
//!
//! Both entry points hand the raw bearer string to an [`Authenticator`],
//! which either names the user or refuses. Resolution never mutates state.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use futures::future::BoxFuture;
use tracing::debug;

use parley_shared::constants::TOKEN_HEADER;
use parley_shared::token::verify_token;
use parley_shared::UserId;

use crate::api::AppState;
use crate::error::{AuthError, ServerError};
use crate::store::MessageStore;

pub trait Authenticator: Send + Sync {
    /// Resolve a bearer credential to the user it was issued for.
    fn resolve<'a>(
        &'a self,
        credential: Option<&'a str>,
    ) -> BoxFuture<'a, Result<UserId, AuthError>>;
}

pub type SharedAuthenticator = Arc<dyn Authenticator>;

/// Verifies issuer-signed session tokens and checks that the user still
/// exists in the store.
pub struct TokenAuthenticator {
    issuer_pubkey: [u8; 32],
    store: MessageStore,
}

impl TokenAuthenticator {
    pub fn new(issuer_pubkey: [u8; 32], store: MessageStore) -> Self {
        Self {
            issuer_pubkey,
            store,
        }
    }

    async fn resolve_token(&self, credential: Option<&str>) -> Result<UserId, AuthError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        let user = verify_token(credential, &self.issuer_pubkey)?;

        let exists = self
            .store
            .user_exists(user.clone())
            .await
            .map_err(|e| AuthError::Backend(e.to_string()))?;
        if !exists {
            debug!(user = %user, "Token names a user that no longer exists");
            return Err(AuthError::UnknownUser);
        }

        Ok(user)
    }
}

impl Authenticator for TokenAuthenticator {
    fn resolve<'a>(
        &'a self,
        credential: Option<&'a str>,
    ) -> BoxFuture<'a, Result<UserId, AuthError>> {
        Box::pin(self.resolve_token(credential))
    }
}

/// Pull the credential from the `token` header, falling back to
/// `Authorization: Bearer`.
pub fn credential_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(token.to_string());
    }

    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// The authenticated caller of an HTTP route.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let credential = credential_from_headers(&parts.headers);
        let user = state.auth.resolve(credential.as_deref()).await?;
        Ok(AuthUser(user))
    }
}
