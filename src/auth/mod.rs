use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{
        HeaderMap,
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
    },
};
use thiserror::Error;

use crate::{
    AppError, Oracles,
    config::Config,
    store::{StoreError, UserId, with_deadline},
};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves an opaque session token to the user it was issued for.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Pulls the session token from the named cookie, falling back to an
/// `Authorization: Bearer` header.
pub fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let from_cookie = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|x| x.to_str().ok())
        .flat_map(|x| x.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|x| !x.is_empty());

    from_cookie.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|x| x.to_str().ok())
            .and_then(|x| x.strip_prefix("Bearer "))
            .map(|x| x.trim().to_owned())
            .filter(|x| !x.is_empty())
    })
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub UserId);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
    Oracles: FromRef<S>,
    Arc<Config>: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = Arc::<Config>::from_ref(state);
        let Some(token) = session_token(&parts.headers, &config.session_cookie) else {
            return Err(AppError::Unauthorized);
        };

        let oracles = Oracles::from_ref(state);
        let user_id = with_deadline(config.connection.store_timeout, async {
            match oracles.sessions.authenticate(&token).await {
                Ok(user_id) => Ok(Some(user_id)),
                Err(AuthError::Unauthorized) => Ok(None),
                Err(AuthError::Store(e)) => Err(e),
            }
        })
        .await?;

        user_id.map(CurrentUser).ok_or(AppError::Unauthorized)
    }
}
