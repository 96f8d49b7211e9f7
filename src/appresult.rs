use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{auth::AuthError, store::StoreError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    Unauthorized,
    Forbidden,
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_owned()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_owned()),
            Self::BadRequest(x) => (StatusCode::BAD_REQUEST, x),
            Self::NotFound(x) => (StatusCode::NOT_FOUND, x),
            Self::Conflict(x) => (StatusCode::CONFLICT, x),
            Self::Internal(e) => {
                tracing::error!("request failed: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "server error".to_owned())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(x) => Self::BadRequest(x.to_owned()),
            StoreError::Conflict(x) => Self::Conflict(x.to_owned()),
            StoreError::NotFound(x) => Self::NotFound(x.to_owned()),
            e => Self::Internal(e.into()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => Self::Unauthorized,
            AuthError::Store(e) => e.into(),
        }
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self::Internal(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(anyhow::Error);
apperr_impl!(sqlx::Error);

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn store_errors_map_to_client_statuses() {
        let cases = [
            (StoreError::Validation("name required"), StatusCode::BAD_REQUEST),
            (StoreError::Conflict("taken"), StatusCode::CONFLICT),
            (StoreError::NotFound("room not found"), StatusCode::NOT_FOUND),
            (
                StoreError::Timeout(std::time::Duration::from_secs(2)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn unauthorized_session_is_401() {
        let response = AppError::from(AuthError::Unauthorized).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
