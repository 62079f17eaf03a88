//! Caller identity extraction.
//!
//! Authentication proper lives outside this service; the gateway in front
//! of it resolves the session token and forwards the user id in the
//! `X-User-Id` header. `Caller` is the extractor for that contract:
//! requests without the header are rejected with 401 before a handler
//! runs.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller of a request
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::unauthorized("missing caller identity"))?;

        Ok(Caller {
            user_id: user_id.to_string(),
        })
    }
}
