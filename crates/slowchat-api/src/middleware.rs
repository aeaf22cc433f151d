use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use tracing::error;

use slowchat_gateway::identity::{Identity, verify_token};

use crate::error::ApiError;
use crate::state::AppState;

/// Validates the bearer token and its session, then hands the caller's
/// `Identity` to the handler through request extensions.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers()).ok_or(ApiError::Unauthorized)?;
    let identity = authenticate(&state, token).await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

pub async fn authenticate(state: &AppState, token: String) -> Result<Identity, ApiError> {
    let db = state.db.clone();
    let secret = state.settings.jwt_secret.clone();
    tokio::task::spawn_blocking(move || verify_token(&db, &secret, &token))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal
        })?
        .map_err(ApiError::from)
}
