use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

use slowchat_db::ProfileUpdate;
use slowchat_gateway::identity::Identity;
use slowchat_types::api::UpdateProfileRequest;
use slowchat_types::models::{User, UserSummary};

use crate::auth::validate_phone;
use crate::error::ApiError;
use crate::state::AppState;

pub const MAX_SEARCH_RESULTS: u32 = 20;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub search: String,
}

/// Prefix search over username, name and email. Never returns the caller.
pub async fn search_users(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserSummary>>, ApiError> {
    let term = query.search.trim().to_string();
    if term.is_empty() {
        return Ok(Json(vec![]));
    }
    let uid = me.user_id.to_string();
    let rows = state
        .blocking(move |db| db.search_users(&term, &uid, MAX_SEARCH_RESULTS))
        .await?;
    Ok(Json(rows.iter().map(|r| r.to_summary()).collect()))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserSummary>, ApiError> {
    let uid = user_id.to_string();
    let row = state
        .blocking(move |db| db.get_user_by_id(&uid))
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    Ok(Json(row.to_summary()))
}

pub async fn get_me(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
) -> Result<Json<User>, ApiError> {
    let uid = me.user_id.to_string();
    let row = state
        .blocking(move |db| db.get_user_by_id(&uid))
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    Ok(Json(row.to_user()))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<User>, ApiError> {
    let update = ProfileUpdate {
        name: req.name.map(|n| n.trim().to_string()),
        avatar_url: req.avatar_url.map(|a| a.trim().to_string()),
        phone: req.phone.map(|p| p.trim().to_string()),
    };
    if let Some(name) = &update.name {
        if name.is_empty() || name.chars().count() > 64 {
            return Err(ApiError::Validation("name must be 1-64 characters".into()));
        }
    }
    if let Some(phone) = &update.phone {
        validate_phone(phone)?;
    }

    let uid = me.user_id.to_string();
    let row = state
        .blocking(move |db| db.update_profile(&uid, &update))
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    Ok(Json(row.to_user()))
}
