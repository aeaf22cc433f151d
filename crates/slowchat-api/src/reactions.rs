use axum::{
    Extension, Json,
    extract::{Path, State},
};
use uuid::Uuid;

use slowchat_gateway::identity::Identity;
use slowchat_types::api::{ToggleReactionRequest, ToggleReactionResponse};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<Identity>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<Json<ToggleReactionResponse>, ApiError> {
    let added = state
        .delivery
        .toggle_reaction(me.user_id, chat_id, message_id, req.emoji)
        .await?;
    Ok(Json(ToggleReactionResponse { added }))
}
