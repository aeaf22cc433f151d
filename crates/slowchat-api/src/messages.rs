use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use slowchat_gateway::identity::Identity;
use slowchat_types::api::{MarkReadRequest, ReadCursorResponse, SendMessageRequest};
use slowchat_types::models::Message;

use crate::error::ApiError;
use crate::state::AppState;

pub const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Page of messages strictly older than this seq.
    pub before_seq: Option<i64>,
    /// Page of messages strictly newer than this seq; used to catch up.
    pub after_seq: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

/// 201 with the stored message; 200 when `client_id` matched an earlier send.
pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.delivery.send_message(&me, chat_id, req).await?;
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome.message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(me): Extension<Identity>,
) -> Result<Json<Vec<Message>>, ApiError> {
    state.delivery.require_member(chat_id, me.user_id).await?;

    let cid = chat_id.to_string();
    let uid = me.user_id.to_string();
    let limit = query.limit.clamp(1, MAX_PAGE);
    let (before, after) = (query.before_seq, query.after_seq);

    let messages = state
        .blocking(move |db| {
            let rows = db.list_messages(&cid, &uid, before, after, limit)?;
            db.hydrate_messages(rows)
        })
        .await?;

    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<ReadCursorResponse>, ApiError> {
    let read_seq = state.delivery.mark_read(me.user_id, chat_id, req.seq).await?;
    Ok(Json(ReadCursorResponse { chat_id, read_seq }))
}

/// Hides a message for the caller only. Other members still see it.
pub async fn delete_for_me(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<Identity>,
) -> Result<StatusCode, ApiError> {
    state.delivery.require_member(chat_id, me.user_id).await?;

    let (cid, mid, uid) = (chat_id.to_string(), message_id.to_string(), me.user_id.to_string());
    let hidden = state.blocking(move |db| db.hide_message(&cid, &mid, &uid)).await?;
    if !hidden {
        return Err(ApiError::NotFound("message"));
    }
    Ok(StatusCode::NO_CONTENT)
}
