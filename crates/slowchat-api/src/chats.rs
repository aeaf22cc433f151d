use std::collections::BTreeSet;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use slowchat_db::models::ChatRow;
use slowchat_gateway::identity::Identity;
use slowchat_types::api::{AddParticipantsRequest, ChatResponse, CreateGroupRequest, DirectChatRequest};
use slowchat_types::events::GatewayEvent;
use slowchat_types::models::Chat;

use crate::error::ApiError;
use crate::state::AppState;

pub const MAX_GROUP_NAME_CHARS: usize = 64;

pub async fn list_chats(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
) -> Result<Json<Vec<ChatResponse>>, ApiError> {
    let uid = me.user_id.to_string();
    let chats = state
        .blocking(move |db| {
            let rows = db.chats_for_user(&uid)?;
            db.chat_views(&uid, &rows)
        })
        .await?;
    Ok(Json(chats))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_CHARS {
        return Err(ApiError::Validation(format!(
            "group name must be 1-{} characters",
            MAX_GROUP_NAME_CHARS
        )));
    }

    let members: BTreeSet<Uuid> = req
        .participant_ids
        .iter()
        .copied()
        .chain(std::iter::once(me.user_id))
        .collect();
    if members.len() < 2 {
        return Err(ApiError::Validation("a group needs at least one other participant".into()));
    }
    let member_ids: Vec<String> = members.iter().map(Uuid::to_string).collect();
    let admin_ids: Vec<String> = req
        .admin_ids
        .iter()
        .filter(|id| members.contains(*id))
        .map(Uuid::to_string)
        .collect();

    let chat_id = Uuid::new_v4().to_string();
    let creator = me.user_id.to_string();
    let avatar_url = req.avatar_url;
    let row = state
        .blocking(move |db| {
            if !db.missing_users(&member_ids)?.is_empty() {
                return Ok(None);
            }
            let row = db.create_group(&chat_id, &name, avatar_url.as_deref(), &creator, &member_ids, &admin_ids)?;
            Ok(Some(row))
        })
        .await?
        .ok_or(ApiError::NotFound("user"))?;

    info!("{} ({}) created group {} with {} members", me.username, me.user_id, row.id, members.len());

    let recipients: Vec<Uuid> = members.into_iter().collect();
    let chat = notify_with_views(&state, &row, me.user_id, recipients, |chat| GatewayEvent::ChatCreate { chat }).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

/// Returns the one-on-one chat with `user_id`, creating it on first contact.
/// 201 when created, 200 when it already existed.
pub async fn find_or_create_direct(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
    Json(req): Json<DirectChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.user_id == me.user_id {
        return Err(ApiError::Validation("cannot start a chat with yourself".into()));
    }

    let new_id = Uuid::new_v4().to_string();
    let (a, b) = (me.user_id.to_string(), req.user_id.to_string());
    let direct = state
        .blocking(move |db| {
            if db.get_user_by_id(&b)?.is_none() {
                return Ok(None);
            }
            Ok(Some(db.find_or_create_direct(&new_id, &a, &b)?))
        })
        .await?
        .ok_or(ApiError::NotFound("user"))?;

    if direct.created {
        let chat = notify_with_views(&state, &direct.chat, me.user_id, vec![me.user_id, req.user_id], |chat| {
            GatewayEvent::ChatCreate { chat }
        })
        .await?;
        Ok((StatusCode::CREATED, Json(chat)))
    } else {
        let chat = chat_view(&state, &direct.chat, me.user_id).await?;
        Ok((StatusCode::OK, Json(chat)))
    }
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
) -> Result<Json<ChatResponse>, ApiError> {
    let row = state.delivery.require_member(chat_id, me.user_id).await?;
    Ok(Json(chat_view(&state, &row, me.user_id).await?))
}

/// Adds members to a group. Admins only.
pub async fn add_participants(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<AddParticipantsRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let row = state.delivery.require_member(chat_id, me.user_id).await?;
    if !row.is_group {
        return Err(ApiError::Validation("participants can only be changed in group chats".into()));
    }
    if req.user_ids.is_empty() {
        return Err(ApiError::Validation("user_ids must not be empty".into()));
    }

    let cid = chat_id.to_string();
    let uid = me.user_id.to_string();
    let ids: Vec<String> = req
        .user_ids
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(Uuid::to_string)
        .collect();
    let added = state
        .blocking(move |db| {
            let is_admin = db.get_member(&cid, &uid)?.is_some_and(|m| m.is_admin);
            if !is_admin {
                return Ok(Err(ApiError::Forbidden("only admins can add participants")));
            }
            if !db.missing_users(&ids)?.is_empty() {
                return Ok(Err(ApiError::NotFound("user")));
            }
            Ok(Ok(db.add_members(&cid, &ids)?))
        })
        .await??;

    let added: Vec<Uuid> = added.iter().filter_map(|id| id.parse().ok()).collect();
    info!("{} ({}) added {} members to {}", me.username, me.user_id, added.len(), chat_id);

    let members = state.delivery.member_ids(chat_id).await?;
    let (newcomers, existing): (Vec<Uuid>, Vec<Uuid>) = members.into_iter().partition(|id| added.contains(id));
    notify_with_views(&state, &row, me.user_id, newcomers, |chat| GatewayEvent::ChatCreate { chat }).await?;
    let chat = notify_with_views(&state, &row, me.user_id, existing, |chat| GatewayEvent::ChatUpdate { chat }).await?;
    Ok(Json(chat))
}

/// Removes a member from a group. Admins may remove anyone; anyone may leave.
pub async fn remove_participant(
    State(state): State<AppState>,
    Path((chat_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<Identity>,
) -> Result<StatusCode, ApiError> {
    let row = state.delivery.require_member(chat_id, me.user_id).await?;
    if !row.is_group {
        return Err(ApiError::Validation("participants can only be changed in group chats".into()));
    }

    let cid = chat_id.to_string();
    let (caller, target) = (me.user_id.to_string(), user_id.to_string());
    let leaving = user_id == me.user_id;
    let change = state
        .blocking(move |db| {
            if !leaving && !db.get_member(&cid, &caller)?.is_some_and(|m| m.is_admin) {
                return Ok(Err(ApiError::Forbidden("only admins can remove other participants")));
            }
            Ok(Ok(db.remove_member(&cid, &target)?))
        })
        .await??;

    if !change.removed {
        return Err(ApiError::NotFound("participant"));
    }
    if let Some(promoted) = &change.promoted {
        info!("{} promoted to admin of {}", promoted, chat_id);
    }
    info!("{} removed from {} by {}", user_id, chat_id, me.user_id);

    state
        .dispatcher()
        .send_to_user(user_id, GatewayEvent::ParticipantRemoved { chat_id, user_id })
        .await;
    let remaining = state.delivery.member_ids(chat_id).await?;
    notify_with_views(&state, &row, me.user_id, remaining, |chat| GatewayEvent::ChatUpdate { chat }).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn chat_view(state: &AppState, row: &ChatRow, viewer: Uuid) -> Result<Chat, ApiError> {
    let row = row.clone();
    let vid = viewer.to_string();
    state
        .blocking(move |db| db.chat_views(&vid, std::slice::from_ref(&row)))
        .await?
        .pop()
        .ok_or(ApiError::NotFound("chat"))
}

/// Sends each recipient its own view of the chat (unread counts differ per
/// member) and returns the view for `caller`.
async fn notify_with_views<F>(
    state: &AppState,
    row: &ChatRow,
    caller: Uuid,
    recipients: Vec<Uuid>,
    event: F,
) -> Result<Chat, ApiError>
where
    F: Fn(Chat) -> GatewayEvent,
{
    let online = state.dispatcher().online_among(&recipients).await;
    let mut viewers = online.clone();
    if !viewers.contains(&caller) {
        viewers.push(caller);
    }

    let row = row.clone();
    let views = state
        .blocking(move |db| {
            let mut views = Vec::with_capacity(viewers.len());
            for viewer in viewers {
                if let Some(chat) = db.chat_views(&viewer.to_string(), std::slice::from_ref(&row))?.pop() {
                    views.push((viewer, chat));
                }
            }
            Ok(views)
        })
        .await?;

    let mut caller_view = None;
    for (viewer, chat) in views {
        if online.contains(&viewer) {
            state.dispatcher().send_to_user(viewer, event(chat.clone())).await;
        }
        if viewer == caller {
            caller_view = Some(chat);
        }
    }
    caller_view.ok_or(ApiError::NotFound("chat"))
}
