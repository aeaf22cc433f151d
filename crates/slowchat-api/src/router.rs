use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderValue, Method, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use slowchat_gateway::connection;

use crate::error::ApiError;
use crate::middleware::{authenticate, require_auth};
use crate::state::AppState;
use crate::{auth, chats, messages, oauth, reactions, users};

/// The whole HTTP surface, nested under `/api`.
pub fn app(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/status", get(auth::status))
        .route("/auth/{provider}", get(oauth::begin))
        .route("/auth/{provider}/callback", get(oauth::callback))
        .route("/gateway", get(gateway));

    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/users", get(users::search_users))
        .route("/users/me", get(users::get_me).patch(users::update_profile))
        .route("/users/{user_id}", get(users::get_user))
        .route("/chats", get(chats::list_chats).post(chats::create_group))
        .route("/chats/direct", post(chats::find_or_create_direct))
        .route("/chats/{chat_id}", get(chats::get_chat))
        .route("/chats/{chat_id}/participants", post(chats::add_participants))
        .route("/chats/{chat_id}/participants/{user_id}", delete(chats::remove_participant))
        .route("/chats/{chat_id}/messages", get(messages::get_messages).post(messages::send_message))
        .route("/chats/{chat_id}/messages/{message_id}", delete(messages::delete_for_me))
        .route("/chats/{chat_id}/messages/{message_id}/reactions", post(reactions::toggle_reaction))
        .route("/chats/{chat_id}/read", post(messages::mark_read))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = cors_layer(&state.settings.frontend_url);

    Router::new()
        .nest("/api", public_routes.merge(protected_routes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);
    match HeaderValue::from_str(frontend_url.trim_end_matches('/')) {
        Ok(origin) => layer.allow_origin(origin),
        Err(e) => {
            warn!("Frontend URL '{}' is not a valid origin ({}); cross-origin requests will be refused", frontend_url, e);
            layer
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    pub token: Option<String>,
}

/// With `?token=` the socket is authenticated before the upgrade (401 on
/// failure); otherwise the client must send Identify after connecting.
async fn gateway(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let delivery = state.delivery.clone();
    match query.token {
        Some(token) => {
            let identity = authenticate(&state, token).await?;
            Ok(ws
                .on_upgrade(move |socket| connection::handle_connection_authenticated(socket, delivery, identity))
                .into_response())
        }
        None => {
            let jwt_secret = state.settings.jwt_secret.clone();
            Ok(ws
                .on_upgrade(move |socket| connection::handle_connection(socket, delivery, jwt_secret))
                .into_response())
        }
    }
}
