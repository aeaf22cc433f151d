use anyhow::anyhow;
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Extension, Json, extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{debug, info, warn};
use uuid::Uuid;

use slowchat_db::NewUser;
use slowchat_db::models::UserRow;
use slowchat_gateway::identity::Identity;
use slowchat_types::api::{
    AuthResponse, Claims, LoginRequest, MeResponse, MessageBody, RegisterRequest, StatusResponse,
};

use crate::error::ApiError;
use crate::middleware::{authenticate, bearer_token};
use crate::state::AppState;

pub const MIN_PASSWORD_LEN: usize = 7;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = non_empty(req.username);
    let email = non_empty(req.email).map(|e| e.to_lowercase());
    let phone = non_empty(req.phone);
    let name = non_empty(req.name);
    let password = req.password;

    if username.is_none() && email.is_none() {
        return Err(ApiError::Validation("username or email is required".into()));
    }
    if let Some(username) = &username {
        validate_username(username)?;
    }
    if let Some(email) = &email {
        validate_email(email)?;
    }
    if let Some(phone) = &phone {
        validate_phone(phone)?;
    }
    validate_password(&password)?;

    let user = state
        .blocking(move |db| {
            let password_hash = hash_password(&password)?;
            let id = Uuid::new_v4().to_string();
            db.create_user(&NewUser {
                id: &id,
                username: username.as_deref(),
                email: email.as_deref(),
                phone: phone.as_deref(),
                name: name.as_deref(),
                password_hash: Some(&password_hash),
            })
        })
        .await?
        .ok_or_else(|| ApiError::Conflict("username or email already taken".into()))?;

    info!("Registered {} ({})", user.handle(), user.id);
    let auth = start_session(&state, user, false).await?;
    Ok((StatusCode::CREATED, Json(auth)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let identity = req.identity.trim().to_string();
    if identity.is_empty() {
        return Err(ApiError::InvalidCredentials);
    }
    let password = req.password;

    let user = state
        .blocking(move |db| {
            let Some(user) = db.get_user_by_identity(&identity)? else {
                return Ok(None);
            };
            // OAuth-only accounts have no password to check against.
            let Some(hash) = user.password.as_deref() else {
                return Ok(None);
            };
            Ok(verify_password(&password, hash).then_some(user))
        })
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

    debug!("{} ({}) logged in", user.handle(), user.id);
    Ok(Json(start_session(&state, user, req.remember_me).await?))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<MessageBody>, ApiError> {
    let sid = identity.session_id.to_string();
    state.blocking(move |db| db.delete_session(&sid)).await?;
    info!("{} ({}) logged out", identity.username, identity.user_id);
    Ok(Json(MessageBody {
        message: "logged out".into(),
    }))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<MeResponse>, ApiError> {
    let uid = identity.user_id.to_string();
    let user = state
        .blocking(move |db| db.get_user_by_id(&uid))
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(MeResponse {
        user: user.to_user(),
        authenticated: true,
    }))
}

/// Reports whether the request carries a usable token. Never fails on a bad
/// or missing token.
pub async fn status(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<StatusResponse>, ApiError> {
    let anonymous = Json(StatusResponse {
        authenticated: false,
        user: None,
    });

    let Some(token) = bearer_token(&headers) else {
        return Ok(anonymous);
    };
    let identity = match authenticate(&state, token).await {
        Ok(identity) => identity,
        Err(ApiError::Unauthorized) => return Ok(anonymous),
        Err(e) => return Err(e),
    };

    let uid = identity.user_id.to_string();
    let user = state.blocking(move |db| db.get_user_by_id(&uid)).await?;
    Ok(Json(StatusResponse {
        authenticated: user.is_some(),
        user: user.map(|u| u.to_user()),
    }))
}

/// Opens a server-side session for `user` and issues the token bound to it.
pub async fn start_session(state: &AppState, user: UserRow, remember: bool) -> Result<AuthResponse, ApiError> {
    let ttl = if remember {
        state.settings.remember_ttl
    } else {
        state.settings.session_ttl
    };
    let expires_at = Utc::now() + ttl;
    let session_id = Uuid::new_v4();
    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| anyhow!("Corrupt user id '{}': {}", user.id, e))?;

    let (sid, uid) = (session_id.to_string(), user.id.clone());
    state
        .blocking(move |db| db.create_session(&sid, &uid, remember, expires_at.timestamp()))
        .await?;

    let token = create_token(&state.settings.jwt_secret, user_id, &user.handle(), session_id, expires_at)?;

    Ok(AuthResponse {
        user: user.to_user(),
        token,
        expires_at,
    })
}

pub fn create_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    session_id: Uuid,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        sid: session_id,
        exp: expires_at.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// Hashes with Argon2id and a random salt.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("password hashing failed: {}", e))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Stored password hash is unreadable: {}", e);
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn validate_username(username: &str) -> Result<(), ApiError> {
    let len = username.chars().count();
    if !(3..=32).contains(&len) {
        return Err(ApiError::Validation("username must be 3-32 characters".into()));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ApiError::Validation(
            "username may only contain letters, digits, '_' and '.'".into(),
        ));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), ApiError> {
    let invalid = || ApiError::Validation("email is not valid".into());
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    match domain.split_once('.') {
        Some((host, rest)) if !host.is_empty() && !rest.is_empty() && !domain.ends_with('.') => Ok(()),
        _ => Err(invalid()),
    }
}

pub fn validate_phone(phone: &str) -> Result<(), ApiError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ApiError::Validation("phone must be 7-15 digits, optionally prefixed with '+'".into()))
    }
}

pub fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames() {
        assert!(validate_username("alice_01.b").is_ok());
        assert!(validate_username("al").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
        assert!(validate_username("bad name").is_err());
        assert!(validate_username("émile").is_err());
    }

    #[test]
    fn emails() {
        assert!(validate_email("a@b.co").is_ok());
        assert!(validate_email("first.last@mail.example.org").is_ok());
        assert!(validate_email("@b.co").is_err());
        assert!(validate_email("a@b").is_err());
        assert!(validate_email("a@.co").is_err());
        assert!(validate_email("a@b.").is_err());
        assert!(validate_email("a@@b.co").is_err());
        assert!(validate_email("a b@c.de").is_err());
    }

    #[test]
    fn phones_and_passwords() {
        assert!(validate_phone("+4915112345678").is_ok());
        assert!(validate_phone("1234567").is_ok());
        assert!(validate_phone("123456").is_err());
        assert!(validate_phone("+12-345-678").is_err());

        assert!(validate_password("1234567").is_ok());
        assert!(validate_password("123456").is_err());
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn token_carries_session() {
        use jsonwebtoken::{DecodingKey, Validation, decode};

        let (uid, sid) = (Uuid::new_v4(), Uuid::new_v4());
        let expires = Utc::now() + chrono::Duration::hours(1);
        let token = create_token("secret", uid, "alice", sid, expires).unwrap();
        let claims = decode::<Claims>(&token, &DecodingKey::from_secret(b"secret"), &Validation::default())
            .unwrap()
            .claims;
        assert_eq!(claims.sub, uid);
        assert_eq!(claims.sid, sid);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.exp, expires.timestamp() as usize);
    }
}
