use jsonwebtoken::{DecodingKey, Validation, decode};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use slowchat_db::Database;
use slowchat_types::api::Claims;

/// An authenticated caller: who they are and which session vouches for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub session_id: Uuid,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("session expired or revoked")]
    SessionGone,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Checks the JWT signature and expiry, then that the session it names is
/// still live and belongs to the token's subject.
pub fn verify_token(db: &Database, jwt_secret: &str, token: &str) -> Result<Identity, AuthError> {
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        debug!("Rejected token: {}", e);
        AuthError::InvalidToken
    })?
    .claims;

    let now = chrono::Utc::now().timestamp();
    let session = db
        .get_live_session(&claims.sid.to_string(), now)?
        .ok_or(AuthError::SessionGone)?;

    if session.user_id != claims.sub.to_string() {
        return Err(AuthError::InvalidToken);
    }

    Ok(Identity {
        user_id: claims.sub,
        username: claims.username,
        session_id: claims.sid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use slowchat_db::NewUser;

    const SECRET: &str = "test-secret";

    fn token(sub: Uuid, sid: Uuid, exp: i64) -> String {
        let claims = Claims {
            sub,
            username: "ada".into(),
            sid,
            exp: exp as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn setup() -> (Database, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let user_id = Uuid::new_v4();
        db.create_user(&NewUser {
            id: &user_id.to_string(),
            username: Some("ada"),
            email: None,
            phone: None,
            name: None,
            password_hash: Some("hash"),
        })
        .unwrap();
        (db, user_id)
    }

    #[test]
    fn accepts_token_with_live_session() {
        let (db, user_id) = setup();
        let sid = Uuid::new_v4();
        let exp = chrono::Utc::now().timestamp() + 3600;
        db.create_session(&sid.to_string(), &user_id.to_string(), false, exp).unwrap();

        let identity = verify_token(&db, SECRET, &token(user_id, sid, exp)).unwrap();
        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.session_id, sid);
    }

    #[test]
    fn rejects_revoked_session() {
        let (db, user_id) = setup();
        let sid = Uuid::new_v4();
        let exp = chrono::Utc::now().timestamp() + 3600;
        db.create_session(&sid.to_string(), &user_id.to_string(), false, exp).unwrap();
        db.delete_session(&sid.to_string()).unwrap();

        let err = verify_token(&db, SECRET, &token(user_id, sid, exp)).unwrap_err();
        assert!(matches!(err, AuthError::SessionGone));
    }

    #[test]
    fn rejects_wrong_secret_and_foreign_session() {
        let (db, user_id) = setup();
        let sid = Uuid::new_v4();
        let exp = chrono::Utc::now().timestamp() + 3600;
        db.create_session(&sid.to_string(), &user_id.to_string(), false, exp).unwrap();

        let err = verify_token(&db, "other-secret", &token(user_id, sid, exp)).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));

        let err = verify_token(&db, SECRET, &token(Uuid::new_v4(), sid, exp)).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }
}
