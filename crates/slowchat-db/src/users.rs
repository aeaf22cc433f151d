use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::Database;
use crate::models::{USER_COLUMNS, UserRow};

pub struct NewUser<'a> {
    pub id: &'a str,
    pub username: Option<&'a str>,
    pub email: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub name: Option<&'a str>,
    /// `None` for accounts that can only sign in through OAuth.
    pub password_hash: Option<&'a str>,
}

#[derive(Debug, Default, Clone)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
}

/// A verified identity returned by an OAuth provider.
#[derive(Debug, Clone)]
pub struct OAuthProfile {
    pub provider: String,
    pub provider_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Database {
    // -- Users --

    /// Inserts a user. Returns `None` when the username or email already
    /// belongs to an account. The check and the insert run under one lock, and
    /// a UNIQUE violation from a racing writer is reported the same way.
    pub fn create_user(&self, user: &NewUser<'_>) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let email = user.email.map(str::to_lowercase);
            if identity_taken(conn, user.username, email.as_deref())? {
                return Ok(None);
            }
            let inserted = conn.execute(
                "INSERT INTO users (id, username, email, phone, name, password)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![user.id, user.username, email, user.phone, user.name, user.password_hash],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            query_user(conn, "id = ?1", user.id)?
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("User vanished after insert: {}", user.id))
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    /// Looks a user up by username, or by email (case-insensitive).
    pub fn get_user_by_identity(&self, identity: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            if let Some(user) = query_user(conn, "username = ?1", identity)? {
                return Ok(Some(user));
            }
            query_user(conn, "email = ?1", &identity.to_lowercase())
        })
    }

    /// Returns the ids from `ids` that have no user row.
    pub fn missing_users(&self, ids: &[String]) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM users WHERE id = ?1")?;
            let mut missing = Vec::new();
            for id in ids {
                if !stmt.exists([id])? {
                    missing.push(id.clone());
                }
            }
            Ok(missing)
        })
    }

    /// Prefix search over username, name and email.
    pub fn search_users(&self, query: &str, exclude_id: &str, limit: u32) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let pattern = format!("{}%", escape_like(&query.to_lowercase()));
            let sql = format!(
                "SELECT {} FROM users
                 WHERE id != ?2
                   AND (lower(username) LIKE ?1 ESCAPE '\\'
                        OR lower(name) LIKE ?1 ESCAPE '\\'
                        OR email LIKE ?1 ESCAPE '\\')
                 ORDER BY username IS NULL, username, email
                 LIMIT ?3",
                USER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![pattern, exclude_id, limit], UserRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn update_profile(&self, id: &str, update: &ProfileUpdate) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET
                    name = COALESCE(?2, name),
                    avatar_url = COALESCE(?3, avatar_url),
                    phone = COALESCE(?4, phone)
                 WHERE id = ?1",
                params![id, update.name, update.avatar_url, update.phone],
            )?;
            query_user(conn, "id = ?1", id)
        })
    }

    /// Users who share at least one chat with `user_id`.
    pub fn contact_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT other.user_id
                 FROM chat_members me
                 JOIN chat_members other ON other.chat_id = me.chat_id
                 WHERE me.user_id = ?1 AND other.user_id != ?1",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    /// Resolves an OAuth identity to a local account: an account already
    /// linked to the provider id wins, then an account with the same email
    /// (linked to this provider if it has no link yet), otherwise a
    /// passwordless account is created.
    pub fn upsert_oauth_user(&self, new_id: &str, profile: &OAuthProfile) -> Result<UserRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let linked = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM users WHERE oauth_provider = ?1 AND oauth_provider_id = ?2",
                        USER_COLUMNS
                    ),
                    params![profile.provider, profile.provider_id],
                    UserRow::from_row,
                )
                .optional()?;

            if let Some(user) = linked {
                if user.avatar_url.is_none() && profile.avatar_url.is_some() {
                    tx.execute(
                        "UPDATE users SET avatar_url = ?2 WHERE id = ?1",
                        params![user.id, profile.avatar_url],
                    )?;
                }
                let user = query_user(&tx, "id = ?1", &user.id)?
                    .ok_or_else(|| anyhow::anyhow!("User vanished: {}", user.id))?;
                tx.commit()?;
                return Ok(user);
            }

            let email = profile.email.as_deref().map(str::to_lowercase);

            if let Some(email) = email.as_deref() {
                if let Some(user) = query_user(&tx, "email = ?1", email)? {
                    // An account keeps the first provider it was linked to;
                    // other providers still sign in through the shared email.
                    if user.oauth_provider.is_none() {
                        info!("Linking {} account to existing user {}", profile.provider, user.id);
                        tx.execute(
                            "UPDATE users SET oauth_provider = ?2, oauth_provider_id = ?3,
                                avatar_url = COALESCE(avatar_url, ?4)
                             WHERE id = ?1",
                            params![user.id, profile.provider, profile.provider_id, profile.avatar_url],
                        )?;
                    }
                    let user = query_user(&tx, "id = ?1", &user.id)?
                        .ok_or_else(|| anyhow::anyhow!("User vanished: {}", user.id))?;
                    tx.commit()?;
                    return Ok(user);
                }
            }

            let base = oauth_username_base(profile);
            let username = free_username(&tx, &base)?;

            tx.execute(
                "INSERT INTO users (id, username, email, name, avatar_url, password,
                                    oauth_provider, oauth_provider_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
                params![
                    new_id,
                    username,
                    email,
                    profile.name,
                    profile.avatar_url,
                    profile.provider,
                    profile.provider_id
                ],
            )?;
            let user = query_user(&tx, "id = ?1", new_id)?
                .ok_or_else(|| anyhow::anyhow!("User vanished after insert: {}", new_id))?;
            tx.commit()?;

            info!("Created {} user {} ({})", profile.provider, username, new_id);
            Ok(user)
        })
    }
}

fn query_user(conn: &Connection, predicate: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, predicate);
    let row = conn.query_row(&sql, [value], UserRow::from_row).optional()?;
    Ok(row)
}

/// True if either value already belongs to some account.
fn identity_taken(conn: &Connection, username: Option<&str>, email: Option<&str>) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users
         WHERE (?1 IS NOT NULL AND username = ?1) OR (?2 IS NOT NULL AND email = ?2)",
        params![username, email],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn sanitize_username(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .take(28)
        .collect()
}

fn oauth_username_base(profile: &OAuthProfile) -> String {
    let candidate = profile
        .username
        .clone()
        .or_else(|| {
            profile
                .email
                .as_deref()
                .and_then(|e| e.split('@').next())
                .map(str::to_string)
        })
        .map(|raw| sanitize_username(&raw))
        .unwrap_or_default();

    if candidate.len() >= 3 {
        candidate
    } else {
        sanitize_username(&format!("{}_{}", profile.provider, profile.provider_id))
    }
}

/// First of `base`, `base_2`, `base_3`, … not yet taken.
fn free_username(conn: &Connection, base: &str) -> Result<String> {
    let mut stmt = conn.prepare("SELECT 1 FROM users WHERE username = ?1")?;
    if !stmt.exists([base])? {
        return Ok(base.to_string());
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !stmt.exists([&candidate])? {
            return Ok(candidate);
        }
        n += 1;
    }
}
