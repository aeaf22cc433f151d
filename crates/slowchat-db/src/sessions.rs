use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use crate::Database;
use crate::models::SessionRow;

impl Database {
    // -- Sessions --

    pub fn create_session(&self, id: &str, user_id: &str, remember: bool, expires_at: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, remember, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, user_id, remember, expires_at],
            )?;
            Ok(())
        })
    }

    /// Returns the session if it exists and has not expired at `now` (unix seconds).
    pub fn get_live_session(&self, id: &str, now: i64) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, user_id, remember, expires_at, created_at
                     FROM sessions WHERE id = ?1 AND expires_at > ?2",
                    params![id, now],
                    |row| {
                        Ok(SessionRow {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            remember: row.get(2)?,
                            expires_at: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Returns true if a session was removed.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", [id])? > 0))
    }

    /// Drops every session that expired at or before `now`. Returns how many went.
    pub fn prune_expired_sessions(&self, now: i64) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [now])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewUser;

    fn db_with_user() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user(&NewUser {
            id: "u1",
            username: Some("ada"),
            email: None,
            phone: None,
            name: None,
            password_hash: Some("hash"),
        })
        .unwrap();
        db
    }

    #[test]
    fn expired_sessions_are_not_live() {
        let db = db_with_user();
        db.create_session("s1", "u1", false, 1_000).unwrap();

        assert!(db.get_live_session("s1", 999).unwrap().is_some());
        assert!(db.get_live_session("s1", 1_000).unwrap().is_none());
    }

    #[test]
    fn delete_and_prune() {
        let db = db_with_user();
        db.create_session("s1", "u1", true, 1_000).unwrap();
        db.create_session("s2", "u1", false, 2_000).unwrap();
        db.create_session("s3", "u1", false, 3_000).unwrap();

        assert!(db.delete_session("s3").unwrap());
        assert!(!db.delete_session("s3").unwrap());

        assert_eq!(db.prune_expired_sessions(1_500).unwrap(), 1);
        let live = db.get_live_session("s2", 1_500).unwrap().unwrap();
        assert_eq!(live.user_id, "u1");
        assert!(!live.remember);
    }
}
