use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                  TEXT PRIMARY KEY,
            username            TEXT UNIQUE,
            email               TEXT UNIQUE,
            phone               TEXT,
            name                TEXT,
            avatar_url          TEXT,
            password            TEXT,
            oauth_provider      TEXT,
            oauth_provider_id   TEXT,
            created_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE(oauth_provider, oauth_provider_id),
            CHECK (username IS NOT NULL OR email IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            remember    INTEGER NOT NULL DEFAULT 0,
            expires_at  INTEGER NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_expiry
            ON sessions(expires_at);

        CREATE TABLE IF NOT EXISTS chats (
            id              TEXT PRIMARY KEY,
            name            TEXT,
            is_group        INTEGER NOT NULL,
            avatar_url      TEXT,
            created_by      TEXT REFERENCES users(id) ON DELETE SET NULL,
            direct_key      TEXT UNIQUE,
            last_message_id TEXT,
            last_seq        INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            CHECK (is_group = 1 OR direct_key IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS chat_members (
            chat_id         TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            is_admin        INTEGER NOT NULL DEFAULT 0,
            delivered_seq   INTEGER NOT NULL DEFAULT 0,
            read_seq        INTEGER NOT NULL DEFAULT 0,
            joined_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_chat_members_user
            ON chat_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            sender_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            seq         INTEGER NOT NULL,
            content     TEXT NOT NULL,
            kind        TEXT NOT NULL DEFAULT 'text',
            reply_to    TEXT REFERENCES messages(id),
            client_id   TEXT,
            created_at  TEXT NOT NULL,
            UNIQUE(chat_id, seq),
            UNIQUE(chat_id, sender_id, client_id)
        );

        CREATE TABLE IF NOT EXISTS message_hidden (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
