use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

const SCHEMA_VERSION: i64 = 1;

pub fn run(conn: &Connection) -> Result<()> {
    let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            email       TEXT NOT NULL UNIQUE,
            name        TEXT NOT NULL,
            avatar_url  TEXT,
            bio         TEXT,
            status      TEXT NOT NULL DEFAULT 'offline',
            last_seen   TEXT,
            created_at  TEXT NOT NULL
        );

        -- pair_key is the two participant ids sorted and joined, so the
        -- unordered pair maps to exactly one row.
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            user_a          TEXT NOT NULL,
            user_b          TEXT NOT NULL,
            pair_key        TEXT NOT NULL UNIQUE,
            latest_text     TEXT,
            latest_sender   TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            CHECK (user_a <> user_b)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user_a
            ON conversations(user_a, updated_at);
        CREATE INDEX IF NOT EXISTS idx_conversations_user_b
            ON conversations(user_b, updated_at);

        -- seq gives the append order observed by the store.
        CREATE TABLE IF NOT EXISTS messages (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
            id                  TEXT NOT NULL UNIQUE,
            conversation_id     TEXT NOT NULL REFERENCES conversations(id),
            sender_id           TEXT NOT NULL,
            kind                TEXT NOT NULL,
            text                TEXT,
            image_url           TEXT,
            image_storage_id    TEXT,
            seen                INTEGER NOT NULL DEFAULT 0,
            seen_at             TEXT,
            created_at          TEXT NOT NULL,
            client_id           TEXT,
            CHECK (text IS NOT NULL OR image_url IS NOT NULL)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);
        CREATE INDEX IF NOT EXISTS idx_messages_unseen
            ON messages(conversation_id, seen, sender_id);
        ",
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    info!("Database migrations complete (schema v{})", SCHEMA_VERSION);
    Ok(())
}
