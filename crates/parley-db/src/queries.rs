use crate::Database;
use crate::models::{ConversationRow, MessageRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};

const USER_COLUMNS: &str = "id, email, name, avatar_url, bio, status, last_seen, created_at";
const CONVERSATION_COLUMNS: &str =
    "id, user_a, user_b, latest_text, latest_sender, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, kind, text, image_url, \
     image_storage_id, seen, seen_at, created_at, client_id";

impl Database {
    // -- Users --

    /// Returns the user for `email`, creating it with `name` if absent.
    /// The flag is true when this call inserted the row.
    pub fn find_or_create_user(
        &self,
        id: &str,
        email: &str,
        name: &str,
        now: &str,
    ) -> Result<(UserRow, bool)> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, email, name, now],
            )?;
            let user = query_user(conn, "email", email)?
                .ok_or_else(|| anyhow::anyhow!("user vanished after upsert: {}", email))?;
            Ok((user, inserted == 1))
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<UserRow>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {USER_COLUMNS} FROM users WHERE id IN ({})",
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();
            let rows = stmt
                .query_map(params.as_slice(), user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Applies the provided fields; `None` leaves a column untouched.
    pub fn update_profile(
        &self,
        id: &str,
        name: Option<&str>,
        bio: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET
                    name = COALESCE(?2, name),
                    bio = COALESCE(?3, bio),
                    avatar_url = COALESCE(?4, avatar_url)
                 WHERE id = ?1",
                params![id, name, bio, avatar_url],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_user(conn, "id", id)
        })
    }

    pub fn list_users(&self, limit: u32, offset: u64) -> Result<(Vec<UserRow>, u64)> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC, id ASC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt
                .query_map(params![limit, offset as i64], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok((rows, total as u64))
        })
    }

    /// Case-insensitive substring match on name or email, excluding the caller.
    pub fn search_users(&self, query: &str, exclude_id: &str, limit: u32) -> Result<Vec<UserRow>> {
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE id <> ?2
                   AND (LOWER(name) LIKE ?1 ESCAPE '\\' OR email LIKE ?1 ESCAPE '\\')
                 ORDER BY name ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![pattern, exclude_id, limit], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Records a presence transition. Returns false when the user does not exist.
    pub fn set_presence(&self, id: &str, status: &str, last_seen: Option<&str>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET status = ?2, last_seen = COALESCE(?3, last_seen) WHERE id = ?1",
                params![id, status, last_seen],
            )?;
            Ok(changed == 1)
        })
    }

    // -- Conversations --

    /// Compare-and-create on the participant pair. Concurrent callers for the
    /// same pair in either order resolve to one row; the flag is true only
    /// for the caller whose insert won.
    pub fn create_or_get_conversation(
        &self,
        id: &str,
        user_a: &str,
        user_b: &str,
        pair_key: &str,
        now: &str,
    ) -> Result<(ConversationRow, bool)> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO conversations
                    (id, user_a, user_b, pair_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, user_a, user_b, pair_key, now],
            )?;
            let row = conn
                .query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE pair_key = ?1"),
                    [pair_key],
                    conversation_from_row,
                )
                .optional()?
                .ok_or_else(|| anyhow::anyhow!("conversation vanished after upsert: {}", pair_key))?;
            Ok((row, inserted == 1))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                    [id],
                    conversation_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// All conversations containing `user_id`, most recently updated first,
    /// each with the number of unseen messages authored by the counterpart.
    pub fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<(ConversationRow, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS},
                    (SELECT COUNT(*) FROM messages m
                      WHERE m.conversation_id = c.id
                        AND m.seen = 0
                        AND m.sender_id <> ?1) AS unseen
                 FROM conversations c
                 WHERE c.user_a = ?1 OR c.user_b = ?1
                 ORDER BY c.updated_at DESC, c.rowid DESC"
            ))?;
            let rows = stmt
                .query_map([user_id], |row| {
                    let unseen: i64 = row.get(7)?;
                    Ok((conversation_from_row(row)?, unseen as u64))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Appends a message and refreshes the conversation's latest-message
    /// summary in one transaction.
    pub fn insert_message(&self, message: &MessageRow, preview: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, ?8, ?9)"),
                params![
                    message.id,
                    message.conversation_id,
                    message.sender_id,
                    message.kind,
                    message.text,
                    message.image_url,
                    message.image_storage_id,
                    message.created_at,
                    message.client_id,
                ],
            )?;
            tx.execute(
                "UPDATE conversations
                 SET latest_text = ?2, latest_sender = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![
                    message.conversation_id,
                    preview,
                    message.sender_id,
                    message.created_at
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Flips every unseen message from the counterpart to seen, then returns
    /// the full history in append order. Already-seen rows keep their
    /// original `seen_at`. Also returns how many rows were flipped.
    pub fn mark_seen_and_list(
        &self,
        conversation_id: &str,
        reader_id: &str,
        now: &str,
    ) -> Result<(Vec<MessageRow>, usize)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let marked = tx.execute(
                "UPDATE messages SET seen = 1, seen_at = ?3
                 WHERE conversation_id = ?1 AND sender_id <> ?2 AND seen = 0",
                params![conversation_id, reader_id, now],
            )?;
            let rows = query_messages(&tx, conversation_id)?;
            tx.commit()?;
            Ok((rows, marked))
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1"))?;
    let row = stmt.query_row([value], user_from_row).optional()?;
    Ok(row)
}

fn query_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC"
    ))?;
    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender_id: row.get(2)?,
                kind: row.get(3)?,
                text: row.get(4)?,
                image_url: row.get(5)?,
                image_storage_id: row.get(6)?,
                seen: row.get::<_, i64>(7)? != 0,
                seen_at: row.get(8)?,
                created_at: row.get(9)?,
                client_id: row.get(10)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        avatar_url: row.get(3)?,
        bio: row.get(4)?,
        status: row.get(5)?,
        last_seen: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_a: row.get(1)?,
        user_b: row.get(2)?,
        latest_text: row.get(3)?,
        latest_sender: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
