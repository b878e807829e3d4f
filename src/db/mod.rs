use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use crate::config::Config;
use tracing::{info, debug};

mod schema;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: i64,
    pub user_id: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
    /// Soft-delete marker, 0 while the row is live
    pub deleted_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: Option<i64>,
    pub from_user_id: String,
    pub to_user_id: String,
    pub content: String,
    /// The paired query or reply
    pub spouse_id: Option<i64>,
    pub created_at: String,
}

const SESSION_COLUMNS: &str = "id, user_id, status, created_at, updated_at, deleted_at";
const MESSAGE_COLUMNS: &str =
    "id, session_id, from_user_id, to_user_id, content, spouse_id, created_at";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(database_url: &str) -> anyhow::Result<Self> {
        if database_url != ":memory:" {
            if let Some(parent) = Path::new(database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(database_url)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection mutex poisoned"))
    }

    /// Runs a synchronous database closure on the blocking pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow::anyhow!("database task failed: {}", e))?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Sessions ---

    /// Most recently created open session of `user_id`, if any.
    pub fn get_latest_active_session(&self, user_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let conn = self.conn()?;
        let session = latest_active_session(&conn, user_id)?;
        Ok(session)
    }

    /// Opens a session for `user_id`, or returns the one that is already open.
    ///
    /// The lookup and the insert share a transaction, and the partial unique
    /// index on open sessions rejects any second open row for the same user.
    pub fn create_session(&self, user_id: &str) -> anyhow::Result<SessionRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some(existing) = latest_active_session(&tx, user_id)? {
            tx.commit()?;
            debug!("Database: Reusing open session {} for user {}", existing.id, user_id);
            return Ok(existing);
        }

        let now = now_timestamp();
        tx.execute(
            "INSERT INTO sessions (user_id, status, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?3, 0)",
            (user_id, true, &now),
        )?;
        let id = tx.last_insert_rowid();
        let session = tx.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            [id],
            session_from_row,
        )?;
        tx.commit()?;

        debug!("Database: Created session {} for user {}", session.id, user_id);
        Ok(session)
    }

    /// Marks every open session of `user_id` as closed. Returns the number of rows closed.
    pub fn close_sessions(&self, user_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE sessions SET status = ?1, updated_at = ?2
             WHERE user_id = ?3 AND status = 1 AND deleted_at = 0",
            (false, now_timestamp(), user_id),
        )?;
        Ok(count)
    }

    /// Hides a session from every lookup. Not reached from the webhook flow.
    pub fn soft_delete_session(&self, session_id: i64) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE sessions SET deleted_at = ?1, updated_at = ?2
             WHERE id = ?3 AND deleted_at = 0",
            (chrono::Utc::now().timestamp(), now_timestamp(), session_id),
        )?;
        Ok(count)
    }

    // --- Messages ---

    pub fn create_message(
        &self,
        session_id: Option<i64>,
        from_user_id: &str,
        to_user_id: &str,
        content: &str,
    ) -> anyhow::Result<MessageRecord> {
        debug!("Database: Saving message from {} to {} in session {:?}", from_user_id, to_user_id, session_id);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (session_id, from_user_id, to_user_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (session_id, from_user_id, to_user_id, content, now_timestamp()),
        )?;
        let id = conn.last_insert_rowid();
        let message = conn.query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            [id],
            message_from_row,
        )?;
        Ok(message)
    }

    /// Stores a reply and links it with `in_reply_to` in both directions.
    ///
    /// Fails if the original message does not exist or already has a spouse.
    pub fn create_reply_message(
        &self,
        session_id: Option<i64>,
        from_user_id: &str,
        to_user_id: &str,
        content: &str,
        in_reply_to: i64,
    ) -> anyhow::Result<MessageRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<Option<i64>> = tx
            .query_row(
                "SELECT spouse_id FROM messages WHERE id = ?1",
                [in_reply_to],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            None => anyhow::bail!("message {} does not exist", in_reply_to),
            Some(Some(spouse)) => {
                anyhow::bail!("message {} is already answered by {}", in_reply_to, spouse)
            }
            Some(None) => {}
        }

        tx.execute(
            "INSERT INTO messages (session_id, from_user_id, to_user_id, content, spouse_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (session_id, from_user_id, to_user_id, content, in_reply_to, now_timestamp()),
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE messages SET spouse_id = ?1 WHERE id = ?2 AND spouse_id IS NULL",
            (id, in_reply_to),
        )?;
        let message = tx.query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            [id],
            message_from_row,
        )?;
        tx.commit()?;

        debug!("Database: Saved reply {} to message {}", id, in_reply_to);
        Ok(message)
    }

    #[cfg(test)]
    pub(crate) fn get_message(&self, message_id: i64) -> anyhow::Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        let message = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                [message_id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Answered messages sent by `user_id` in a session, newest first, at most `limit`.
    pub fn list_latest_queries_with_spouse(
        &self,
        session_id: i64,
        user_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE session_id = ?1 AND from_user_id = ?2 AND spouse_id IS NOT NULL
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map((session_id, user_id, limit as i64), message_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Linked messages sent to `user_id` in a session.
    pub fn list_replies_with_spouse(
        &self,
        session_id: i64,
        user_id: &str,
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE session_id = ?1 AND to_user_id = ?2 AND spouse_id IS NOT NULL",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map((session_id, user_id), message_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

fn latest_active_session(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<SessionRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sessions
             WHERE user_id = ?1 AND status = 1 AND deleted_at = 0
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            SESSION_COLUMNS
        ),
        [user_id],
        session_from_row,
    )
    .optional()
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        active: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        deleted_at: row.get(5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        from_user_id: row.get(2)?,
        to_user_id: row.get(3)?,
        content: row.get(4)?,
        spouse_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// UTC with millisecond precision; lexicographic order matches time order.
fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
