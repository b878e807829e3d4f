//! Storage-facing services and the narrow store interfaces the conversation
//! core depends on.

use async_trait::async_trait;

use crate::db::{MessageRecord, SessionRecord};

pub mod message;
pub mod session;

pub use message::{MessageService, Turn};
pub use session::SessionService;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Latest open session for the user; `Ok(None)` when there is none.
    async fn find_active_session(&self, user_id: &str) -> anyhow::Result<Option<SessionRecord>>;
    async fn create_session(&self, user_id: &str) -> anyhow::Result<SessionRecord>;
    async fn close_session(&self, user_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(
        &self,
        session: Option<&SessionRecord>,
        from_user_id: &str,
        to_user_id: &str,
        content: &str,
    ) -> anyhow::Result<MessageRecord>;

    async fn create_reply_message(
        &self,
        session: Option<&SessionRecord>,
        from_user_id: &str,
        to_user_id: &str,
        content: &str,
        in_reply_to: &MessageRecord,
    ) -> anyhow::Result<MessageRecord>;

    /// Up to `limit` answered turns of the user in the session, oldest first.
    async fn list_recent_answered_messages(
        &self,
        session_id: i64,
        user_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Turn>>;
}
