use async_trait::async_trait;
use std::collections::HashMap;

use crate::db::{Database, MessageRecord, SessionRecord};
use crate::services::MessageStore;

/// One answered exchange: the user's query and the reply linked to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub query: MessageRecord,
    pub reply: MessageRecord,
}

pub struct MessageService {
    db: Database,
}

impl MessageService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Matches queries with their replies and returns the complete turns oldest first.
///
/// Queries with no reply in `replies` are dropped.
pub fn pair_turns(mut queries: Vec<MessageRecord>, replies: Vec<MessageRecord>) -> Vec<Turn> {
    let mut reply_by_query: HashMap<i64, MessageRecord> = replies
        .into_iter()
        .filter_map(|reply| reply.spouse_id.map(|query_id| (query_id, reply)))
        .collect();

    queries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    queries
        .into_iter()
        .filter_map(|query| {
            reply_by_query
                .remove(&query.id)
                .map(|reply| Turn { query, reply })
        })
        .collect()
}

#[async_trait]
impl MessageStore for MessageService {
    async fn create_message(
        &self,
        session: Option<&SessionRecord>,
        from_user_id: &str,
        to_user_id: &str,
        content: &str,
    ) -> anyhow::Result<MessageRecord> {
        let session_id = session.map(|s| s.id);
        let from_user_id = from_user_id.to_string();
        let to_user_id = to_user_id.to_string();
        let content = content.to_string();
        self.db
            .run_blocking(move |db| db.create_message(session_id, &from_user_id, &to_user_id, &content))
            .await
            .map_err(|e| anyhow::anyhow!("Create message failed: {}", e))
    }

    async fn create_reply_message(
        &self,
        session: Option<&SessionRecord>,
        from_user_id: &str,
        to_user_id: &str,
        content: &str,
        in_reply_to: &MessageRecord,
    ) -> anyhow::Result<MessageRecord> {
        let session_id = session.map(|s| s.id);
        let from_user_id = from_user_id.to_string();
        let to_user_id = to_user_id.to_string();
        let content = content.to_string();
        let in_reply_to = in_reply_to.id;
        self.db
            .run_blocking(move |db| {
                db.create_reply_message(session_id, &from_user_id, &to_user_id, &content, in_reply_to)
            })
            .await
            .map_err(|e| anyhow::anyhow!("Create reply message failed: {}", e))
    }

    async fn list_recent_answered_messages(
        &self,
        session_id: i64,
        user_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Turn>> {
        let user_id = user_id.to_string();
        let (queries, replies) = self
            .db
            .run_blocking(move |db| {
                let queries = db
                    .list_latest_queries_with_spouse(session_id, &user_id, limit)
                    .map_err(|e| anyhow::anyhow!("query messages failed: {}", e))?;
                let replies = db
                    .list_replies_with_spouse(session_id, &user_id)
                    .map_err(|e| anyhow::anyhow!("query reply messages failed: {}", e))?;
                Ok((queries, replies))
            })
            .await?;

        Ok(pair_turns(queries, replies))
    }
}
