use async_trait::async_trait;
use tracing::info;

use crate::db::{Database, SessionRecord};
use crate::services::SessionStore;

pub struct SessionService {
    db: Database,
}

impl SessionService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SessionService {
    async fn find_active_session(&self, user_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let user_id = user_id.to_string();
        self.db
            .run_blocking(move |db| db.get_latest_active_session(&user_id))
            .await
    }

    async fn create_session(&self, user_id: &str) -> anyhow::Result<SessionRecord> {
        let user_id = user_id.to_string();
        let session = self
            .db
            .run_blocking(move |db| db.create_session(&user_id))
            .await?;
        info!("Session {} open for user {}", session.id, session.user_id);
        Ok(session)
    }

    async fn close_session(&self, user_id: &str) -> anyhow::Result<()> {
        let user_id_query = user_id.to_string();
        let closed = self
            .db
            .run_blocking(move |db| db.close_sessions(&user_id_query))
            .await?;
        info!("Closed {} session(s) for user {}", closed, user_id);
        Ok(())
    }
}
