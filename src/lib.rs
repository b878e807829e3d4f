pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod handler;
pub mod lark;
pub mod llm;
pub mod server;
pub mod services;

use std::sync::Arc;

/// Shared state behind the webhook routes
pub struct AppState {
    pub handler: Arc<handler::CallbackHandler>,
    pub decoder: lark::EventDecoder,
    pub seen_events: cache::SeenEvents,
}

impl AppState {
    /// Wires the production collaborators: SQLite stores, OpenAI, Lark.
    pub fn new(config: &config::Config, db: db::Database) -> Arc<Self> {
        let handler = handler::CallbackHandler::new(
            Arc::new(services::SessionService::new(db.clone())),
            Arc::new(services::MessageService::new(db)),
            Arc::new(llm::LlmClient::new(config)),
            Arc::new(lark::LarkClient::from_config(config)),
            config.conversation.clone(),
        );
        Arc::new(Self {
            handler: Arc::new(handler),
            decoder: lark::EventDecoder::new(
                config.lark_verification_token.clone(),
                config.lark_encrypt_key.clone(),
            ),
            seen_events: cache::SeenEvents::new(config.event_dedup_capacity),
        })
    }
}
