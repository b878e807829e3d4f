//! Conversation context for a stateless completion API
//!
//! Resolves the user's open session and replays its most recent answered turns
//! as a `Q:`/`A:` transcript ending in the new, unanswered question.

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::db::SessionRecord;
use crate::services::{MessageStore, SessionStore, Turn};

/// Result of context assembly for one incoming message.
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    /// The open session, or `None` when the caller has to create one
    pub session: Option<SessionRecord>,
    pub prompt: String,
}

pub struct ConversationContext {
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
}

impl ConversationContext {
    pub fn new(sessions: Arc<dyn SessionStore>, messages: Arc<dyn MessageStore>) -> Self {
        Self { sessions, messages }
    }

    /// Builds the prompt for `incoming` and reports the user's open session.
    ///
    /// Never creates a session. Storage failures degrade to a prompt without
    /// history: a failed session lookup is reported as "no session", a failed
    /// history read keeps the session but drops the replayed turns.
    pub async fn resolve_session_and_prompt(
        &self,
        user_id: &str,
        incoming: &str,
        turn_limit: usize,
        max_prompt_chars: usize,
    ) -> ResolvedContext {
        let session = match self.sessions.find_active_session(user_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Session lookup failed for user {}, continuing without history: {}", user_id, e);
                None
            }
        };

        let turns = match &session {
            Some(session) => match self
                .messages
                .list_recent_answered_messages(session.id, user_id, turn_limit)
                .await
            {
                Ok(turns) => turns,
                Err(e) => {
                    error!(
                        "History lookup failed for session {} of user {}: {}",
                        session.id, user_id, e
                    );
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let prompt = truncate_to_last_chars(render_prompt(&turns, incoming), max_prompt_chars);
        debug!(
            "Prompt for user {} built from {} turn(s), {} chars",
            user_id,
            turns.len(),
            prompt.chars().count()
        );

        ResolvedContext { session, prompt }
    }
}

/// Renders turns as alternating `Q:`/`A:` lines, followed by the open question.
pub fn render_prompt(turns: &[Turn], incoming: &str) -> String {
    let mut prompt = String::new();
    for turn in turns {
        prompt.push_str(&format!("Q: {}\n", turn.query.content));
        prompt.push_str(&format!("A: {}\n", turn.reply.content));
    }
    prompt.push_str(&format!("Q: {}\nA: ", incoming));
    prompt
}

/// Keeps the trailing `max_chars` code points of `text`.
pub fn truncate_to_last_chars(text: String, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }

    let start = text
        .char_indices()
        .nth(count - max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    text[start..].to_string()
}
