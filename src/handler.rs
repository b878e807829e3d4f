//! Callback handling for inbound chat messages.
//!
//! The webhook acknowledges an event right away; the exchange with the
//! completion API and the reply delivery run on a detached task.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ConversationConfig;
use crate::context::ConversationContext;
use crate::lark::{IncomingMessage, ReplyDispatcher};
use crate::llm::CompletionGateway;
use crate::services::{MessageStore, SessionStore};

/// What a handled message turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The close command was received; the fixed reply was sent (if non-empty).
    SessionClosed,
    /// The model answered and the reply was delivered.
    Replied { reply: String },
    /// The model answered with nothing; nothing was sent.
    EmptyReply,
}

pub struct CallbackHandler {
    context: ConversationContext,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    completion: Arc<dyn CompletionGateway>,
    dispatcher: Arc<dyn ReplyDispatcher>,
    conversation: ConversationConfig,
}

impl CallbackHandler {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        completion: Arc<dyn CompletionGateway>,
        dispatcher: Arc<dyn ReplyDispatcher>,
        conversation: ConversationConfig,
    ) -> Self {
        Self {
            context: ConversationContext::new(sessions.clone(), messages.clone()),
            sessions,
            messages,
            completion,
            dispatcher,
            conversation,
        }
    }

    /// Schedules the turn for `message` and returns without waiting for it.
    pub fn on_message_received(self: &Arc<Self>, message: IncomingMessage) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        let span = info_span!("turn", event_id = %message.event_id, user = %message.open_id);

        spawn_detached(
            "message turn",
            async move {
                match handler.handle_message(&message).await {
                    Ok(outcome) => info!("Turn finished: {:?}", outcome),
                    Err(e) => error!("Turn for user {} dropped: {:#}", message.open_id, e),
                }
            }
            .instrument(span),
        )
    }

    /// Greets a user who opened the one-to-one chat, when enabled.
    pub fn on_p2p_chat_entered(self: &Arc<Self>, open_id: String) -> Option<JoinHandle<()>> {
        let greeting = self.conversation.enter_event_reply.clone();
        if !self.conversation.enable_enter_event || greeting.trim().is_empty() {
            return None;
        }

        let handler = Arc::clone(self);
        Some(spawn_detached("enter greeting", async move {
            if let Err(e) = handler.dispatcher.send_text(&open_id, &greeting).await {
                error!("Failed to greet user {}: {:#}", open_id, e);
            }
        }))
    }

    pub async fn handle_message(&self, message: &IncomingMessage) -> anyhow::Result<TurnOutcome> {
        if message.text == self.conversation.close_session_flag {
            return self.close_session(message).await;
        }
        self.answer(message).await
    }

    async fn close_session(&self, message: &IncomingMessage) -> anyhow::Result<TurnOutcome> {
        self.sessions
            .close_session(&message.open_id)
            .await
            .map_err(|e| anyhow::anyhow!("close session failed: {}", e))?;

        let reply = &self.conversation.close_session_reply;
        if reply.trim().is_empty() {
            info!("Session closed for {}, no close reply configured", message.open_id);
        } else {
            self.dispatcher
                .send_text(&message.open_id, reply)
                .await
                .map_err(|e| anyhow::anyhow!("send close reply failed: {}", e))?;
        }
        Ok(TurnOutcome::SessionClosed)
    }

    async fn answer(&self, message: &IncomingMessage) -> anyhow::Result<TurnOutcome> {
        let user_id = message.open_id.as_str();
        let resolved = self
            .context
            .resolve_session_and_prompt(
                user_id,
                &message.text,
                self.conversation.session_turns,
                self.conversation.max_prompt_chars,
            )
            .await;

        let session = match resolved.session {
            Some(session) => session,
            None => self.sessions.create_session(user_id).await?,
        };

        let query = self
            .messages
            .create_message(Some(&session), user_id, &message.app_id, &message.text)
            .await?;

        tracing::debug!("Prompt for {}: {:?}", user_id, resolved.prompt);
        let reply = self
            .completion
            .complete(&resolved.prompt, user_id, &message.app_id)
            .await
            .map_err(|e| anyhow::anyhow!("completion failed: {}", e))?;

        if reply.is_empty() {
            warn!("Empty completion for user {}, nothing sent", user_id);
            return Ok(TurnOutcome::EmptyReply);
        }

        self.messages
            .create_reply_message(Some(&session), &message.app_id, user_id, &reply, &query)
            .await?;

        self.dispatcher
            .send_text(user_id, &reply)
            .await
            .map_err(|e| anyhow::anyhow!("send reply failed: {}", e))?;

        Ok(TurnOutcome::Replied { reply })
    }
}

/// Spawns `fut` so that a panic inside it is logged instead of propagated.
///
/// The returned handle resolves once the work is over, whether it finished or panicked.
pub fn spawn_detached<F>(label: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let work = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = work.await {
            if e.is_panic() {
                error!("Recovered from panic in {}: {}", label, e);
            } else {
                warn!("{} was cancelled", label);
            }
        }
    })
}
