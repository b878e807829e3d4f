//! Lark/Feishu adapter.
//!
//! Decodes event callbacks (including AES-encrypted ones) and sends text
//! replies through the Open Platform messaging API.

pub mod client;
pub mod event;

pub use client::{LarkClient, ReplyDispatcher};
pub use event::{EventDecoder, IncomingMessage, LarkEvent};

#[derive(Debug, thiserror::Error)]
pub enum LarkError {
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
    #[error("failed to decrypt event: {0}")]
    Decrypt(String),
    #[error("verification token mismatch")]
    TokenMismatch,
    #[error("lark api error ({code}): {msg}")]
    Api { code: i64, msg: String },
    #[error("lark request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type LarkResult<T> = Result<T, LarkError>;
