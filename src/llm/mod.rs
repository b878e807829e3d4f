pub mod client;

pub use client::{CompletionGateway, LlmClient};
