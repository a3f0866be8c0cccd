//! Operator notifications.
//!
//! [`Notifier`] is the capability the recovery middleware reports panics
//! through. [`telegram::TelegramClient`] implements it on top of the
//! Telegram Bot API.

use async_trait::async_trait;
use serde::Serialize;

pub mod telegram;

/// Text formatting applied by the receiving chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseMode {
    #[serde(rename = "HTML")]
    Html,
    MarkdownV2,
    Markdown,
}

/// A message to deliver to a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendMessageRequest {
    pub chat_id: i64,
    pub text: String,
    pub parse_mode: ParseMode,
}

impl SendMessageRequest {
    pub fn html(chat_id: i64, text: impl Into<String>) -> Self {
        SendMessageRequest {
            chat_id,
            text: text.into(),
            parse_mode: ParseMode::Html,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to send message: {0}")]
    Http(#[from] reqwest::Error),
    #[error("message rejected: {description}")]
    Api { description: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, request: SendMessageRequest) -> Result<(), NotifyError>;
}
