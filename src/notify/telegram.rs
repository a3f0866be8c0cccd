use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Notifier, NotifyError, SendMessageRequest};

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

/// Sends messages through the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        TelegramClient {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
        }
    }

    /// Points the client at a different Bot API server, e.g. a self-hosted
    /// one.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }
}

#[async_trait]
impl Notifier for TelegramClient {
    async fn send_message(&self, request: SendMessageRequest) -> Result<(), NotifyError> {
        // The method url embeds the token, keep it out of errors.
        let response: ApiResponse = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&request)
            .send()
            .await
            .map_err(reqwest::Error::without_url)?
            .json()
            .await
            .map_err(reqwest::Error::without_url)?;

        if response.ok {
            Ok(())
        } else {
            Err(NotifyError::Api {
                description: response
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }
}
