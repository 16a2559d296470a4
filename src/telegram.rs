// =============================================================================
// Telegram Bot API Client — sendMessage / pinChatMessage / unpinChatMessage
// =============================================================================
//
// SECURITY: The bot token is part of the URL path and is never logged or
// serialized. Debug output redacts it.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::dispatcher::Messenger;

/// Telegram Bot API client bound to a single chat (supergroup).
#[derive(Clone)]
pub struct TelegramClient {
    bot_token: String,
    chat_id: i64,
    base_url: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(bot_token: impl Into<String>, chat_id: i64) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            bot_token: bot_token.into(),
            chat_id,
            base_url: "https://api.telegram.org".to_string(),
            client,
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.bot_token, method)
    }

    /// POST one Bot API method and return the parsed response body.
    async fn call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {method} request failed"))?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {method} response"))?;

        if !status.is_success() || payload["ok"] != true {
            anyhow::bail!(
                "Telegram {method} returned {}: {}",
                status,
                payload["description"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(payload)
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    /// POST /sendMessage. Returns the platform message id.
    #[instrument(skip(self, text), name = "telegram::send_message")]
    async fn send_message(
        &self,
        text: &str,
        thread_id: i64,
        disable_notification: bool,
    ) -> Result<i64> {
        let payload = self
            .call(
                "sendMessage",
                serde_json::json!({
                    "chat_id": self.chat_id,
                    "message_thread_id": thread_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_notification": disable_notification,
                }),
            )
            .await?;

        let message_id = payload["result"]["message_id"]
            .as_i64()
            .context("sendMessage response missing result.message_id")?;
        debug!(message_id, thread_id, "message sent");
        Ok(message_id)
    }

    /// POST /pinChatMessage.
    #[instrument(skip(self), name = "telegram::pin_message")]
    async fn pin_message(&self, message_id: i64) -> Result<()> {
        self.call(
            "pinChatMessage",
            serde_json::json!({
                "chat_id": self.chat_id,
                "message_id": message_id,
                "disable_notification": true,
            }),
        )
        .await?;
        debug!(message_id, "message pinned");
        Ok(())
    }

    /// POST /unpinChatMessage.
    #[instrument(skip(self), name = "telegram::unpin_message")]
    async fn unpin_message(&self, message_id: i64) -> Result<()> {
        self.call(
            "unpinChatMessage",
            serde_json::json!({
                "chat_id": self.chat_id,
                "message_id": message_id,
            }),
        )
        .await?;
        debug!(message_id, "message unpinned");
        Ok(())
    }
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_bot_token() {
        let client = TelegramClient::new("123456:SECRET", -100_1234);
        let debug = format!("{client:?}");
        assert!(!debug.contains("SECRET"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn method_urls_embed_token_and_method() {
        let client =
            TelegramClient::new("123:abc", -1).with_base_url("http://localhost:9999");
        assert_eq!(
            client.method_url("sendMessage"),
            "http://localhost:9999/bot123:abc/sendMessage"
        );
    }
}
