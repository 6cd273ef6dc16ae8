//! Long-polling HTTP driver for the chat transport.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::api::{ChatApi, ChatMessage, ChatUpdate, Keyboard};
use crate::error::{Error, Result};

// Extra headroom on top of the long-poll timeout before the HTTP
// request itself is abandoned.
const REQUEST_MARGIN: Duration = Duration::from_secs(10);

/// Bot-API HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

impl HttpChatApi {
    /// Build a transport for the given bot token against the public
    /// Bot API endpoint.
    pub fn new(token: &str) -> Self {
        Self::with_base_url(format!("https://api.telegram.org/bot{token}"))
    }

    /// Build a transport against an explicit base URL.
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}/{method}", self.base_url);
        debug!(method, "chat api call");
        let response = self
            .client
            .post(&url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::chat(format!("{method} request failed: {e}")))?;
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| Error::chat(format!("{method} returned malformed JSON: {e}")))?;
        if !envelope.ok {
            let description = envelope.description.unwrap_or_else(|| "no description".into());
            return Err(Error::chat(format!("{method} rejected: {description}")));
        }
        envelope
            .result
            .ok_or_else(|| Error::chat(format!("{method} returned no result")))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<ChatUpdate>> {
        let payload = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
        });
        self.call("getUpdates", &payload, timeout + REQUEST_MARGIN)
            .await
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i64> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = serde_json::to_value(keyboard)?;
        }
        let message: ChatMessage = self
            .call("sendMessage", &payload, REQUEST_MARGIN)
            .await?;
        Ok(message.message_id)
    }

    async fn edit_reply_markup(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: Option<&Keyboard>,
    ) -> Result<()> {
        let mut payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
        });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = serde_json::to_value(keyboard)?;
        }
        // The API answers with either the edited message or a bare
        // `true`; neither carries anything we need.
        let _: serde_json::Value = self
            .call("editMessageReplyMarkup", &payload, REQUEST_MARGIN)
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let payload = json!({ "callback_query_id": callback_id });
        let _: serde_json::Value = self
            .call("answerCallbackQuery", &payload, REQUEST_MARGIN)
            .await?;
        Ok(())
    }
}
