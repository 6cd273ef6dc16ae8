//! Chat transport contract and wire types.
//!
//! The controller is written against [`ChatApi`] so the conversation
//! logic never touches the network; the long-polling HTTP driver in
//! [`http`](super::http) and the scripted transport in
//! [`mock`](super::mock) both implement it. The wire types mirror the
//! Bot-API JSON the polling driver receives.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Inline keyboard attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyboard {
    /// Button rows, top to bottom.
    #[serde(rename = "inline_keyboard")]
    pub rows: Vec<Vec<KeyboardButton>>,
}

impl Keyboard {
    /// Build a keyboard from rows of buttons.
    pub fn new(rows: Vec<Vec<KeyboardButton>>) -> Self {
        Self { rows }
    }

    /// Flatten the button labels, row by row. Test helper for keyboard
    /// layout assertions.
    pub fn labels(&self) -> Vec<&str> {
        self.rows
            .iter()
            .flatten()
            .map(|b| b.text.as_str())
            .collect()
    }
}

/// One tappable button: a visible label and an opaque callback payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardButton {
    /// Visible label.
    pub text: String,
    /// Payload echoed back in the callback query.
    #[serde(rename = "callback_data")]
    pub data: String,
}

impl KeyboardButton {
    /// Build a button.
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

/// An incoming update: either a message or a callback query.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatUpdate {
    /// Monotonically increasing update identifier.
    pub update_id: i64,
    /// Present for plain text messages and commands.
    #[serde(default)]
    pub message: Option<ChatMessage>,
    /// Present when a keyboard button was tapped.
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

/// An incoming message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    /// Message identifier within its chat.
    pub message_id: i64,
    /// The chat the message was posted in.
    pub chat: ChatRef,
    /// Sender; absent for channel posts.
    #[serde(default)]
    pub from: Option<ChatUser>,
    /// Text content.
    #[serde(default)]
    pub text: Option<String>,
}

/// Reference to a chat.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChatRef {
    /// Chat identifier.
    pub id: i64,
}

/// A chat user.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatUser {
    /// User identifier.
    pub id: i64,
    /// Handle checked against the allowlist.
    #[serde(default)]
    pub username: Option<String>,
}

/// A keyboard button tap.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    /// Query identifier, acknowledged via `answer_callback`.
    pub id: String,
    /// The tapping user.
    pub from: ChatUser,
    /// The message carrying the keyboard.
    #[serde(default)]
    pub message: Option<ChatMessage>,
    /// The tapped button's payload.
    #[serde(default)]
    pub data: Option<String>,
}

/// Transport used by the chat controller.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Long-poll for updates with `update_id >= offset`.
    async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<ChatUpdate>>;

    /// Send a text message, optionally with an inline keyboard.
    /// Returns the new message's identifier.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i64>;

    /// Replace or remove (with `None`) the keyboard of a sent message.
    async fn edit_reply_markup(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: Option<&Keyboard>,
    ) -> Result<()>;

    /// Acknowledge a callback query so the client stops its spinner.
    async fn answer_callback(&self, callback_id: &str) -> Result<()>;
}
