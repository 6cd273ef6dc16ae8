//! Scripted in-memory chat transport for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::api::{
    CallbackQuery, ChatApi, ChatMessage, ChatRef, ChatUpdate, ChatUser, Keyboard,
};
use crate::error::Result;

/// A message recorded by [`MockChatApi::send_message`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Destination chat.
    pub chat_id: i64,
    /// Message text.
    pub text: String,
    /// Attached keyboard, if any.
    pub keyboard: Option<Keyboard>,
}

/// A reply-markup edit recorded by [`MockChatApi::edit_reply_markup`].
#[derive(Debug, Clone)]
pub struct MarkupEdit {
    /// Target chat.
    pub chat_id: i64,
    /// Target message.
    pub message_id: i64,
    /// The new keyboard; `None` means the keyboard was removed.
    pub keyboard: Option<Keyboard>,
}

/// In-memory [`ChatApi`]: updates are queued by the test, outgoing
/// traffic is recorded for assertions.
#[derive(Debug, Default)]
pub struct MockChatApi {
    incoming: Mutex<VecDeque<ChatUpdate>>,
    sent: Mutex<Vec<SentMessage>>,
    edits: Mutex<Vec<MarkupEdit>>,
    answered: Mutex<Vec<String>>,
    next_message_id: AtomicI64,
}

impl MockChatApi {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an update for the next `get_updates` call.
    pub fn push_update(&self, update: ChatUpdate) {
        self.incoming.lock().push_back(update);
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// The most recently sent message.
    pub fn last_sent(&self) -> Option<SentMessage> {
        self.sent.lock().last().cloned()
    }

    /// All reply-markup edits so far.
    pub fn edits(&self) -> Vec<MarkupEdit> {
        self.edits.lock().clone()
    }

    /// Callback ids acknowledged so far.
    pub fn answered(&self) -> Vec<String> {
        self.answered.lock().clone()
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<ChatUpdate>> {
        let pending: Vec<ChatUpdate> = {
            let mut incoming = self.incoming.lock();
            let drained = incoming
                .iter()
                .filter(|u| u.update_id >= offset)
                .cloned()
                .collect();
            incoming.clear();
            drained
        };
        if pending.is_empty() {
            // Keep the polling loop from spinning while a test is idle.
            tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
        }
        Ok(pending)
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i64> {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sent.lock().push(SentMessage {
            chat_id,
            text: text.to_string(),
            keyboard: keyboard.cloned(),
        });
        Ok(id)
    }

    async fn edit_reply_markup(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: Option<&Keyboard>,
    ) -> Result<()> {
        self.edits.lock().push(MarkupEdit {
            chat_id,
            message_id,
            keyboard: keyboard.cloned(),
        });
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        self.answered.lock().push(callback_id.to_string());
        Ok(())
    }
}

/// Build a text-message update.
pub fn message_update(update_id: i64, username: &str, chat_id: i64, text: &str) -> ChatUpdate {
    ChatUpdate {
        update_id,
        message: Some(ChatMessage {
            message_id: update_id * 100,
            chat: ChatRef { id: chat_id },
            from: Some(user(username)),
            text: Some(text.to_string()),
        }),
        callback_query: None,
    }
}

/// Build a keyboard-tap update.
pub fn callback_update(update_id: i64, username: &str, chat_id: i64, data: &str) -> ChatUpdate {
    ChatUpdate {
        update_id,
        message: None,
        callback_query: Some(CallbackQuery {
            id: format!("cb-{update_id}"),
            from: user(username),
            message: Some(ChatMessage {
                message_id: update_id * 100,
                chat: ChatRef { id: chat_id },
                from: None,
                text: None,
            }),
            data: Some(data.to_string()),
        }),
    }
}

fn user(username: &str) -> ChatUser {
    // A stable fake numeric id derived from the handle keeps sessions
    // per-user without the tests having to track ids.
    let id = username
        .bytes()
        .fold(0i64, |acc, b| acc.wrapping_mul(31).wrapping_add(i64::from(b)));
    ChatUser {
        id,
        username: Some(username.to_string()),
    }
}
