//! Conversational control surface over a polling chat protocol.
//!
//! A user on the allowlist drives a task submission through a per-user
//! conversation: `/run` selects a task, an inline keyboard edits its
//! arguments, a confirmation step submits it. The conversation is a
//! finite-state machine over three states:
//!
//! | State        | Input                      | Next         |
//! |--------------|----------------------------|--------------|
//! | `AskTask`    | task chosen                | per `init`   |
//! | `AskArgs`    | arg chosen / value text    | `AskArgs`    |
//! | `AskArgs`    | `__run__`                  | `AskConfirm` |
//! | `AskConfirm` | `__yes__` / `__run__`      | submit, end  |
//! | `AskConfirm` | `__no__`                   | `AskConfirm` |
//! | `AskConfirm` | `__back__`                 | `AskArgs`    |
//! | `AskConfirm` | `__cancel__`               | end          |
//! | any          | `/cancel`                  | end          |
//!
//! Messages from users not on the allowlist drop the conversation
//! immediately and silently.

pub mod api;
pub mod http;
pub mod mock;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{ArgValue, Task};
use crate::error::Result;
use crate::manager::{RunObserver, Submission, TaskManager, TaskRun};
use api::{CallbackQuery, ChatApi, ChatMessage, ChatUpdate, ChatUser, Keyboard, KeyboardButton};

/// Callback payload: submit with the current arguments.
pub const CB_RUN: &str = "__run__";
/// Callback payload: confirm the submission.
pub const CB_YES: &str = "__yes__";
/// Callback payload: decline the confirmation prompt.
pub const CB_NO: &str = "__no__";
/// Callback payload: return to argument editing.
pub const CB_BACK: &str = "__back__";
/// Callback payload: drop the conversation.
pub const CB_CANCEL: &str = "__cancel__";

const POLL_TIMEOUT: Duration = Duration::from_secs(25);
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConversationState {
    AskTask,
    AskArgs,
    AskConfirm,
}

#[derive(Debug, Clone)]
struct Session {
    chat_id: i64,
    state: ConversationState,
    task: Option<Arc<Task>>,
    args: IndexMap<String, ArgValue>,
    pending_arg: Option<String>,
}

struct LoopHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Chat control surface with per-user conversation state.
pub struct ChatController {
    manager: Arc<TaskManager>,
    api: Arc<dyn ChatApi>,
    users: HashSet<String>,
    sessions: DashMap<i64, Session>,
    state: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for ChatController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatController")
            .field("users", &self.users.len())
            .field("sessions", &self.sessions.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ChatController {
    /// Build a controller over a transport and a user allowlist.
    pub fn new(
        manager: Arc<TaskManager>,
        chat_api: Arc<dyn ChatApi>,
        users: impl IntoIterator<Item = String>,
    ) -> Self {
        info!("TaskTelegramController initialized");
        Self {
            manager,
            api: chat_api,
            users: users.into_iter().collect(),
            sessions: DashMap::new(),
            state: Mutex::new(None),
        }
    }

    /// Whether the polling driver is currently running.
    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Start the polling driver. A second start is a no-op with a warning.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.is_some() {
            warn!("TaskTelegramController is already running");
            return;
        }
        let token = CancellationToken::new();
        let join = tokio::spawn(poll_loop(Arc::clone(self), token.clone()));
        *state = Some(LoopHandle { token, join });
        info!("TaskTelegramController is running");
    }

    /// Signal the polling driver and join it. Stopping a stopped
    /// controller is a no-op.
    pub async fn stop(&self) {
        let handle = self.state.lock().take();
        match handle {
            Some(LoopHandle { token, join }) => {
                token.cancel();
                if let Err(e) = join.await {
                    warn!("chat polling loop did not join cleanly: {e}");
                }
                info!("TaskTelegramController stopped");
            },
            None => info!("TaskTelegramController not running"),
        }
    }

    /// Feed one update through the allowlist and the conversation
    /// machine. This is the polling driver's entry point; tests call it
    /// directly with a [`mock`] transport.
    pub async fn handle_update(&self, update: ChatUpdate) -> Result<()> {
        if let Some(message) = update.message {
            let Some(user) = message.from.clone() else {
                return Ok(());
            };
            if !self.allowed(&user) {
                self.sessions.remove(&user.id);
                debug!(user = %user.id, "dropping update from unlisted user");
                return Ok(());
            }
            self.handle_message(&user, message).await;
        } else if let Some(callback) = update.callback_query {
            let user = callback.from.clone();
            if !self.allowed(&user) {
                self.sessions.remove(&user.id);
                debug!(user = %user.id, "dropping callback from unlisted user");
                return Ok(());
            }
            self.handle_callback(&user, callback).await;
        }
        Ok(())
    }

    fn allowed(&self, user: &ChatUser) -> bool {
        user.username
            .as_deref()
            .is_some_and(|name| self.users.contains(name))
    }

    async fn handle_message(&self, user: &ChatUser, message: ChatMessage) {
        let chat_id = message.chat.id;
        let Some(text) = message.text else { return };
        let text = text.trim().to_string();

        if let Some(rest) = text.strip_prefix('/') {
            let mut parts = rest.split_whitespace();
            match parts.next() {
                Some("cancel") => {
                    self.sessions.remove(&user.id);
                    self.send(chat_id, "Cancelled.", None).await;
                },
                Some("tasklist") => {
                    let names = self.manager.task_list();
                    let reply = if names.is_empty() {
                        "Empty tasklist!".to_string()
                    } else {
                        format!("Tasklist: {}", names.join(", "))
                    };
                    self.send(chat_id, &reply, None).await;
                },
                Some("run") => match parts.next() {
                    Some(name) => match self.manager.get_task(name) {
                        Some(task) => self.enter_task(user.id, chat_id, task).await,
                        None => {
                            self.ask_task(user.id, chat_id, Some("Task name not found."))
                                .await;
                        },
                    },
                    None => self.ask_task(user.id, chat_id, None).await,
                },
                other => debug!(command = ?other, "ignoring unknown chat command"),
            }
            return;
        }

        // Plain text is only meaningful as a value for the pending argument.
        let Some(mut session) = self.sessions.get(&user.id).map(|r| r.value().clone()) else {
            return;
        };
        if session.state != ConversationState::AskArgs {
            return;
        }
        let Some(arg_name) = session.pending_arg.clone() else {
            return;
        };
        let Some(task) = session.task.clone() else {
            return;
        };
        let Some(spec) = task.args.get(&arg_name) else {
            return;
        };

        match spec.arg_type.parse_literal(&text) {
            Ok(value) => {
                session.args.insert(arg_name, value);
                session.pending_arg = None;
                let keyboard = args_keyboard(&task, &session.args);
                self.sessions.insert(user.id, session);
                self.send(chat_id, &args_prompt(&task), Some(&keyboard)).await;
            },
            Err(_) => {
                self.send(
                    chat_id,
                    &format!("'{text}' is not a valid value for '{arg_name}'. Enter a new value."),
                    None,
                )
                .await;
            },
        }
    }

    async fn handle_callback(&self, user: &ChatUser, callback: CallbackQuery) {
        if let Err(e) = self.api.answer_callback(&callback.id).await {
            warn!("cannot acknowledge callback: {e}");
        }
        let Some(data) = callback.data else { return };
        let chat_id = callback
            .message
            .as_ref()
            .map(|m| m.chat.id)
            .or_else(|| self.sessions.get(&user.id).map(|r| r.value().chat_id));
        let Some(chat_id) = chat_id else { return };
        let Some(session) = self.sessions.get(&user.id).map(|r| r.value().clone()) else {
            return;
        };

        match session.state {
            ConversationState::AskTask => match self.manager.get_task(&data) {
                Some(task) => {
                    if let Some(m) = &callback.message {
                        if let Err(e) = self.api.edit_reply_markup(chat_id, m.message_id, None).await
                        {
                            warn!("cannot remove task keyboard: {e}");
                        }
                    }
                    self.enter_task(user.id, chat_id, task).await;
                },
                None => {
                    self.ask_task(user.id, chat_id, Some("Task name not found."))
                        .await;
                },
            },
            ConversationState::AskArgs => {
                self.handle_args_callback(user.id, chat_id, session, &data)
                    .await;
            },
            ConversationState::AskConfirm => {
                self.handle_confirm_callback(user.id, chat_id, session, &data)
                    .await;
            },
        }
    }

    async fn handle_args_callback(
        &self,
        user_id: i64,
        chat_id: i64,
        mut session: Session,
        data: &str,
    ) {
        let Some(task) = session.task.clone() else { return };

        if data == CB_RUN {
            session.state = ConversationState::AskConfirm;
            session.pending_arg = None;
            self.sessions.insert(user_id, session);
            self.send(chat_id, &confirm_prompt(&task), Some(&confirm_keyboard()))
                .await;
            return;
        }

        if let Some(spec) = task.args.get(data) {
            let prompt = match &spec.description {
                Some(description) => format!("Enter a new value for '{data}' ({description})"),
                None => format!("Enter a new value for '{data}'"),
            };
            session.pending_arg = Some(data.to_string());
            self.sessions.insert(user_id, session);
            self.send(chat_id, &prompt, None).await;
        } else {
            debug!(data, "ignoring unknown argument callback");
        }
    }

    async fn handle_confirm_callback(
        &self,
        user_id: i64,
        chat_id: i64,
        mut session: Session,
        data: &str,
    ) {
        match data {
            CB_YES | CB_RUN => self.submit(user_id, chat_id, session).await,
            CB_NO => {
                self.send(chat_id, RETRY_PROMPT, Some(&retry_keyboard()))
                    .await;
            },
            CB_BACK => {
                let Some(task) = session.task.clone() else { return };
                session.state = ConversationState::AskArgs;
                let keyboard = args_keyboard(&task, &session.args);
                self.sessions.insert(user_id, session);
                self.send(chat_id, &args_prompt(&task), Some(&keyboard)).await;
            },
            CB_CANCEL => {
                self.sessions.remove(&user_id);
                self.send(chat_id, "Cancelled.", None).await;
            },
            other => debug!(data = other, "ignoring unknown confirmation callback"),
        }
    }

    /// Enter the conversation for a chosen task: straight to
    /// confirmation when it has no arguments, otherwise argument
    /// editing seeded with the defaults.
    async fn enter_task(&self, user_id: i64, chat_id: i64, task: Arc<Task>) {
        if task.args.is_empty() {
            self.sessions.insert(
                user_id,
                Session {
                    chat_id,
                    state: ConversationState::AskConfirm,
                    task: Some(Arc::clone(&task)),
                    args: IndexMap::new(),
                    pending_arg: None,
                },
            );
            self.send(chat_id, &confirm_prompt(&task), Some(&confirm_keyboard()))
                .await;
        } else {
            let args = task.default_args.clone();
            let keyboard = args_keyboard(&task, &args);
            self.sessions.insert(
                user_id,
                Session {
                    chat_id,
                    state: ConversationState::AskArgs,
                    task: Some(Arc::clone(&task)),
                    args,
                    pending_arg: None,
                },
            );
            self.send(chat_id, &args_prompt(&task), Some(&keyboard)).await;
        }
    }

    async fn ask_task(&self, user_id: i64, chat_id: i64, prefix: Option<&str>) {
        let rows = self
            .manager
            .task_list()
            .into_iter()
            .map(|name| vec![KeyboardButton::new(name.clone(), name)])
            .collect();
        self.sessions.insert(
            user_id,
            Session {
                chat_id,
                state: ConversationState::AskTask,
                task: None,
                args: IndexMap::new(),
                pending_arg: None,
            },
        );
        let text = match prefix {
            Some(prefix) => format!("{prefix} Choose a task:"),
            None => "Choose a task:".to_string(),
        };
        self.send(chat_id, &text, Some(&Keyboard::new(rows))).await;
    }

    async fn submit(&self, user_id: i64, chat_id: i64, session: Session) {
        self.sessions.remove(&user_id);
        let Some(task) = session.task else { return };

        let api = Arc::clone(&self.api);
        let observer: RunObserver = Arc::new(move |run: &TaskRun| {
            let text = format!(
                "Task {} completed: run_rc={}, run_ex={}",
                run.id(),
                run.rc
                    .map_or_else(|| "None".to_string(), |rc| rc.to_string()),
                run.err.clone().unwrap_or_else(|| "None".to_string()),
            );
            let api = Arc::clone(&api);
            tokio::spawn(async move {
                if let Err(e) = api.send_message(chat_id, &text, None).await {
                    warn!("cannot post completion message: {e}");
                }
            });
        });

        let reply = match self.manager.run(&task, vec![observer], session.args) {
            Submission::Started(handle) => format!("Task {} started", handle.id()),
            refused => format!(
                "Task '{}' refused: {}",
                task.name,
                refused.refusal().unwrap_or("gated")
            ),
        };
        self.send(chat_id, &reply, None).await;
    }

    async fn send(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>) {
        if let Err(e) = self.api.send_message(chat_id, text, keyboard).await {
            warn!("chat send failed: {e}");
        }
    }
}

async fn poll_loop(controller: Arc<ChatController>, token: CancellationToken) {
    let mut offset = 0i64;
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            polled = controller.api.get_updates(offset, POLL_TIMEOUT) => match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Err(e) = controller.handle_update(update).await {
                            warn!("chat update handling failed: {e}");
                        }
                    }
                },
                Err(e) => {
                    warn!("chat polling failed: {e}");
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(POLL_RETRY_DELAY) => {},
                    }
                },
            },
        }
    }
}

const RETRY_PROMPT: &str = "Not confirmed. Run anyway, go back to the arguments, or cancel?";

fn args_prompt(task: &Task) -> String {
    format!("Task '{}': choose an argument to edit, then run.", task.name)
}

fn args_keyboard(task: &Task, args: &IndexMap<String, ArgValue>) -> Keyboard {
    let mut rows: Vec<Vec<KeyboardButton>> = task
        .args
        .keys()
        .map(|name| {
            let label = match args.get(name) {
                Some(value) => format!("{name} ({value})"),
                None => name.clone(),
            };
            vec![KeyboardButton::new(label, name.clone())]
        })
        .collect();
    rows.push(vec![KeyboardButton::new("Run task", CB_RUN)]);
    Keyboard::new(rows)
}

fn confirm_prompt(task: &Task) -> String {
    format!("Run task '{}'?", task.name)
}

fn confirm_keyboard() -> Keyboard {
    Keyboard::new(vec![
        vec![KeyboardButton::new("Yes", CB_YES)],
        vec![KeyboardButton::new("No", CB_NO)],
    ])
}

fn retry_keyboard() -> Keyboard {
    Keyboard::new(vec![
        vec![KeyboardButton::new("Run", CB_RUN)],
        vec![KeyboardButton::new("Back", CB_BACK)],
        vec![KeyboardButton::new("Cancel", CB_CANCEL)],
    ])
}
