//! Host driver: command-line options, logging setup, configuration
//! loading and process lifecycle.
//!
//! The host loads the config tree, binds the command-line context,
//! builds the manager and its surfaces, then blocks on the shell (when
//! enabled) or on an interrupt. Startup problems are fatal; everything
//! after startup is isolated per surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog;
use crate::chat::http::HttpChatApi;
use crate::chat::ChatController;
use crate::config::ConfigView;
use crate::error::{Error, Result};
use crate::manager::TaskManager;
use crate::scheduler::TaskScheduler;
use crate::security;
use crate::shell::{ShellAction, TaskShell};
use crate::template::{self, TemplateContext};

/// The batch component this binary knows how to instantiate.
pub const BATCH_TASK_MANAGER: &str = "TaskManager";

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "taskforge", version, about = "Long-running task orchestrator")]
pub struct HostOptions {
    /// Logging filter configuration file.
    #[arg(short = 'l', long = "log-config", default_value = "logging.conf")]
    pub log_config: PathBuf,

    /// JSON configuration file.
    #[arg(short = 'c', long = "config", default_value = "config.json")]
    pub config: PathBuf,

    /// Batch component to instantiate.
    #[arg(short = 'b', long = "batch")]
    pub batch: String,

    /// KEY=VALUE context entries and bare boolean flags
    /// (recognized flags: shell, scheduler, telegram).
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

/// Install the global tracing subscriber.
///
/// The filter comes from the first directive line of `path` when the
/// file exists; a malformed file is fatal. A missing file falls back to
/// `RUST_LOG`, then to `info`.
pub fn init_logging(path: &Path) -> Result<()> {
    let filter = match std::fs::read_to_string(path) {
        Ok(text) => {
            let directives = text
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty() && !line.starts_with('#'))
                .unwrap_or("info")
                .to_string();
            EnvFilter::try_new(&directives).map_err(|e| {
                Error::config(format!(
                    "invalid logging configuration in '{}': {e}",
                    path.display()
                ))
            })?
        },
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::config(format!("cannot install logger: {e}")))?;
    debug!("logger configuration applied from '{}'", path.display());
    Ok(())
}

/// The assembled process: manager, surfaces and activation flags.
#[derive(Debug)]
pub struct Host {
    name: String,
    manager: Arc<TaskManager>,
    scheduler: Arc<TaskScheduler>,
    chat: Option<Arc<ChatController>>,
    has_shell: bool,
    has_scheduler: bool,
    has_chat: bool,
}

impl Host {
    /// Load the configuration and build the manager and surfaces.
    pub async fn build(options: &HostOptions) -> Result<Self> {
        let class_name = options
            .batch
            .rsplit('.')
            .next()
            .unwrap_or(options.batch.as_str());
        if class_name != BATCH_TASK_MANAGER {
            return Err(Error::config(format!(
                "unknown batch class '{}'",
                options.batch
            )));
        }

        let context = template::prepare_context(&options.args);
        for (key, value) in &context {
            debug!("context \"{key}\": \"{}\"", template::stringify(value));
        }

        let text = tokio::fs::read_to_string(&options.config)
            .await
            .map_err(|e| {
                Error::config(format!(
                    "cannot load configuration from file '{}': {e}",
                    options.config.display()
                ))
            })?;
        let mut config = ConfigView::from_json_str(&text, TemplateContext::new())
            .map_err(|e| {
                Error::config(format!(
                    "configuration not valid from file '{}': {e}",
                    options.config.display()
                ))
            })?;
        config.bind_context(context.clone());

        let name = config
            .get_str("name")?
            .ok_or_else(|| Error::config("configuration is missing 'name'"))?;

        info!("<<<<<-----");
        info!("Batch \"{name}\" starting NOW");
        info!("----->>>>>");

        let batch_config = config
            .get_view("batch_config")?
            .ok_or_else(|| Error::config("configuration is missing 'batch_config'"))?;
        let section = match batch_config.get_view(&options.batch)? {
            Some(section) => section,
            None => batch_config.get_view(class_name)?.ok_or_else(|| {
                Error::config(format!(
                    "batch_config has no section for '{}'",
                    options.batch
                ))
            })?,
        };

        let tasks = match section.get_view("tasklist")? {
            Some(tasklist) => catalog::parse_catalog(&tasklist)?,
            None => {
                warn!("no tasklist configured, catalog is empty");
                Vec::new()
            },
        };
        let manager = Arc::new(TaskManager::new(tasks));
        let scheduler = Arc::new(TaskScheduler::new(Arc::clone(&manager)));

        let mut has_shell = section.get_bool("shell")?.unwrap_or(false);
        if context_flag(&context, "shell") {
            debug!("shell requested from context: activating");
            has_shell = true;
        }

        let mut has_scheduler = section.get_bool("scheduler")?.unwrap_or(false);
        if context_flag(&context, "scheduler") {
            debug!("scheduler requested from context: activating");
            has_scheduler = true;
        }

        let (chat, mut has_chat) = match section.get_view("telegram")? {
            Some(telegram) => {
                let token = telegram
                    .get_str("token")?
                    .ok_or_else(|| Error::config("telegram section is missing 'token'"))?;
                let token = security::decode(&token)?;
                let users = telegram
                    .get_view("users")?
                    .map(|list| {
                        list.iter()
                            .filter_map(|entry| {
                                entry
                                    .ok()
                                    .and_then(crate::config::ConfigValue::into_value)
                                    .and_then(|v| v.as_str().map(String::from))
                            })
                            .collect::<Vec<String>>()
                    })
                    .unwrap_or_default();
                let api = Arc::new(HttpChatApi::new(&token));
                let controller = Arc::new(ChatController::new(Arc::clone(&manager), api, users));
                let started = telegram.get_bool("started")?.unwrap_or(false);
                (Some(controller), started)
            },
            None => (None, false),
        };
        if context_flag(&context, "telegram") {
            if chat.is_some() {
                debug!("telegram controller requested from context: activating");
                has_chat = true;
            } else {
                warn!("telegram requested from context but not configured");
            }
        }

        Ok(Self {
            name,
            manager,
            scheduler,
            chat,
            has_shell,
            has_scheduler,
            has_chat,
        })
    }

    /// The configured batch name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The execution core.
    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    /// The periodic scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// The chat controller, when a telegram section is configured.
    pub fn chat(&self) -> Option<&Arc<ChatController>> {
        self.chat.as_ref()
    }

    /// Whether the shell surface is enabled.
    pub fn has_shell(&self) -> bool {
        self.has_shell
    }

    /// Whether the scheduler starts at boot.
    pub fn has_scheduler(&self) -> bool {
        self.has_scheduler
    }

    /// Whether the chat controller starts at boot.
    pub fn has_chat(&self) -> bool {
        self.has_chat
    }

    /// Run to completion: start the enabled surfaces, block on the
    /// shell or an interrupt, stop the surfaces and drain in-flight
    /// runs.
    pub async fn execute(&self) -> Result<i32> {
        info!("TaskManager running...");
        if self.has_scheduler {
            self.scheduler.start();
        }
        if self.has_chat {
            if let Some(chat) = &self.chat {
                chat.start();
            }
        }

        if self.has_shell {
            let shell = TaskShell::new(
                Arc::clone(&self.manager),
                Arc::clone(&self.scheduler),
                self.chat.clone(),
            );
            let action = tokio::select! {
                outcome = shell.run_loop() => match outcome {
                    Ok(action) => action,
                    Err(e) => {
                        error!("Unexpected shell error: {e}");
                        ShellAction::Exit
                    },
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Terminating TaskManager...");
                    ShellAction::Shutdown
                },
            };
            if action == ShellAction::Exit && self.services_running() {
                // `exit` leaves the services up; stay resident until
                // interrupted.
                let _ = tokio::signal::ctrl_c().await;
                info!("Terminating TaskManager...");
            }
        } else {
            let _ = tokio::signal::ctrl_c().await;
            info!("Terminating TaskManager...");
        }

        self.stop_services().await;
        self.manager.shutdown().await;
        Ok(0)
    }

    fn services_running(&self) -> bool {
        self.scheduler.is_running()
            || self.chat.as_ref().is_some_and(|chat| chat.is_running())
    }

    async fn stop_services(&self) {
        self.scheduler.stop().await;
        if let Some(chat) = &self.chat {
            chat.stop().await;
        }
    }
}

// Context flags follow truthiness: a bare flag is `true`, a KEY=VALUE
// entry counts when its value is non-empty.
fn context_flag(context: &TemplateContext, name: &str) -> bool {
    match context.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) | None => false,
    }
}
