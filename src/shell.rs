//! Line-oriented runtime shell over standard I/O.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::catalog::ArgValue;
use crate::chat::ChatController;
use crate::error::Result;
use crate::manager::{RunObserver, Submission, TaskManager, TaskRun};
use crate::scheduler::TaskScheduler;
use crate::template;

const INTRO: &str = "TaskManager runtime shell. Type 'help' or '?' for available commands.";
const PROMPT: &str = "> ";

const HELP: &str = "\
Available commands:
  run <name> [arg=value ...]  Run a task by name.
  tasklist                    Print list of tasks.
  task_status                 Print the running-task table.
  scheduler_start             Start TaskScheduler.
  scheduler_stop              Stop TaskScheduler.
  scheduler_status            Check TaskScheduler status.
  telegram_start              Start TaskTelegramController.
  telegram_stop               Stop TaskTelegramController.
  telegram_status             Check TaskTelegramController status.
  shutdown                    Stop the shell and all the running services.
  exit                        Stop the shell.
  help, ?                     Show this help.";

/// What the caller should do after a handled line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellAction {
    /// Keep reading.
    Continue,
    /// Leave the REPL; services keep running.
    Exit,
    /// Leave the REPL after stopping the scheduler and chat controller.
    Shutdown,
}

/// The interactive shell surface.
#[derive(Debug)]
pub struct TaskShell {
    manager: Arc<TaskManager>,
    scheduler: Arc<TaskScheduler>,
    chat: Option<Arc<ChatController>>,
}

impl TaskShell {
    /// Build a shell over the manager and its service surfaces.
    pub fn new(
        manager: Arc<TaskManager>,
        scheduler: Arc<TaskScheduler>,
        chat: Option<Arc<ChatController>>,
    ) -> Self {
        Self {
            manager,
            scheduler,
            chat,
        }
    }

    /// Read commands from stdin until `exit`, `shutdown` or EOF.
    pub async fn run_loop(&self) -> Result<ShellAction> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        stdout.write_all(INTRO.as_bytes()).await?;
        stdout.write_all(b"\n").await?;

        loop {
            stdout.write_all(PROMPT.as_bytes()).await?;
            stdout.flush().await?;

            let Some(line) = lines.next_line().await? else {
                // EOF behaves like `exit`.
                return Ok(ShellAction::Exit);
            };

            let (output, action) = self.handle_line(&line).await;
            for entry in output {
                stdout.write_all(entry.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
            stdout.flush().await?;

            if action != ShellAction::Continue {
                return Ok(action);
            }
        }
    }

    /// Handle one input line; returns the lines to print and what to do
    /// next. An empty line is a no-op.
    pub async fn handle_line(&self, line: &str) -> (Vec<String>, ShellAction) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return (Vec::new(), ShellAction::Continue);
        }

        let mut parts = trimmed.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        match command {
            "run" => (self.cmd_run(&rest), ShellAction::Continue),
            "tasklist" => (
                self.manager
                    .task_list()
                    .into_iter()
                    .map(|name| format!("\t{name}"))
                    .collect(),
                ShellAction::Continue,
            ),
            "task_status" => (
                self.manager
                    .task_status()
                    .into_iter()
                    .map(|(name, count)| format!("\t{name}: {count}"))
                    .collect(),
                ShellAction::Continue,
            ),
            "scheduler_start" => {
                self.scheduler.start();
                (Vec::new(), ShellAction::Continue)
            },
            "scheduler_stop" => {
                self.scheduler.stop().await;
                (Vec::new(), ShellAction::Continue)
            },
            "scheduler_status" => (
                vec![format!(
                    "TaskScheduler is running: {}",
                    self.scheduler.is_running()
                )],
                ShellAction::Continue,
            ),
            "telegram_start" => match &self.chat {
                Some(chat) => {
                    chat.start();
                    (Vec::new(), ShellAction::Continue)
                },
                None => (
                    vec!["TaskTelegramController is not configured".to_string()],
                    ShellAction::Continue,
                ),
            },
            "telegram_stop" => match &self.chat {
                Some(chat) => {
                    chat.stop().await;
                    (Vec::new(), ShellAction::Continue)
                },
                None => (
                    vec!["TaskTelegramController is not configured".to_string()],
                    ShellAction::Continue,
                ),
            },
            "telegram_status" => match &self.chat {
                Some(chat) => (
                    vec![format!(
                        "TaskTelegramController is running: {}",
                        chat.is_running()
                    )],
                    ShellAction::Continue,
                ),
                None => (
                    vec!["TaskTelegramController is not configured".to_string()],
                    ShellAction::Continue,
                ),
            },
            "shutdown" => {
                self.scheduler.stop().await;
                if let Some(chat) = &self.chat {
                    chat.stop().await;
                }
                (Vec::new(), ShellAction::Shutdown)
            },
            "exit" => (Vec::new(), ShellAction::Exit),
            "help" | "?" => (vec![HELP.to_string()], ShellAction::Continue),
            unknown => (
                vec![format!(
                    "Unknown command: '{unknown}'. Type 'help' or '?' for available commands."
                )],
                ShellAction::Continue,
            ),
        }
    }

    fn cmd_run(&self, args: &[&str]) -> Vec<String> {
        let Some(name) = args.first() else {
            return vec!["Expected syntax: run taskname [arg=value ...]".to_string()];
        };
        let Some(task) = self.manager.get_task(name) else {
            return vec![format!("Task '{name}' not found")];
        };

        let call_args = parse_run_args(&args[1..]);
        let observer: RunObserver = Arc::new(|run: &TaskRun| {
            println!(
                "Task {} completed: run_rc={}, run_ex={}",
                run.id(),
                run.rc
                    .map_or_else(|| "None".to_string(), |rc| rc.to_string()),
                run.err.clone().unwrap_or_else(|| "None".to_string()),
            );
        });

        match self.manager.run(&task, vec![observer], call_args) {
            Submission::Started(handle) => vec![format!("Task {} started", handle.id())],
            refused => vec![format!(
                "Task '{name}' refused: {}",
                refused.refusal().unwrap_or("gated")
            )],
        }
    }
}

/// Parse `run` arguments: `NAME=VALUE` tokens become string entries,
/// bare tokens become boolean-true entries.
pub(crate) fn parse_run_args(tokens: &[&str]) -> IndexMap<String, ArgValue> {
    let owned: Vec<String> = tokens.iter().map(ToString::to_string).collect();
    template::prepare_context(&owned)
        .into_iter()
        .filter_map(|(name, value)| match value {
            Value::String(s) => Some((name, ArgValue::Str(s))),
            Value::Bool(b) => Some((name, ArgValue::Bool(b))),
            _ => None,
        })
        .collect()
}
