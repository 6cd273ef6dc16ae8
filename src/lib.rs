//! # taskforge
//!
//! A long-running task orchestrator: a declarative catalog of named
//! jobs, run on demand through multiple control surfaces (interactive
//! shell, chat bot, periodic timer) under concurrency policies
//! (singleton execution, mutual-exclusion conflict groups). Each job is
//! an external subprocess whose command line is templated with runtime
//! arguments.
//!
//! ## Architecture
//!
//! - [`template`] — `${var}` (context) and `$[var]` (environment)
//!   substitution, plus a bounded constant-expression evaluator.
//! - [`config`] — typed view over a JSON configuration tree with
//!   transparent per-field substitution and inline includes.
//! - [`catalog`] — task records with typed default arguments,
//!   conflict groups and schedules.
//! - [`manager`] — the execution core: gating, worker pool, run
//!   records, observer fan-out.
//! - [`scheduler`] — cooperative timer loop firing tasks at their
//!   declared intervals.
//! - [`shell`] — line-oriented command surface over standard I/O.
//! - [`chat`] — conversational command surface over a polling chat
//!   protocol, with per-user session state.
//! - [`host`] — initialization and lifecycle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskforge::config::ConfigView;
//! use taskforge::manager::{Submission, TaskManager};
//! use taskforge::template::TemplateContext;
//!
//! # async fn example() -> taskforge::Result<()> {
//! let config = ConfigView::load("config.json", None, TemplateContext::new()).await?;
//! let tasklist = config
//!     .navigate("batch_config.TaskManager")?
//!     .get_view("tasklist")?
//!     .expect("config declares a tasklist");
//!
//! let manager = Arc::new(TaskManager::new(taskforge::catalog::parse_catalog(&tasklist)?));
//! let task = manager.get_task("echo").expect("catalog has 'echo'");
//! if let Submission::Started(handle) = manager.run(&task, Vec::new(), Default::default()) {
//!     println!("rc = {}", handle.wait().await?);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod catalog;
pub mod chat;
pub mod config;
pub mod error;
pub mod host;
pub mod manager;
pub mod scheduler;
pub mod security;
pub mod shell;
pub mod template;

pub use catalog::{ArgType, ArgValue, Schedule, ScheduleUnit, Task};
pub use config::{ConfigValue, ConfigView};
pub use error::{Error, Result};
pub use manager::{RunHandle, RunObserver, Submission, TaskManager, TaskRun};
pub use scheduler::TaskScheduler;
pub use shell::{ShellAction, TaskShell};
pub use template::{Evaluate, TemplateContext};
