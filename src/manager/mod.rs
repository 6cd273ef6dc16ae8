//! Execution core: task registry, concurrency gating, worker pool and
//! observer fan-out.
//!
//! The manager owns the catalog, the running-count map and the pool.
//! Submissions are gated atomically: the singleton and conflict checks
//! and the slot reservation happen under one lock, *before* the worker
//! is spawned, so two concurrent submissions of the same singleton task
//! can never both pass the check.
//!
//! # Examples
//!
//! ```rust,no_run
//! use taskforge::catalog::Task;
//! use taskforge::manager::{Submission, TaskManager};
//! use indexmap::IndexMap;
//!
//! # async fn example(tasks: Vec<Task>) -> taskforge::Result<()> {
//! let manager = TaskManager::new(tasks);
//! let task = manager.get_task("echo").expect("catalog has 'echo'");
//! match manager.run(&task, Vec::new(), IndexMap::new()) {
//!     Submission::Started(handle) => println!("Task {} started", handle.id()),
//!     refused => println!("refused: {}", refused.refusal().unwrap()),
//! }
//! # Ok(())
//! # }
//! ```

mod run;

pub use run::{RunHandle, RunObserver, SharedRun, Submission, TaskRun};

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::process::Command;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::catalog::{ArgValue, Task, TASK_SUBPROCESS};
use crate::error::{Error, Result};
use crate::template::{self, TemplateContext};

type RunningCounts = Arc<Mutex<HashMap<String, u32>>>;

/// The orchestration engine: registry, gating and worker pool.
pub struct TaskManager {
    tasks: BTreeMap<String, Arc<Task>>,
    running: RunningCounts,
    tracker: TaskTracker,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("tasks", &self.tasks.len())
            .field("running", &*self.running.lock())
            .finish()
    }
}

impl TaskManager {
    /// Build a manager over a loaded catalog.
    pub fn new(tasks: Vec<Task>) -> Self {
        let tasks: BTreeMap<String, Arc<Task>> = tasks
            .into_iter()
            .map(|task| (task.name.clone(), Arc::new(task)))
            .collect();
        info!(tasks = tasks.len(), "TaskManager initialized");
        Self {
            tasks,
            running: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Look up a task by name.
    pub fn get_task(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.get(name).cloned()
    }

    /// All task names, sorted.
    pub fn task_list(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    /// Iterate the catalog.
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.values()
    }

    /// Snapshot of the running-count map. Completed tasks drop out of
    /// the map, so the snapshot never contains zero entries.
    pub fn task_status(&self) -> BTreeMap<String, u32> {
        self.running
            .lock()
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect()
    }

    /// Current number of in-flight runs of `name`.
    pub fn running_count(&self, name: &str) -> u32 {
        self.running.lock().get(name).copied().unwrap_or(0)
    }

    /// Submit a run of `task` with `args` merged over its defaults.
    ///
    /// The gating decision and the slot reservation are atomic; a
    /// refusal leaves no trace. Observers are invoked exactly once, in
    /// declaration order, after the run reaches its terminal state.
    pub fn run(
        &self,
        task: &Arc<Task>,
        observers: Vec<RunObserver>,
        args: IndexMap<String, ArgValue>,
    ) -> Submission {
        let run: SharedRun = {
            let mut running = self.running.lock();
            if task.singleton && running.get(&task.name).copied().unwrap_or(0) > 0 {
                debug!(task = %task.name, "refused: singleton already running");
                return Submission::RefusedSingleton;
            }
            if let Some(conflicting) = task
                .conflict
                .iter()
                .find(|name| running.get(*name).copied().unwrap_or(0) > 0)
            {
                debug!(task = %task.name, conflicting = %conflicting, "refused: conflicting task running");
                return Submission::RefusedConflict;
            }
            // Reserve the slot before the pool sees the job.
            *running.entry(task.name.clone()).or_insert(0) += 1;
            Arc::new(RwLock::new(TaskRun::new(&task.name)))
        };

        info!(task = %task.name, run = %run.read().id(), "running task");
        let join = self.tracker.spawn(execute(
            Arc::clone(task),
            Arc::clone(&run),
            observers,
            task.merge_args(&args),
            Arc::clone(&self.running),
        ));
        Submission::Started(RunHandle::new(run, join))
    }

    /// Wait for every in-flight run to finish. New submissions should
    /// have stopped (surfaces shut down) before calling this.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        info!("TaskManager drained");
    }
}

/// Composite worker body: invoke, then unconditionally finalize the run
/// record, release the slot and fan out to observers.
async fn execute(
    task: Arc<Task>,
    run: SharedRun,
    observers: Vec<RunObserver>,
    context: TemplateContext,
    running: RunningCounts,
) -> Result<i32> {
    let outcome = invoke(&task, &context).await;

    {
        let mut record = run.write();
        record.end_ts = Some(TaskRun::now_ts());
        match &outcome {
            Ok(rc) => record.rc = Some(*rc),
            Err(e) => record.err = Some(e.to_string()),
        }
    }
    {
        let mut running = running.lock();
        if let Some(count) = running.get_mut(&task.name) {
            *count -= 1;
            if *count == 0 {
                running.remove(&task.name);
            }
        }
    }

    let snapshot = run.read().clone();
    match &outcome {
        Ok(rc) => info!(task = %task.name, run = %snapshot.id(), rc, "task completed"),
        Err(e) => warn!(task = %task.name, run = %snapshot.id(), "task failed: {e}"),
    }

    for observer in &observers {
        if catch_unwind(AssertUnwindSafe(|| observer(&snapshot))).is_err() {
            warn!(task = %task.name, run = %snapshot.id(), "observer panicked, continuing");
        }
    }

    outcome
}

async fn invoke(task: &Task, context: &TemplateContext) -> Result<i32> {
    if task.task_type != TASK_SUBPROCESS {
        return Err(Error::task(format!(
            "task '{}' has unsupported type '{}'",
            task.name, task.task_type
        )));
    }

    let argv: Vec<String> = task
        .command
        .iter()
        .map(|part| template::expand(part, context))
        .collect();
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::task(format!("task '{}' has an empty command", task.name)));
    };

    debug!(task = %task.name, ?argv, "invoking command");
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| Error::task(format!("cannot spawn '{program}': {e}")))?;

    // A signal-terminated subprocess has no exit code.
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ArgType;

    fn task(name: &str, command: &[&str]) -> Task {
        Task {
            name: name.to_string(),
            task_type: TASK_SUBPROCESS.to_string(),
            description: None,
            command: command.iter().map(ToString::to_string).collect(),
            args: IndexMap::new(),
            default_args: IndexMap::new(),
            singleton: false,
            conflict: Default::default(),
            schedule: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_run_and_wait_captures_rc() {
        let manager = TaskManager::new(vec![task("true", &["true"])]);
        let t = manager.get_task("true").unwrap();
        let handle = manager
            .run(&t, Vec::new(), IndexMap::new())
            .into_handle()
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_command_sets_err_not_panic() {
        let manager = TaskManager::new(vec![task(
            "missing",
            &["taskforge-test-no-such-binary"],
        )]);
        let t = manager.get_task("missing").unwrap();
        let handle = manager
            .run(&t, Vec::new(), IndexMap::new())
            .into_handle()
            .unwrap();
        let shared = handle.shared();
        assert!(handle.wait().await.is_err());
        let record = shared.read();
        assert!(record.err.is_some());
        assert!(record.rc.is_none());
        assert!(record.is_finished());
    }

    #[tokio::test]
    async fn test_unsupported_task_type_is_refused_at_run_time() {
        let mut t = task("odd", &["true"]);
        t.task_type = "container".to_string();
        let manager = TaskManager::new(vec![t]);
        let t = manager.get_task("odd").unwrap();
        let handle = manager
            .run(&t, Vec::new(), IndexMap::new())
            .into_handle()
            .unwrap();
        assert!(handle.wait().await.is_err());
        assert_eq!(manager.running_count("odd"), 0);
    }

    #[tokio::test]
    async fn test_command_template_binds_defaults() {
        let mut t = task("echo", &["echo", "hello ${who}"]);
        t.args.insert(
            "who".to_string(),
            crate::catalog::ArgSpec {
                arg_type: ArgType::Str,
                description: None,
                default: Some(ArgValue::Str("world".into())),
            },
        );
        t.default_args
            .insert("who".to_string(), ArgValue::Str("world".into()));
        let manager = TaskManager::new(vec![t]);
        let t = manager.get_task("echo").unwrap();
        let handle = manager
            .run(&t, Vec::new(), IndexMap::new())
            .into_handle()
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), 0);
    }

    #[test]
    fn test_task_list_is_sorted() {
        let manager =
            TaskManager::new(vec![task("zeta", &["true"]), task("alpha", &["true"])]);
        assert_eq!(manager.task_list(), vec!["alpha", "zeta"]);
    }
}
