//! Run records, handles and observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Observer invoked exactly once when a run reaches its terminal state.
///
/// Observers run on the worker, in declaration order, after `rc` or
/// `err` is populated. A panicking observer is logged and swallowed.
pub type RunObserver = Arc<dyn Fn(&TaskRun) + Send + Sync>;

/// Shared, mutable run record: co-owned by the executing worker and any
/// caller holding the returned handle.
pub type SharedRun = Arc<RwLock<TaskRun>>;

// Last issued start timestamp, in microseconds. Run identity is derived
// from the start timestamp, so consecutive submissions must never
// observe the same microsecond.
static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

fn next_start_micros() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    LAST_MICROS
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last + 1))
        })
        .map_or(now, |last| now.max(last + 1))
}

/// One invocation of a task: timing, outcome and identity.
#[derive(Debug, Clone)]
pub struct TaskRun {
    /// Name of the task this run belongs to.
    pub task_name: String,
    /// Start timestamp, fractional seconds since the epoch.
    pub start_ts: f64,
    /// End timestamp, set exactly once when the run reaches its
    /// terminal state.
    pub end_ts: Option<f64>,
    /// Subprocess return code, if the invocation completed.
    pub rc: Option<i32>,
    /// Error text, if the invocation failed before producing a code.
    pub err: Option<String>,
    /// Free-form payload for surfaces that want to attach data.
    pub extra: Option<serde_json::Value>,
    id: String,
}

impl TaskRun {
    pub(crate) fn new(task_name: &str) -> Self {
        let start_ts = next_start_micros() as f64 / 1e6;
        Self {
            task_name: task_name.to_string(),
            start_ts,
            end_ts: None,
            rc: None,
            err: None,
            extra: None,
            id: format!("{task_name}_{start_ts:15.6}"),
        }
    }

    /// Stable run identifier: `"{task_name}_{start_ts}"` with the
    /// timestamp formatted to microsecond precision.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Elapsed seconds, once the run has ended.
    pub fn duration(&self) -> Option<f64> {
        self.end_ts.map(|end| end - self.start_ts)
    }

    /// Whether the run has reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.end_ts.is_some()
    }

    pub(crate) fn now_ts() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Handle to an accepted submission.
#[derive(Debug)]
pub struct RunHandle {
    run: SharedRun,
    join: JoinHandle<Result<i32>>,
}

impl RunHandle {
    pub(crate) fn new(run: SharedRun, join: JoinHandle<Result<i32>>) -> Self {
        Self { run, join }
    }

    /// The run identifier.
    pub fn id(&self) -> String {
        self.run.read().id().to_string()
    }

    /// A point-in-time copy of the run record.
    pub fn snapshot(&self) -> TaskRun {
        self.run.read().clone()
    }

    /// The shared run record itself.
    pub fn shared(&self) -> SharedRun {
        Arc::clone(&self.run)
    }

    /// Wait for the worker to finish and return the subprocess code.
    pub async fn wait(self) -> Result<i32> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::Worker(e.to_string())),
        }
    }
}

/// Outcome of a `run` request: accepted, or refused by a gating policy.
///
/// Refusals are ordinary values, not errors; a refused submission has no
/// side effects.
#[derive(Debug)]
pub enum Submission {
    /// The run was accepted and submitted to the worker pool.
    Started(RunHandle),
    /// Refused: the task is a singleton and a run is already in flight.
    RefusedSingleton,
    /// Refused: a task in the conflict set is running.
    RefusedConflict,
}

impl Submission {
    /// Whether the submission was accepted.
    pub fn is_started(&self) -> bool {
        matches!(self, Submission::Started(_))
    }

    /// Human-readable refusal reason, if refused.
    pub fn refusal(&self) -> Option<&'static str> {
        match self {
            Submission::Started(_) => None,
            Submission::RefusedSingleton => Some("singleton already running"),
            Submission::RefusedConflict => Some("conflicting task running"),
        }
    }

    /// Extract the handle of an accepted submission.
    pub fn into_handle(self) -> Option<RunHandle> {
        match self {
            Submission::Started(handle) => Some(handle),
            _ => None,
        }
    }
}
