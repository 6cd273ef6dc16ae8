//! Periodic scheduler: a cooperative tick loop that fires catalog
//! schedules into the execution core.
//!
//! The loop runs on its own spawned task and wakes every 250 ms. Fires
//! are plain `run` submissions with no observers; a gate refusal on
//! fire is logged and the schedule simply waits for its next slot.
//! Start and stop are idempotent toward their respective states.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, LocalResult, NaiveDate, NaiveTime, TimeZone};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Schedule, ScheduleUnit, Task};
use crate::manager::TaskManager;

/// Tick period of the scheduler loop.
pub const TICK: Duration = Duration::from_millis(250);

const MIDNIGHT: NaiveTime = NaiveTime::MIN;

#[derive(Debug)]
struct ScheduledJob {
    task: Arc<Task>,
    schedule: Schedule,
    next_fire: Mutex<DateTime<Local>>,
}

struct LoopHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Cooperative timer loop over the catalog's scheduled tasks.
pub struct TaskScheduler {
    manager: Arc<TaskManager>,
    jobs: Vec<Arc<ScheduledJob>>,
    state: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("jobs", &self.jobs.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl TaskScheduler {
    /// Collect the scheduled jobs from the manager's catalog. First
    /// fires are anchored at load time.
    pub fn new(manager: Arc<TaskManager>) -> Self {
        let load_time = Local::now();
        let mut jobs = Vec::new();
        for task in manager.tasks() {
            for schedule in &task.schedule {
                let next = first_fire(schedule, load_time);
                debug!(task = %task.name, ?schedule, %next, "scheduling task");
                jobs.push(Arc::new(ScheduledJob {
                    task: Arc::clone(task),
                    schedule: *schedule,
                    next_fire: Mutex::new(next),
                }));
            }
        }
        info!(jobs = jobs.len(), "TaskScheduler initialized");
        Self {
            manager,
            jobs,
            state: Mutex::new(None),
        }
    }

    /// Number of scheduled jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the tick loop is currently running.
    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Start the tick loop. A second start is a no-op with a warning.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.is_some() {
            warn!("TaskScheduler is already running");
            return;
        }
        let token = CancellationToken::new();
        let join = tokio::spawn(run_loop(
            Arc::clone(&self.manager),
            self.jobs.clone(),
            token.clone(),
        ));
        *state = Some(LoopHandle { token, join });
        info!("TaskScheduler is running");
    }

    /// Signal the tick loop and join it. In-flight task runs continue in
    /// the execution pool. Stopping a stopped scheduler is a no-op.
    pub async fn stop(&self) {
        let handle = self.state.lock().take();
        match handle {
            Some(LoopHandle { token, join }) => {
                token.cancel();
                if let Err(e) = join.await {
                    warn!("scheduler loop did not join cleanly: {e}");
                }
                info!("TaskScheduler stopped");
            },
            None => info!("TaskScheduler not running"),
        }
    }
}

async fn run_loop(
    manager: Arc<TaskManager>,
    jobs: Vec<Arc<ScheduledJob>>,
    token: CancellationToken,
) {
    loop {
        let now = Local::now();
        for job in &jobs {
            let due = {
                let mut next = job.next_fire.lock();
                if *next <= now {
                    *next = next_fire(&job.schedule, now);
                    true
                } else {
                    false
                }
            };
            if due {
                debug!(task = %job.task.name, "schedule fired");
                let submission = manager.run(&job.task, Vec::new(), IndexMap::new());
                if let Some(reason) = submission.refusal() {
                    warn!(task = %job.task.name, "scheduled run refused: {reason}");
                }
            }
        }

        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(TICK) => {},
        }
    }
}

/// First fire time for a schedule loaded at `load_time`.
pub(crate) fn first_fire(schedule: &Schedule, load_time: DateTime<Local>) -> DateTime<Local> {
    match (schedule.unit, schedule.at) {
        (ScheduleUnit::Seconds | ScheduleUnit::Minutes | ScheduleUnit::Hours, _)
        | (ScheduleUnit::Days, None) => load_time + interval_duration(schedule),
        _ => next_fire(schedule, load_time),
    }
}

/// Next fire time strictly after `after`.
pub(crate) fn next_fire(schedule: &Schedule, after: DateTime<Local>) -> DateTime<Local> {
    let interval = i64::from(schedule.interval.max(1));
    match (schedule.unit, schedule.at) {
        (ScheduleUnit::Seconds | ScheduleUnit::Minutes | ScheduleUnit::Hours, _)
        | (ScheduleUnit::Days, None) => after + interval_duration(schedule),
        (ScheduleUnit::Days, Some(at)) => {
            let mut candidate = local_at(after.date_naive(), at);
            while candidate <= after {
                candidate = local_at(
                    candidate.date_naive() + ChronoDuration::days(interval),
                    at,
                );
            }
            candidate
        },
        (ScheduleUnit::Weekly(weekday), at) => {
            let at = at.unwrap_or(MIDNIGHT);
            let shift = i64::from(
                (weekday.num_days_from_monday() + 7 - after.weekday().num_days_from_monday()) % 7,
            );
            let mut candidate = local_at(after.date_naive() + ChronoDuration::days(shift), at);
            while candidate <= after {
                candidate = local_at(
                    candidate.date_naive() + ChronoDuration::days(7 * interval),
                    at,
                );
            }
            candidate
        },
    }
}

fn interval_duration(schedule: &Schedule) -> ChronoDuration {
    let interval = i64::from(schedule.interval.max(1));
    match schedule.unit {
        ScheduleUnit::Seconds => ChronoDuration::seconds(interval),
        ScheduleUnit::Minutes => ChronoDuration::minutes(interval),
        ScheduleUnit::Hours => ChronoDuration::hours(interval),
        ScheduleUnit::Days | ScheduleUnit::Weekly(_) => ChronoDuration::days(interval),
    }
}

fn local_at(date: NaiveDate, time: NaiveTime) -> DateTime<Local> {
    let naive = date.and_time(time);
    match naive.and_local_timezone(Local) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
        // Nonexistent local time (DST gap): shift into the next hour.
        LocalResult::None => Local
            .from_local_datetime(&(naive + ChronoDuration::hours(1)))
            .earliest()
            .unwrap_or_else(Local::now),
    }
}
