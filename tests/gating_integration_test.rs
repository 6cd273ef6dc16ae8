//! Execution-core integration tests: gating, counters and observer
//! fan-out, exercised against real subprocesses.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use taskforge::catalog::{ArgSpec, ArgType, ArgValue, Task, TASK_SUBPROCESS};
use taskforge::manager::{RunObserver, Submission, TaskManager};

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

fn singleton_task(name: &str, command: &[&str]) -> Task {
    Task {
        singleton: true,
        ..task(name, command)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_scenario_expands_defaults_and_notifies_once() {
    // The command only exits 0 when the template was bound correctly.
    let mut echo = task("echo", &["test", "hello ${who}", "=", "hello world"]);
    echo.args.insert(
        "who".to_string(),
        ArgSpec {
            arg_type: ArgType::Str,
            description: None,
            default: Some(ArgValue::Str("world".into())),
        },
    );
    echo.default_args
        .insert("who".to_string(), ArgValue::Str("world".into()));

    let manager = TaskManager::new(vec![echo]);
    let t = manager.get_task("echo").unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&calls);
    let observer: RunObserver = Arc::new(move |run| {
        recorder.lock().push((run.id().to_string(), run.rc, run.err.clone()));
    });

    let handle = manager
        .run(&t, vec![observer], IndexMap::new())
        .into_handle()
        .expect("submission accepted");
    assert_eq!(handle.wait().await.unwrap(), 0);

    let calls = calls.lock();
    assert_eq!(calls.len(), 1, "observer runs exactly once");
    assert_eq!(calls[0].1, Some(0));
    assert_eq!(calls[0].2, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_environment_placeholder_reaches_subprocess() {
    std::env::set_var("TASKFORGE_IT_HOME", "home");
    let manager = TaskManager::new(vec![task(
        "env",
        &["test", "$[TASKFORGE_IT_HOME]", "=", "home"],
    )]);
    let t = manager.get_task("env").unwrap();
    let handle = manager
        .run(&t, Vec::new(), IndexMap::new())
        .into_handle()
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_singleton_second_submission_refused() {
    let manager = TaskManager::new(vec![singleton_task("sleeper", &["sleep", "0.5"])]);
    let t = manager.get_task("sleeper").unwrap();

    let first = manager.run(&t, Vec::new(), IndexMap::new());
    let second = manager.run(&t, Vec::new(), IndexMap::new());

    assert!(first.is_started());
    assert!(matches!(second, Submission::RefusedSingleton));
    assert_eq!(manager.running_count("sleeper"), 1);

    first.into_handle().unwrap().wait().await.unwrap();
    assert_eq!(manager.running_count("sleeper"), 0);

    // Once the first run completed, the slot is free again.
    let third = manager.run(&t, Vec::new(), IndexMap::new());
    assert!(third.is_started());
    third.into_handle().unwrap().wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conflict_refused_until_conflicting_run_ends() {
    let a = task("a", &["sleep", "0.5"]);
    let mut b = task("b", &["true"]);
    b.conflict.insert("a".to_string());

    let manager = TaskManager::new(vec![a, b]);
    let task_a = manager.get_task("a").unwrap();
    let task_b = manager.get_task("b").unwrap();

    let running_a = manager
        .run(&task_a, Vec::new(), IndexMap::new())
        .into_handle()
        .unwrap();
    let refused = manager.run(&task_b, Vec::new(), IndexMap::new());
    assert!(matches!(refused, Submission::RefusedConflict));

    running_a.wait().await.unwrap();

    let accepted = manager.run(&task_b, Vec::new(), IndexMap::new());
    assert!(accepted.is_started());
    accepted.into_handle().unwrap().wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refusal_leaves_no_trace() {
    let manager = TaskManager::new(vec![singleton_task("sleeper", &["sleep", "0.4"])]);
    let t = manager.get_task("sleeper").unwrap();

    let first = manager
        .run(&t, Vec::new(), IndexMap::new())
        .into_handle()
        .unwrap();
    let status_before = manager.task_status();

    for _ in 0..5 {
        assert!(!manager.run(&t, Vec::new(), IndexMap::new()).is_started());
    }
    assert_eq!(manager.task_status(), status_before);

    first.wait().await.unwrap();
    assert!(manager.task_status().is_empty(), "no zero entries after quiescence");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_observers_run_in_declaration_order_and_panics_are_isolated() {
    let manager = TaskManager::new(vec![task("t", &["true"])]);
    let t = manager.get_task("t").unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut observers: Vec<RunObserver> = Vec::new();
    for label in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        observers.push(Arc::new(move |_run| {
            order.lock().push(label);
            if label == "second" {
                panic!("observer fault");
            }
        }));
    }

    let handle = manager
        .run(&t, observers, IndexMap::new())
        .into_handle()
        .unwrap();
    handle.wait().await.unwrap();

    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_ids_unique_across_sequential_submissions() {
    let manager = TaskManager::new(vec![task("quick", &["true"])]);
    let t = manager.get_task("quick").unwrap();

    let mut ids = std::collections::HashSet::new();
    for _ in 0..50 {
        let handle = manager
            .run(&t, Vec::new(), IndexMap::new())
            .into_handle()
            .unwrap();
        assert!(ids.insert(handle.id()));
        handle.wait().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counter_balance_under_parallel_runs() {
    let manager = Arc::new(TaskManager::new(vec![task("par", &["sleep", "0.1"])]));
    let t = manager.get_task("par").unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(
            manager
                .run(&t, Vec::new(), IndexMap::new())
                .into_handle()
                .unwrap(),
        );
    }
    assert_eq!(manager.running_count("par"), 8);

    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(manager.running_count("par"), 0);
    assert!(manager.task_status().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_in_flight_runs() {
    let manager = Arc::new(TaskManager::new(vec![task("slow", &["sleep", "0.3"])]));
    let t = manager.get_task("slow").unwrap();

    let done = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&done);
    let observer: RunObserver = Arc::new(move |_run| {
        *flag.lock() = true;
    });

    assert!(manager.run(&t, vec![observer], IndexMap::new()).is_started());
    manager.shutdown().await;
    assert!(*done.lock(), "shutdown returned before the run finished");
}
