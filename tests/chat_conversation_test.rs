//! Chat controller integration tests: allowlist and the conversation
//! state machine, driven through the scripted mock transport.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use taskforge::catalog::{ArgSpec, ArgType, ArgValue, Task, TASK_SUBPROCESS};
use taskforge::chat::api::ChatApi;
use taskforge::chat::mock::{callback_update, message_update, MockChatApi};
use taskforge::chat::{ChatController, CB_BACK, CB_NO, CB_RUN, CB_YES};
use taskforge::manager::TaskManager;

const CHAT: i64 = 77;

fn hello_task() -> Task {
    let mut args = IndexMap::new();
    args.insert(
        "name".to_string(),
        ArgSpec {
            arg_type: ArgType::Str,
            description: Some("who to greet".to_string()),
            default: Some(ArgValue::Str("world".into())),
        },
    );
    let mut default_args = IndexMap::new();
    default_args.insert("name".to_string(), ArgValue::Str("world".into()));
    Task {
        name: "hello".to_string(),
        task_type: TASK_SUBPROCESS.to_string(),
        description: None,
        command: vec!["echo".into(), "hello ${name}".into()],
        args,
        default_args,
        singleton: false,
        conflict: Default::default(),
        schedule: Vec::new(),
    }
}

fn bare_task(name: &str) -> Task {
    Task {
        name: name.to_string(),
        task_type: TASK_SUBPROCESS.to_string(),
        description: None,
        command: vec!["true".into()],
        args: IndexMap::new(),
        default_args: IndexMap::new(),
        singleton: false,
        conflict: Default::default(),
        schedule: Vec::new(),
    }
}

fn controller_with(tasks: Vec<Task>) -> (Arc<ChatController>, Arc<MockChatApi>) {
    let manager = Arc::new(TaskManager::new(tasks));
    let api = Arc::new(MockChatApi::new());
    let controller = Arc::new(ChatController::new(
        manager,
        Arc::clone(&api) as Arc<dyn ChatApi>,
        vec!["u1".to_string()],
    ));
    (controller, api)
}

async fn wait_for_completion_message(api: &MockChatApi) -> String {
    for _ in 0..50 {
        if let Some(found) = api
            .sent()
            .into_iter()
            .map(|m| m.text)
            .find(|text| text.contains("completed"))
        {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("no completion message arrived");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_happy_path_with_defaults() {
    let (controller, api) = controller_with(vec![hello_task()]);

    // `/run hello` presents the argument keyboard with current values.
    controller
        .handle_update(message_update(1, "u1", CHAT, "/run hello"))
        .await
        .unwrap();
    let keyboard = api.last_sent().unwrap().keyboard.expect("arg keyboard");
    assert_eq!(keyboard.labels(), vec!["name (world)", "Run task"]);

    // Run -> confirmation keyboard.
    controller
        .handle_update(callback_update(2, "u1", CHAT, CB_RUN))
        .await
        .unwrap();
    let keyboard = api.last_sent().unwrap().keyboard.expect("confirm keyboard");
    assert_eq!(keyboard.labels(), vec!["Yes", "No"]);

    // Yes -> submission reply with the run id, completion posted later.
    controller
        .handle_update(callback_update(3, "u1", CHAT, CB_YES))
        .await
        .unwrap();
    let reply = api.last_sent().unwrap();
    assert_eq!(reply.chat_id, CHAT);
    assert!(reply.text.starts_with("Task hello_"));
    assert!(reply.text.ends_with("started"));

    let completion = wait_for_completion_message(&api).await;
    assert!(completion.contains("run_rc=0"));
    assert!(completion.contains("run_ex=None"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unlisted_user_gets_nothing() {
    let (controller, api) = controller_with(vec![hello_task()]);

    controller
        .handle_update(message_update(1, "u2", CHAT, "/run hello"))
        .await
        .unwrap();
    controller
        .handle_update(callback_update(2, "u2", CHAT, CB_RUN))
        .await
        .unwrap();

    assert!(api.sent().is_empty(), "no reply to unlisted users");
    assert!(api.edits().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasklist_reply() {
    let (controller, api) = controller_with(vec![bare_task("b"), bare_task("a")]);
    controller
        .handle_update(message_update(1, "u1", CHAT, "/tasklist"))
        .await
        .unwrap();
    assert_eq!(api.last_sent().unwrap().text, "Tasklist: a, b");

    let (controller, api) = controller_with(Vec::new());
    controller
        .handle_update(message_update(1, "u1", CHAT, "/tasklist"))
        .await
        .unwrap();
    assert_eq!(api.last_sent().unwrap().text, "Empty tasklist!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_argument_editing_and_back_preserves_values() {
    let (controller, api) = controller_with(vec![hello_task()]);

    controller
        .handle_update(message_update(1, "u1", CHAT, "/run hello"))
        .await
        .unwrap();

    // Pick the argument, send a new value.
    controller
        .handle_update(callback_update(2, "u1", CHAT, "name"))
        .await
        .unwrap();
    assert!(api
        .last_sent()
        .unwrap()
        .text
        .contains("Enter a new value for 'name'"));
    controller
        .handle_update(message_update(3, "u1", CHAT, "rustaceans"))
        .await
        .unwrap();
    let keyboard = api.last_sent().unwrap().keyboard.expect("arg keyboard");
    assert_eq!(keyboard.labels(), vec!["name (rustaceans)", "Run task"]);

    // Run -> No -> Back: the edited value survives the detour.
    controller
        .handle_update(callback_update(4, "u1", CHAT, CB_RUN))
        .await
        .unwrap();
    controller
        .handle_update(callback_update(5, "u1", CHAT, CB_NO))
        .await
        .unwrap();
    let keyboard = api.last_sent().unwrap().keyboard.expect("retry keyboard");
    assert_eq!(keyboard.labels(), vec!["Run", "Back", "Cancel"]);

    controller
        .handle_update(callback_update(6, "u1", CHAT, CB_BACK))
        .await
        .unwrap();
    let keyboard = api.last_sent().unwrap().keyboard.expect("arg keyboard");
    assert_eq!(keyboard.labels(), vec!["name (rustaceans)", "Run task"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_task_name_reprompts_with_task_keyboard() {
    let (controller, api) = controller_with(vec![hello_task(), bare_task("cleanup")]);

    controller
        .handle_update(message_update(1, "u1", CHAT, "/run nosuch"))
        .await
        .unwrap();
    let prompt = api.last_sent().unwrap();
    assert!(prompt.text.starts_with("Task name not found."));
    let keyboard = prompt.keyboard.expect("task keyboard");
    assert_eq!(keyboard.labels(), vec!["cleanup", "hello"]);

    // Choosing from the keyboard removes it and enters the task.
    controller
        .handle_update(callback_update(2, "u1", CHAT, "hello"))
        .await
        .unwrap();
    let edit = api.edits().pop().expect("keyboard removed");
    assert!(edit.keyboard.is_none());
    let keyboard = api.last_sent().unwrap().keyboard.expect("arg keyboard");
    assert_eq!(keyboard.labels(), vec!["name (world)", "Run task"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_without_args_goes_straight_to_confirmation() {
    let (controller, api) = controller_with(vec![bare_task("noop")]);
    controller
        .handle_update(message_update(1, "u1", CHAT, "/run noop"))
        .await
        .unwrap();
    let prompt = api.last_sent().unwrap();
    assert_eq!(prompt.text, "Run task 'noop'?");
    assert_eq!(prompt.keyboard.unwrap().labels(), vec!["Yes", "No"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_drops_the_session() {
    let (controller, api) = controller_with(vec![hello_task()]);

    controller
        .handle_update(message_update(1, "u1", CHAT, "/run hello"))
        .await
        .unwrap();
    controller
        .handle_update(callback_update(2, "u1", CHAT, "name"))
        .await
        .unwrap();
    controller
        .handle_update(message_update(3, "u1", CHAT, "/cancel"))
        .await
        .unwrap();
    assert_eq!(api.last_sent().unwrap().text, "Cancelled.");

    // The pending argument died with the session: plain text is ignored.
    let before = api.sent().len();
    controller
        .handle_update(message_update(4, "u1", CHAT, "stray value"))
        .await
        .unwrap();
    assert_eq!(api.sent().len(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_typed_value_reprompts() {
    let mut task = bare_task("count");
    task.args.insert(
        "n".to_string(),
        ArgSpec {
            arg_type: ArgType::Int,
            description: None,
            default: None,
        },
    );
    let (controller, api) = controller_with(vec![task]);

    controller
        .handle_update(message_update(1, "u1", CHAT, "/run count"))
        .await
        .unwrap();
    controller
        .handle_update(callback_update(2, "u1", CHAT, "n"))
        .await
        .unwrap();
    controller
        .handle_update(message_update(3, "u1", CHAT, "three"))
        .await
        .unwrap();
    assert!(api.last_sent().unwrap().text.contains("not a valid value"));

    // A parseable value is accepted and shown on the keyboard.
    controller
        .handle_update(message_update(4, "u1", CHAT, "3"))
        .await
        .unwrap();
    let keyboard = api.last_sent().unwrap().keyboard.expect("arg keyboard");
    assert_eq!(keyboard.labels(), vec!["n (3)", "Run task"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_polling_loop_lifecycle() {
    let (controller, api) = controller_with(vec![bare_task("noop")]);

    controller.start();
    assert!(controller.is_running());
    controller.start();
    assert!(controller.is_running());

    // An update fed through the real polling loop reaches the machine.
    api.push_update(message_update(1, "u1", CHAT, "/tasklist"));
    for _ in 0..50 {
        if !api.sent().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(api.last_sent().unwrap().text, "Tasklist: noop");

    controller.stop().await;
    assert!(!controller.is_running());
    controller.stop().await;
    assert!(!controller.is_running());
}
