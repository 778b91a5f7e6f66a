//! End-to-end tests: conversation loop, scheduled callbacks, and the
//! worker wired together the way `main` wires them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use steward::agent::{ProcessOutcome, ProcessingProfile, Processor, ProfileRegistry, TrustLevel};
use steward::clock::{Clock, ManualClock};
use steward::error::DeliveryError;
use steward::llm::{ModelResponse, ScriptedModel};
use steward::notify::{Notification, Notifier};
use steward::queue::{
    BackoffPolicy, HandlerRegistry, LlmCallbackHandler, LlmCallbackPayload, Worker,
    LLM_CALLBACK_TASK_TYPE,
};
use steward::store::{LibSqlStore, NewTask, Store, TaskStatus};
use steward::tools::{builtin_source, ConfirmationGate, ToolRegistry};

struct CapturingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn send(&self, notification: Notification) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

struct Harness {
    store: Arc<dyn Store>,
    clock: Arc<ManualClock>,
    processor: Arc<Processor>,
    worker: Worker,
    notifier: Arc<CapturingNotifier>,
    model: Arc<ScriptedModel>,
}

impl Harness {
    async fn new(model: ScriptedModel) -> Self {
        // Whole-second start so stored timestamps round-trip exactly.
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let store: Arc<dyn Store> =
            Arc::new(LibSqlStore::new_memory(clock.clone()).await.unwrap());
        let wake = Arc::new(Notify::new());

        let mut profiles = ProfileRegistry::new();
        profiles
            .register(
                ProcessingProfile::new("default", "You are a helpful assistant.")
                    .with_tools([
                        "current_time",
                        "save_note",
                        "delete_note",
                        "schedule_callback",
                    ])
                    .with_trust(TrustLevel::Standard),
            )
            .unwrap();
        let profiles = Arc::new(profiles);

        let (builtin, _delegate) = builtin_source(
            store.clone(),
            clock.clone(),
            wake.clone(),
            profiles.clone(),
        )
        .unwrap();
        let mut tools = ToolRegistry::new();
        tools.add_source(builtin);
        let tools = Arc::new(tools);
        profiles.validate(&tools).unwrap();

        let gate = Arc::new(ConfirmationGate::new(
            HashSet::new(),
            clock.clone(),
            Duration::from_secs(900),
        ));
        let notifier = Arc::new(CapturingNotifier {
            sent: Mutex::new(Vec::new()),
        });
        let model = Arc::new(model);

        let processor = Arc::new(Processor::new(
            store.clone(),
            model.clone(),
            tools,
            gate,
            Vec::new(),
            profiles,
            notifier.clone() as Arc<dyn Notifier>,
            clock.clone(),
            10,
            16_000,
        ));

        let mut handlers = HandlerRegistry::new();
        handlers
            .register(Arc::new(LlmCallbackHandler::new(
                store.clone(),
                processor.clone(),
                notifier.clone() as Arc<dyn Notifier>,
            )))
            .unwrap();

        let worker = Worker::new(
            store.clone(),
            Arc::new(handlers),
            clock.clone(),
            wake,
            CancellationToken::new(),
            Duration::from_secs(5),
        );

        Self {
            store,
            clock,
            processor,
            worker,
            notifier,
            model,
        }
    }

    fn reply(outcome: ProcessOutcome) -> String {
        match outcome {
            ProcessOutcome::Reply(text) => text,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    fn notifications(&self) -> Vec<Notification> {
        self.notifier.sent.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn scheduled_callback_fires_and_replies() {
    let h = Harness::new(ScriptedModel::new([
        ModelResponse::tool_call(
            "call_1",
            "schedule_callback",
            json!({"message": "time to check the oven", "in_seconds": 60}),
        ),
        ModelResponse::text("I will remind you in a minute."),
        ModelResponse::text("Your oven is ready!"),
    ]))
    .await;

    let out = h
        .processor
        .process_message("kitchen", "default", "remind me about the oven in a minute")
        .await
        .unwrap();
    assert_eq!(Harness::reply(out), "I will remind you in a minute.");

    // The callback exists but is not yet due.
    let pending = h.store.list_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_type, LLM_CALLBACK_TASK_TYPE);
    h.worker.drain().await;
    assert_eq!(h.store.list_pending(10).await.unwrap().len(), 1);

    // A minute later the worker picks it up, runs a fresh turn, and
    // pushes the reply out.
    h.clock.advance(Duration::from_secs(61));
    h.worker.drain().await;

    let task = h.store.get_task(pending[0].id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);

    let sent = h.notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].conversation_id, "kitchen");
    assert_eq!(sent[0].text, "Your oven is ready!");

    // The injected message and its reply are part of the history.
    let history = h.store.list_messages("kitchen").await.unwrap();
    assert!(history
        .iter()
        .any(|m| m.content == "time to check the oven"));
}

#[tokio::test]
async fn stale_callback_is_skipped_when_user_already_responded() {
    let h = Harness::new(ScriptedModel::new([
        ModelResponse::tool_call(
            "call_1",
            "schedule_callback",
            json!({"message": "nudge", "in_seconds": 60, "skip_if_user_responded": true}),
        ),
        ModelResponse::text("I will nudge you unless you write first."),
        ModelResponse::text("Hello again!"),
    ]))
    .await;

    h.processor
        .process_message("c1", "default", "nudge me later unless I come back")
        .await
        .unwrap();

    // The user comes back before the callback fires.
    h.clock.advance(Duration::from_secs(30));
    h.processor
        .process_message("c1", "default", "never mind, I am here")
        .await
        .unwrap();
    let calls_before = h.model.call_count();

    h.clock.advance(Duration::from_secs(31));
    h.worker.drain().await;

    // Skipping still counts as success and does not invoke the model.
    let pending = h.store.list_pending(10).await.unwrap();
    assert!(pending.is_empty());
    assert_eq!(h.model.call_count(), calls_before);
    assert!(h.notifications().is_empty());
}

#[tokio::test]
async fn recurring_callback_reenqueues_after_each_run() {
    let h = Harness::new(ScriptedModel::new([
        ModelResponse::tool_call(
            "call_1",
            "schedule_callback",
            json!({"message": "standup", "in_seconds": 60, "recurrence": "every:3600s"}),
        ),
        ModelResponse::text("Daily standup scheduled."),
        ModelResponse::text("Standup time."),
    ]))
    .await;

    h.processor
        .process_message("c1", "default", "remind me about standup hourly")
        .await
        .unwrap();
    let first = h.store.list_pending(10).await.unwrap()[0].clone();

    h.clock.advance(Duration::from_secs(61));
    h.worker.drain().await;

    assert_eq!(
        h.store.get_task(first.id).await.unwrap().unwrap().status,
        TaskStatus::Succeeded
    );
    let next = h.store.list_pending(10).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_ne!(next[0].id, first.id);
    assert!(next[0].recurrence.is_some());
    assert_eq!(
        next[0].scheduled_for,
        h.clock.now() + chrono::Duration::hours(1)
    );
}

#[tokio::test]
async fn transport_failures_retry_until_the_budget_runs_out() {
    let h = Harness::new(ScriptedModel::failing_transport()).await;

    let payload = LlmCallbackPayload {
        conversation_id: "c1".to_string(),
        message: "ping".to_string(),
        profile: "default".to_string(),
        scheduling_timestamp: h.clock.now(),
        skip_if_user_responded: false,
    };
    let id = h
        .store
        .enqueue(
            NewTask::new(
                LLM_CALLBACK_TASK_TYPE,
                serde_json::to_value(&payload).unwrap(),
            )
            .max_attempts(3),
        )
        .await
        .unwrap();

    for _ in 0..5 {
        h.worker.drain().await;
        if h.store
            .get_task(id)
            .await
            .unwrap()
            .unwrap()
            .status
            .is_terminal()
        {
            break;
        }
        h.clock.advance(Duration::from_secs(3600));
    }

    let task = h.store.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(h.model.call_count(), 3);

    // An operator can put it back in the queue with a fresh budget.
    h.store.manually_retry(id).await.unwrap();
    let task = h.store.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);
}

#[tokio::test]
async fn retried_callback_is_not_mistaken_for_a_user_reply() {
    // A transport failure after the callback's message is already in
    // history must not trip the skip check on the next attempt: the
    // injected message is the engine talking, not the user responding.
    let h = Harness::new(ScriptedModel::failing_transport()).await;

    let payload = LlmCallbackPayload {
        conversation_id: "c1".to_string(),
        message: "ping".to_string(),
        profile: "default".to_string(),
        scheduling_timestamp: h.clock.now(),
        skip_if_user_responded: true,
    };
    let id = h
        .store
        .enqueue(
            NewTask::new(
                LLM_CALLBACK_TASK_TYPE,
                serde_json::to_value(&payload).unwrap(),
            )
            .max_attempts(3),
        )
        .await
        .unwrap();

    for _ in 0..5 {
        h.worker.drain().await;
        if h.store
            .get_task(id)
            .await
            .unwrap()
            .unwrap()
            .status
            .is_terminal()
        {
            break;
        }
        h.clock.advance(Duration::from_secs(3600));
    }

    let task = h.store.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(h.model.call_count(), 3);
    assert!(h.notifications().is_empty());
}

#[tokio::test]
async fn malformed_callback_payload_fails_without_retry() {
    let h = Harness::new(ScriptedModel::new([])).await;

    let id = h
        .store
        .enqueue(NewTask::new(
            LLM_CALLBACK_TASK_TYPE,
            json!({"not": "a payload"}),
        ))
        .await
        .unwrap();
    h.worker.drain().await;

    let task = h.store.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.unwrap().contains("payload"));
    assert_eq!(h.model.call_count(), 0);
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("steward.db");
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    ));

    let id = {
        let store = LibSqlStore::new_local(
            &path,
            clock.clone(),
            BackoffPolicy::default(),
            Duration::from_secs(300),
        )
        .await
        .unwrap();
        store
            .enqueue(NewTask::new("noop", json!({})).at(clock.now() + chrono::Duration::hours(1)))
            .await
            .unwrap()
    };

    let reopened = LibSqlStore::new_local(
        &path,
        clock.clone(),
        BackoffPolicy::default(),
        Duration::from_secs(300),
    )
    .await
    .unwrap();
    let task = reopened.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.task_type, "noop");
}
