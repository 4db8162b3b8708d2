//! End-to-end pipeline scenarios: gateway service and agent supervisor
//! wired over the embedded broker, exercising the full
//! create → hint → consume → execute → record flow.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;

use funcvisor::{
    AgentConfig, AgentMetrics, AgentSupervisor, Broker, Error, MemoryBroker, MemoryKv,
    SimulatedRunner, Task, TaskService, TaskState, TaskStore,
};

struct Agent {
    service: TaskService,
    broker: Arc<MemoryBroker>,
    metrics: Arc<AgentMetrics>,
    token: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), Error>>,
}

fn test_config() -> AgentConfig {
    let mut cfg = AgentConfig::default();
    cfg.pod_name = "agent-test".into();
    cfg.grace = Duration::from_secs(5);
    cfg.instances.max = 2;
    cfg.instances.lifetime = Duration::from_secs(300);
    cfg.instances.cold_start = Duration::ZERO;
    cfg.consumer.max_ack_pending = 32;
    cfg.consumer.ack_wait = Duration::from_secs(5);
    cfg.consumer.max_deliver = 5;
    cfg.consumer.backoff = vec![Duration::from_millis(20), Duration::from_millis(40)];
    cfg
}

async fn start_agent(cfg: AgentConfig) -> Agent {
    let broker = Arc::new(MemoryBroker::new());
    let kv = Arc::new(MemoryKv::new());
    let metrics = Arc::new(AgentMetrics::register(&Registry::new()).unwrap());

    let supervisor = AgentSupervisor::connect(
        cfg,
        broker.clone(),
        kv.clone(),
        Arc::new(SimulatedRunner),
        metrics.clone(),
    )
    .await
    .unwrap();

    let token = CancellationToken::new();
    let handle = tokio::spawn(supervisor.run(token.clone()));

    let service = TaskService::connect(broker.clone(), kv).await.unwrap();
    Agent {
        service,
        broker,
        metrics,
        token,
        handle,
    }
}

/// Polls `probe` until it returns `Some` or `deadline` elapses.
async fn wait_for<T, F, Fut>(deadline: Duration, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let give_up = tokio::time::Instant::now() + deadline;
    loop {
        if let Some(v) = probe().await {
            return v;
        }
        assert!(
            tokio::time::Instant::now() < give_up,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_terminal(service: &TaskService, name: &str, deadline: Duration) -> Task {
    wait_for(deadline, || async {
        let task = service.get_task(name).await.unwrap();
        task.state.is_terminal().then_some(task)
    })
    .await
}

#[tokio::test]
async fn happy_path_executes_and_records_success() {
    let agent = start_agent(test_config()).await;

    let created = agent
        .service
        .create_task("functions/foo", r#"{"execution_time_ms": 10}"#.into())
        .await
        .unwrap();
    assert_eq!(created.state, TaskState::Pending);

    let done = wait_terminal(&agent.service, created.name.as_str(), Duration::from_secs(10)).await;
    assert_eq!(done.state, TaskState::Succeeded);
    match done.result {
        Some(funcvisor::TaskResult::Inline { ref inline_result }) => {
            assert_eq!(inline_result, b"OK")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    let started = done.started_at.expect("started_at set");
    let ended = done.ended_at.expect("ended_at set");
    assert!(done.created_at <= started);
    assert!(started <= ended);

    // A second task on the same function coalesces onto the same consumer
    // and the same warm instance.
    let second = agent
        .service
        .create_task("functions/foo", r#"{"execution_time_ms": 10}"#.into())
        .await
        .unwrap();
    let done = wait_terminal(&agent.service, second.name.as_str(), Duration::from_secs(10)).await;
    assert_eq!(done.state, TaskState::Succeeded);

    let creations = agent
        .metrics
        .instance_creations
        .with_label_values(&["agent-test", "functions/foo"])
        .get();
    assert_eq!(creations, 1, "repeated hints must not spawn extra instances");

    agent.token.cancel();
    agent.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_while_pending_ends_canceled_or_succeeded() {
    let agent = start_agent(test_config()).await;

    let created = agent
        .service
        .create_task("functions/foo", r#"{"execution_time_ms": 50}"#.into())
        .await
        .unwrap();

    // Race the agent: both orders are valid, the record just has to end
    // terminal with the result invariant intact.
    match agent.service.cancel_task(created.name.as_str()).await {
        Ok(task) => assert_eq!(task.state, TaskState::Canceled),
        Err(Error::AlreadyCompleted) | Err(Error::CannotCancel) => {}
        Err(e) => panic!("unexpected cancel error: {e}"),
    }

    let done = wait_terminal(&agent.service, created.name.as_str(), Duration::from_secs(10)).await;
    match done.state {
        TaskState::Canceled => assert!(done.result.is_none(), "canceled carries no result"),
        TaskState::Succeeded => assert!(done.result.is_some()),
        other => panic!("unexpected terminal state: {other:?}"),
    }

    agent.token.cancel();
    agent.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn capacity_pressure_backs_off_until_an_instance_expires() {
    let mut cfg = test_config();
    cfg.instances.max = 1;
    cfg.instances.lifetime = Duration::from_secs(4);
    // Enough attempts to keep b's message alive across a's whole lifetime.
    cfg.consumer.max_deliver = 10;
    let agent = start_agent(cfg).await;

    let a = agent
        .service
        .create_task("functions/a", r#"{"execution_time_ms": 10}"#.into())
        .await
        .unwrap();
    let done = wait_terminal(&agent.service, a.name.as_str(), Duration::from_secs(10)).await;
    assert_eq!(done.state, TaskState::Succeeded);

    // b cannot get an instance while a's is alive; its message is naked
    // and redelivered until a's instance expires.
    let b = agent
        .service
        .create_task("functions/b", r#"{"execution_time_ms": 10}"#.into())
        .await
        .unwrap();
    let done = wait_terminal(&agent.service, b.name.as_str(), Duration::from_secs(15)).await;
    assert_eq!(done.state, TaskState::Succeeded);

    let capacity_rejections = agent
        .metrics
        .messages_failed
        .with_label_values(&["agent-test", "functions/b", "capacity"])
        .get();
    assert!(
        capacity_rejections >= 1,
        "expected at least one capacity rejection, saw {capacity_rejections}"
    );

    agent.token.cancel();
    agent.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn poison_message_is_dead_lettered_after_max_deliver() {
    let agent = start_agent(test_config()).await;

    // An unparseable payload straight onto the function queue, plus the
    // hint that wakes the consumer up.
    agent
        .broker
        .publish("task.functions/foo", b"definitely not json")
        .await
        .unwrap();
    agent
        .broker
        .publish("task.hints", b"functions/foo")
        .await
        .unwrap();

    let unmarshal_failures = wait_for(Duration::from_secs(20), || async {
        let n = agent
            .metrics
            .messages_failed
            .with_label_values(&["agent-test", "functions/foo", "unmarshal"])
            .get();
        (n >= 5).then_some(n)
    })
    .await;
    assert_eq!(unmarshal_failures, 5, "exactly max_deliver nak attempts");

    // Dead-lettered: the count stays put.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let after = agent
        .metrics
        .messages_failed
        .with_label_values(&["agent-test", "functions/foo", "unmarshal"])
        .get();
    assert_eq!(after, 5);

    agent.token.cancel();
    agent.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn graceful_shutdown_cancels_in_flight_tasks() {
    let mut cfg = test_config();
    cfg.instances.max = 10;
    cfg.consumer.ack_wait = Duration::from_secs(60);
    cfg.grace = Duration::from_secs(10);
    let agent = start_agent(cfg).await;

    // Ten long-running tasks across ten functions, all in flight at once.
    let mut names = Vec::new();
    for i in 0..10 {
        let task = agent
            .service
            .create_task(
                &format!("functions/f{i}"),
                r#"{"execution_time_ms": 60000}"#.into(),
            )
            .await
            .unwrap();
        names.push(task.name.as_str().to_string());
    }

    // Wait until every record is claimed.
    for name in &names {
        let service = agent.service.clone();
        wait_for(Duration::from_secs(25), || {
            let service = service.clone();
            let name = name.clone();
            async move {
                let task = service.get_task(&name).await.unwrap();
                (task.state == TaskState::Processing).then_some(())
            }
        })
        .await;
    }

    agent.token.cancel();
    tokio::time::timeout(Duration::from_secs(15), agent.handle)
        .await
        .expect("supervisor exited within the shutdown deadline")
        .unwrap()
        .unwrap();

    for name in &names {
        let task = agent.service.get_task(name).await.unwrap();
        assert_eq!(task.state, TaskState::Canceled, "task {name}");
        assert!(task.result.is_none());
        assert!(task.ended_at.is_some());
    }
}

#[tokio::test]
async fn list_paginates_250_records() {
    let kv = Arc::new(MemoryKv::new());
    let store = TaskStore::new(kv);

    let mut names = Vec::new();
    for _ in 0..250 {
        let task = Task::new(
            funcvisor::FunctionName::parse("functions/foo").unwrap(),
            "{}",
        );
        store.create(&task).await.unwrap();
        names.push(task.name.as_str().to_string());
    }
    names.sort();

    let first = store.list(100, "").await.unwrap();
    assert_eq!(first.tasks.len(), 100);
    assert_eq!(first.next_page_token, names[99]);

    let second = store.list(100, &first.next_page_token).await.unwrap();
    assert_eq!(second.tasks.len(), 100);
    assert_eq!(second.next_page_token, names[199]);

    let third = store.list(100, &second.next_page_token).await.unwrap();
    assert_eq!(third.tasks.len(), 50);
    assert!(third.next_page_token.is_empty());

    let listed: Vec<String> = first
        .tasks
        .iter()
        .chain(second.tasks.iter())
        .chain(third.tasks.iter())
        .map(|t| t.name.as_str().to_string())
        .collect();
    assert_eq!(listed, names);
}
