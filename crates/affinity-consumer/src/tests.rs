use super::*;
use affinity_broker::{
    InMemoryBroker, QueueOptions, ReceivedMessage, SessionBroker, SettlementOutcome,
};
use bytes::Bytes;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const ENV_KEYS: &[&str] = &[
    "AFFINITY_MAX_CONCURRENT_SESSIONS",
    "AFFINITY_MAX_CALLS_PER_SESSION",
    "AFFINITY_SESSION_IDS",
    "AFFINITY_IDLE_TIMEOUT_MS",
    "AFFINITY_RENEWAL_MARGIN_MS",
    "AFFINITY_ACCEPT_TIMEOUT_MS",
    "AFFINITY_RECEIVE_WAIT_MS",
    "AFFINITY_RETRY_MAX_ATTEMPTS",
    "AFFINITY_RETRY_BASE_MS",
    "AFFINITY_RETRY_MAX_MS",
    "AFFINITY_CONSUMER_CONFIG",
];

// Clears the consumer env vars for the test and restores them afterwards.
struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    fn new() -> Self {
        let saved = ENV_KEYS
            .iter()
            .map(|key| (*key, std::env::var(key).ok()))
            .collect();
        for key in ENV_KEYS {
            unsafe { std::env::remove_var(key) };
        }
        Self { saved }
    }

    fn set(&self, key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) };
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            unsafe {
                match value {
                    Some(value) => std::env::set_var(key, value),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}

#[test]
#[serial_test::serial]
fn options_from_env_overlay_defaults() {
    let env = EnvGuard::new();
    env.set("AFFINITY_MAX_CONCURRENT_SESSIONS", "5");
    env.set("AFFINITY_MAX_CALLS_PER_SESSION", "2");
    env.set("AFFINITY_SESSION_IDS", "session-1, session-2,,");
    env.set("AFFINITY_IDLE_TIMEOUT_MS", "1500");
    env.set("AFFINITY_RETRY_MAX_ATTEMPTS", "7");

    let options = SessionProcessorOptions::from_env();
    assert_eq!(options.max_concurrent_sessions, 5);
    assert_eq!(options.max_concurrent_calls_per_session, 2);
    assert_eq!(
        options.session_ids,
        Some(vec!["session-1".to_string(), "session-2".to_string()])
    );
    assert_eq!(options.idle_timeout, Duration::from_millis(1500));
    assert_eq!(options.retry.max_attempts, 7);
    assert_eq!(options.receive_wait, config::DEFAULT_RECEIVE_WAIT);
}

#[test]
#[serial_test::serial]
fn zero_and_garbage_env_values_are_ignored() {
    let env = EnvGuard::new();
    env.set("AFFINITY_MAX_CONCURRENT_SESSIONS", "0");
    env.set("AFFINITY_RENEWAL_MARGIN_MS", "soon");
    env.set("AFFINITY_SESSION_IDS", " , ");

    let options = SessionProcessorOptions::from_env();
    assert_eq!(
        options.max_concurrent_sessions,
        config::DEFAULT_MAX_CONCURRENT_SESSIONS
    );
    assert_eq!(options.renewal_margin, config::DEFAULT_RENEWAL_MARGIN);
    assert_eq!(options.session_ids, None);
}

#[test]
#[serial_test::serial]
fn yaml_overrides_env() {
    let env = EnvGuard::new();
    env.set("AFFINITY_MAX_CONCURRENT_SESSIONS", "5");
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(
        file,
        "max_concurrent_sessions: 3\nsession_ids: [A, B]\nreceive_wait_ms: 200\nqueue: ignored-here"
    )
    .expect("write");
    env.set(
        "AFFINITY_CONSUMER_CONFIG",
        file.path().to_str().expect("utf-8 path"),
    );

    let options = SessionProcessorOptions::from_env_or_yaml(None).expect("load");
    assert_eq!(options.max_concurrent_sessions, 3);
    assert_eq!(options.session_ids, Some(vec!["A".into(), "B".into()]));
    assert_eq!(options.receive_wait, Duration::from_millis(200));
}

#[test]
#[serial_test::serial]
fn explicit_path_wins_and_missing_file_errors() {
    let _env = EnvGuard::new();
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "max_concurrent_calls_per_session: 4").expect("write");
    let options = SessionProcessorOptions::from_env_or_yaml(Some(file.path())).expect("load");
    assert_eq!(options.max_concurrent_calls_per_session, 4);

    let err = SessionProcessorOptions::from_env_or_yaml(Some(std::path::Path::new(
        "/nonexistent/affinity.yaml",
    )))
    .expect_err("missing file");
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
#[serial_test::serial]
fn malformed_yaml_is_a_parse_error() {
    let _env = EnvGuard::new();
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "max_concurrent_sessions: [not, a, number]").expect("write");
    let err =
        SessionProcessorOptions::from_env_or_yaml(Some(file.path())).expect_err("bad yaml");
    assert!(matches!(err, ConfigError::Parse(_)));
}

struct CompleteAll;

#[async_trait::async_trait]
impl MessageHandler for CompleteAll {
    async fn handle(
        &self,
        _ctx: &SessionContext,
        _message: &ReceivedMessage,
    ) -> anyhow::Result<Settlement> {
        Ok(Settlement::Complete)
    }
}

fn broker() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_queue("q", QueueOptions::default());
    broker
}

#[tokio::test]
async fn start_rejects_invalid_options() {
    let broker = broker();
    let engine = ConsumptionEngine::builder(broker, "q")
        .options(SessionProcessorOptions {
            max_concurrent_calls_per_session: 0,
            ..SessionProcessorOptions::default()
        })
        .handler(Arc::new(CompleteAll))
        .build()
        .expect("build");
    let err = engine.start(Shutdown::new()).err().expect("config error");
    assert!(matches!(err, EngineError::Configuration(_)));
}

#[tokio::test]
async fn start_rejects_empty_filter() {
    let engine = ConsumptionEngine::builder(broker(), "q")
        .options(SessionProcessorOptions::default().with_session_ids(Vec::<String>::new()))
        .handler(Arc::new(CompleteAll))
        .build()
        .expect("build");
    assert!(matches!(
        engine.start(Shutdown::new()),
        Err(EngineError::Configuration(ConfigError::Invalid {
            field: "session_ids",
            ..
        }))
    ));
}

#[test]
fn build_requires_handler() {
    let result = ConsumptionEngine::builder(broker(), "q").build();
    assert!(matches!(
        result,
        Err(EngineError::Configuration(ConfigError::MissingHandler))
    ));
}

#[tokio::test(start_paused = true)]
async fn engine_starts_once() {
    let engine = ConsumptionEngine::builder(broker(), "q")
        .handler(Arc::new(CompleteAll))
        .build()
        .expect("build");
    let handle = engine.start(Shutdown::new()).expect("start");
    assert!(matches!(
        engine.start(Shutdown::new()),
        Err(EngineError::AlreadyStarted)
    ));
    handle.stop_and_wait().await.expect("stop");
}

#[tokio::test]
async fn shutdown_signal_is_shared_by_clones() {
    let shutdown = Shutdown::new();
    let clone = shutdown.clone();
    assert!(!clone.is_cancelled());
    let waiter = tokio::spawn(async move { clone.cancelled().await });
    shutdown.trigger();
    waiter.await.expect("join");
    assert!(shutdown.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn dispatcher_exits_idle_after_draining() {
    let broker = broker();
    broker.send("q", "s1", Bytes::from_static(b"1")).expect("send");
    let policy = Arc::new(ErrorPolicy::new(
        RetryPolicy::default(),
        Arc::new(TracingSink),
    ));
    let leases = SessionLeaseManager::new(
        broker.clone(),
        "q",
        None,
        Duration::from_secs(10),
        policy.clone(),
    );
    let session = leases
        .acquire_next(Duration::from_millis(10))
        .await
        .expect("acquire")
        .expect("session");
    let dispatcher = MessageDispatcher::new(
        broker.clone(),
        Arc::new(CompleteAll),
        policy,
        1,
        Duration::from_millis(300),
        Duration::from_millis(100),
    );
    let ctx = SessionContext::new(&session, SessionStateStore::new(broker.clone()));
    let slot = Arc::new(WorkerSlot::new(0));
    let exit = dispatcher
        .run(&session, &ctx, &slot, &Shutdown::new())
        .await;
    assert_eq!(exit, DispatchExit::IdleTimeout);
    assert_eq!(broker.pending_messages("q", "s1").expect("pending"), 0);
    assert_eq!(slot.peak_in_flight(), 1);
    leases.release(&session).await.expect("release");
}

#[tokio::test(start_paused = true)]
async fn dispatcher_stops_on_expired_lock() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_queue(
        "q",
        QueueOptions {
            lock_duration: Duration::from_millis(300),
            ..QueueOptions::default()
        },
    );
    broker.send("q", "s1", Bytes::from_static(b"1")).expect("send");
    let policy = Arc::new(ErrorPolicy::new(
        RetryPolicy::default(),
        Arc::new(TracingSink),
    ));
    let leases = SessionLeaseManager::new(
        broker.clone(),
        "q",
        None,
        Duration::from_millis(50),
        policy.clone(),
    );
    let session = leases
        .acquire_next(Duration::from_millis(10))
        .await
        .expect("acquire")
        .expect("session");
    broker.withhold_renewals("s1");
    let dispatcher = MessageDispatcher::new(
        broker.clone(),
        Arc::new(CompleteAll),
        policy,
        1,
        Duration::from_secs(60),
        Duration::from_millis(100),
    );
    let ctx = SessionContext::new(&session, SessionStateStore::new(broker.clone()));
    let exit = dispatcher
        .run(&session, &ctx, &Arc::new(WorkerSlot::new(0)), &Shutdown::new())
        .await;
    assert_eq!(exit, DispatchExit::LeaseLost);
    assert!(!session.is_held());
    broker.close_session(session.handle()).await.expect("close");
}

fn dispatcher_fixture(
    broker: &Arc<InMemoryBroker>,
    sink: Arc<crate::policy::tests::RecordingSink>,
) -> (SessionLeaseManager, Arc<ErrorPolicy>) {
    let policy = Arc::new(ErrorPolicy::new(RetryPolicy::default(), sink));
    let leases = SessionLeaseManager::new(
        broker.clone(),
        "q",
        None,
        Duration::from_secs(10),
        policy.clone(),
    );
    (leases, policy)
}

#[tokio::test(start_paused = true)]
async fn session_fault_abandons_other_in_flight_messages() {
    let broker = broker();
    broker.send("q", "s1", Bytes::from_static(b"fast")).expect("send");
    broker.send("q", "s1", Bytes::from_static(b"slow")).expect("send");
    broker.inject_complete_failures(1);
    let sink = Arc::new(crate::policy::tests::RecordingSink::default());
    let (leases, policy) = dispatcher_fixture(&broker, sink.clone());
    let session = leases
        .acquire_next(Duration::from_millis(10))
        .await
        .expect("acquire")
        .expect("session");

    // Both calls are in flight before either settles.
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let handler = handler_fn(move |_ctx, message: ReceivedMessage| {
        let barrier = barrier.clone();
        async move {
            barrier.wait().await;
            if &message.body[..] == b"slow" {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            Ok(Settlement::Complete)
        }
    });
    let dispatcher = MessageDispatcher::new(
        broker.clone(),
        Arc::new(handler),
        policy,
        2,
        Duration::from_secs(60),
        Duration::from_millis(100),
    );
    let ctx = SessionContext::new(&session, SessionStateStore::new(broker.clone()));
    let exit = dispatcher
        .run(&session, &ctx, &Arc::new(WorkerSlot::new(0)), &Shutdown::new())
        .await;
    assert_eq!(exit, DispatchExit::SessionFault);

    let settled: Vec<_> = broker
        .settlements("q")
        .expect("settlements")
        .iter()
        .map(|record| (record.sequence, record.outcome))
        .collect();
    assert_eq!(settled, vec![(1, SettlementOutcome::Abandoned)]);
    let errors = sink.errors.lock().clone();
    assert!(errors.iter().any(|error| {
        error.kind == FailureKind::SessionFatal && error.source == ErrorSource::Complete
    }));
    leases.release(&session).await.expect("release");
    assert_eq!(broker.pending_messages("q", "s1").expect("pending"), 2);
}

#[tokio::test(start_paused = true)]
async fn lock_expiring_under_a_handler_ends_in_lease_lost() {
    let broker = broker();
    broker.send("q", "s1", Bytes::from_static(b"1")).expect("send");
    let sink = Arc::new(crate::policy::tests::RecordingSink::default());
    let (leases, policy) = dispatcher_fixture(&broker, sink);
    let session = leases
        .acquire_next(Duration::from_millis(10))
        .await
        .expect("acquire")
        .expect("session");

    let started = Arc::new(tokio::sync::Notify::new());
    let handler = {
        let started = started.clone();
        handler_fn(move |_ctx, _message| {
            let started = started.clone();
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Settlement::Complete)
            }
        })
    };
    let dispatcher = MessageDispatcher::new(
        broker.clone(),
        Arc::new(handler),
        policy,
        1,
        Duration::from_secs(60),
        Duration::from_millis(100),
    );
    let ctx = SessionContext::new(&session, SessionStateStore::new(broker.clone()));
    let slot = Arc::new(WorkerSlot::new(0));
    let shutdown = Shutdown::new();
    let run = dispatcher.run(&session, &ctx, &slot, &shutdown);
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => panic!("dispatcher exited before the handler started"),
        _ = started.notified() => {}
    }
    broker.expire_lock("q", "s1").expect("expire");

    assert_eq!(run.await, DispatchExit::LeaseLost);
    assert!(broker.settlements("q").expect("settlements").is_empty());
    assert_eq!(broker.pending_messages("q", "s1").expect("pending"), 1);
    leases.release(&session).await.ok();
}
