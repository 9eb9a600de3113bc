//! End-to-end scheduler behavior through the public API.

use jobwheel::{
    App, Cron, Error, JobStatus, JobStore, MemoryStore, Message, RouteOptions, Router, RunMode,
    TaskError,
};
use jobwheel::store::{AtArguments, ScheduledJob};
use jobwheel::serialize::JsonSerializer;
use jobwheel::worker::{LocalLauncher, Registry};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn memory_app() -> (App, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let app = App::builder().store(store.clone()).build();
    (app, store)
}

async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test timed out")
}

#[tokio::test]
async fn test_blocking_route_delay_zero() {
    let (app, _store) = memory_app();
    let f1 = app
        .register_blocking("f1", RouteOptions::default(), |n: i64, _ctx| Ok(n + 1))
        .unwrap();

    app.startup().await.unwrap();
    let job = f1.schedule(1).unwrap().delay(0.0).await.unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(job.result().unwrap(), json!(2));
    assert_eq!(job.status(), JobStatus::Success);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_async_route_at_now() {
    let (app, _store) = memory_app();
    let f2 = app
        .register_async("f2", RouteOptions::default(), |n: i64, _ctx| async move {
            Ok(n + 1)
        })
        .unwrap();

    app.startup().await.unwrap();
    let now = Utc::now();
    let job = f2
        .schedule(2)
        .unwrap()
        .with_now(now)
        .at(now)
        .await
        .unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(job.result().unwrap(), json!(3));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_process_route_runs_on_worker() {
    let mut registry = Registry::new();
    registry.register("f1", |n: i64| Ok(n + 1));

    let app = App::builder()
        .store(Arc::new(MemoryStore::new()))
        .worker_launcher(Arc::new(LocalLauncher::new(Arc::new(registry))))
        .build();
    let f1 = app
        .register_blocking(
            "f1",
            RouteOptions::default().run_mode(RunMode::Process),
            |n: i64, _ctx| Ok(n + 1),
        )
        .unwrap();

    app.startup().await.unwrap();
    let job = f1.schedule(3).unwrap().delay(0.0).await.unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(job.result().unwrap(), json!(4));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_cron_stops_after_max_failures() {
    let (app, store) = memory_app();
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();
    let amock = app
        .register_async(
            "amock",
            RouteOptions::default().max_cron_failures(1),
            move |(): (), _ctx| {
                let calls = handler_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(TaskError::failed("value_error", "boom"))
                }
            },
        )
        .unwrap();

    app.startup().await.unwrap();
    let job = amock
        .schedule(())
        .unwrap()
        .cron("* * * * * * *")
        .await
        .unwrap();
    with_timeout(job.wait()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!job.should_reschedule(1));
    assert_eq!(job.status(), JobStatus::Error);

    // The cron was not re-armed, so no persisted record remains.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get_schedules().await.unwrap().is_empty());

    // Give a second tick a chance to prove nothing re-fired.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_negative_delay_rejected() {
    let (app, _store) = memory_app();
    let f1 = app
        .register_blocking("f1", RouteOptions::default(), |n: i64, _ctx| Ok(n + 1))
        .unwrap();

    app.startup().await.unwrap();
    let job = f1.schedule(1).unwrap().delay(0.0).await.unwrap();
    with_timeout(job.wait()).await;

    let error = f1.schedule(2).unwrap().delay(-1.0).await.unwrap_err();
    match error {
        Error::NegativeDelay { delay_seconds } => assert_eq!(delay_seconds, -1.0),
        other => panic!("unexpected error: {other}"),
    }
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nested_router_prefixes() {
    let mut level2 = Router::new("level2");
    let f2 = level2
        .register_async("test2", RouteOptions::default(), |(): (), _ctx| async {
            Ok("test")
        })
        .unwrap();

    let mut level1 = Router::new("level1");
    level1.include_router(level2);

    let (app, _store) = memory_app();
    app.include_router(level1).unwrap();
    assert_eq!(f2.name().unwrap(), "level1:level2:test2");

    app.startup().await.unwrap();
    let job = f2.schedule(()).unwrap().delay(0.0).await.unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(job.result().unwrap(), json!("test"));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_application_state_errors() {
    let (app, _store) = memory_app();
    let f = app
        .register_blocking("f", RouteOptions::default(), |(): (), _ctx| Ok(()))
        .unwrap();

    let error = f.schedule(()).unwrap_err();
    assert_eq!(
        error.to_string(),
        "cannot \"schedule\" - application must be \"started\", \
         but is currently \"not started\""
    );

    app.startup().await.unwrap();

    let error = app
        .register_blocking("g", RouteOptions::default(), |(): (), _ctx| Ok(()))
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        "cannot \"register\" - application must be \"not started\", \
         but is currently \"started\""
    );

    struct Noop;
    #[async_trait::async_trait]
    impl jobwheel::Middleware for Noop {
        async fn handle(
            &self,
            ctx: &jobwheel::JobContext,
            next: jobwheel::Next<'_>,
        ) -> Result<Value, TaskError> {
            next.run(ctx).await
        }
    }
    let error = app.add_middleware(Noop).unwrap_err();
    assert!(error.to_string().contains("\"add_middleware\""));

    let error = app
        .add_error_handler("boom", |error| async move { Err::<Value, _>(error) })
        .unwrap_err();
    assert!(error.to_string().contains("\"add_exception_handler\""));

    // Startup twice errors, shutdown twice is a no-op.
    assert!(app.startup().await.is_err());
    app.shutdown().await.unwrap();
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_durable_record_lifecycle() {
    let (app, store) = memory_app();
    let f = app
        .register_blocking("f", RouteOptions::default(), |(): (), _ctx| Ok("done"))
        .unwrap();

    app.startup().await.unwrap();
    let job = f.schedule(()).unwrap().delay(0.3).await.unwrap();

    let records = store.get_schedules().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, job.id());
    assert_eq!(records[0].func_name, "f");

    with_timeout(job.wait()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get_schedules().await.unwrap().is_empty());
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_non_durable_route_skips_store() {
    let (app, store) = memory_app();
    let f = app
        .register_blocking(
            "f",
            RouteOptions::default().durable(false),
            |(): (), _ctx| Ok(()),
        )
        .unwrap();

    app.startup().await.unwrap();
    let job = f.schedule(()).unwrap().delay(0.3).await.unwrap();
    assert!(store.get_schedules().await.unwrap().is_empty());
    with_timeout(job.wait()).await;
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cron_rescheduling_increases_exec_at() {
    let (app, _store) = memory_app();
    let greet = app
        .register_blocking("greet", RouteOptions::default(), |name: String, _ctx| {
            Ok(format!("hello, {name}!"))
        })
        .unwrap();

    app.startup().await.unwrap();
    let job = greet
        .schedule("Biba")
        .unwrap()
        .cron("* * * * * * *")
        .await
        .unwrap();

    let first_exec_at = job.exec_at();
    let first_id = job.id();
    with_timeout(job.wait()).await;
    let second_exec_at = job.exec_at();

    assert_eq!(job.result().unwrap(), json!("hello, Biba!"));
    assert!(second_exec_at > first_exec_at);
    assert_ne!(job.id(), first_id);
    assert!(job.should_reschedule(1));

    with_timeout(job.wait()).await;
    assert!(job.exec_at() > second_exec_at);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cron_max_runs_bound() {
    let (app, _store) = memory_app();
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();
    let tick = app
        .register_blocking("tick", RouteOptions::default(), move |(): (), _ctx| {
            Ok(handler_calls.fetch_add(1, Ordering::SeqCst) + 1)
        })
        .unwrap();

    app.startup().await.unwrap();
    let job = tick
        .schedule(())
        .unwrap()
        .cron(Cron::new("* * * * * * *").with_max_runs(1))
        .await
        .unwrap();
    with_timeout(job.wait()).await;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_scheduled_job() {
    let (app, store) = memory_app();
    let f = app
        .register_blocking("f", RouteOptions::default(), |(): (), _ctx| Ok(()))
        .unwrap();

    app.startup().await.unwrap();
    let job = f.schedule(()).unwrap().delay(30.0).await.unwrap();
    assert_eq!(store.get_schedules().await.unwrap().len(), 1);

    job.cancel().await.unwrap();
    assert_eq!(job.status(), JobStatus::Canceled);
    assert!(store.get_schedules().await.unwrap().is_empty());
    assert!(matches!(job.result(), Err(Error::JobNotCompleted)));
    // Waiters resume after cancellation; cancel is idempotent.
    with_timeout(job.wait()).await;
    job.cancel().await.unwrap();
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_until_success() {
    let (app, _store) = memory_app();
    let attempts = Arc::new(AtomicU32::new(0));
    let handler_attempts = attempts.clone();
    let flaky = app
        .register_blocking(
            "flaky",
            RouteOptions::default().retry(3),
            move |(): (), _ctx| {
                let attempt = handler_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    Err(TaskError::failed("flaky", "not yet"))
                } else {
                    Ok(attempt)
                }
            },
        )
        .unwrap();

    app.startup().await.unwrap();
    let job = flaky.schedule(()).unwrap().delay(0.0).await.unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(job.result().unwrap(), json!(3));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_marks_job_timed_out() {
    let (app, _store) = memory_app();
    let slow = app
        .register_async(
            "slow",
            RouteOptions::default().timeout(Duration::from_millis(100)),
            |(): (), _ctx| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            },
        )
        .unwrap();

    app.startup().await.unwrap();
    let job = slow.schedule(()).unwrap().delay(0.0).await.unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(job.status(), JobStatus::Timeout);
    assert_eq!(job.error().unwrap().code(), "timeout");
    assert!(matches!(job.result(), Err(Error::JobFailed { .. })));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_handler_maps_failure_to_success() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let app = App::builder()
        .store(store)
        .error_handler("value_error", |_error| async {
            Ok::<_, TaskError>(json!("recovered"))
        })
        .build();
    let f = app
        .register_blocking("f", RouteOptions::default(), |(): (), _ctx| {
            Err::<Value, _>(TaskError::failed("value_error", "boom"))
        })
        .unwrap();

    app.startup().await.unwrap();
    let job = f.schedule(()).unwrap().delay(0.0).await.unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(job.status(), JobStatus::Success);
    assert_eq!(job.result().unwrap(), json!("recovered"));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registration_is_idempotent_by_name() {
    let (app, _store) = memory_app();
    let first = app
        .register_blocking("dup", RouteOptions::default(), |(): (), _ctx| Ok("first"))
        .unwrap();
    let second = app
        .register_blocking("dup", RouteOptions::default(), |(): (), _ctx| Ok("second"))
        .unwrap();
    assert_eq!(first.name(), second.name());

    app.startup().await.unwrap();
    // The second registration was ignored; the original handler runs.
    let job = second.schedule(()).unwrap().delay(0.0).await.unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(job.result().unwrap(), json!("first"));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_job_id_rejected() {
    let (app, _store) = memory_app();
    let f = app
        .register_blocking("f", RouteOptions::default(), |(): (), _ctx| Ok(()))
        .unwrap();

    app.startup().await.unwrap();
    let _job = f
        .schedule(())
        .unwrap()
        .with_job_id("fixed")
        .delay(30.0)
        .await
        .unwrap();
    let error = f
        .schedule(())
        .unwrap()
        .with_job_id("fixed")
        .delay(30.0)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::DuplicateJobId { .. }));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rearming_builder_preserves_job_id() {
    let (app, _store) = memory_app();
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();
    let f = app
        .register_blocking("f", RouteOptions::default(), move |(): (), _ctx| {
            Ok(handler_calls.fetch_add(1, Ordering::SeqCst) + 1)
        })
        .unwrap();

    app.startup().await.unwrap();
    let mut builder = f.schedule(()).unwrap();
    let slow = builder.delay(30.0).await.unwrap();
    let first_id = slow.id();
    let fast = builder.delay(0.05).await.unwrap();
    assert_eq!(fast.id(), first_id);

    with_timeout(fast.wait()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    // The first timer was canceled; the handler ran exactly once.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hooks_run_before_wait_resumes() {
    let (app, _store) = memory_app();
    let f = app
        .register_blocking("f", RouteOptions::default(), |n: i64, _ctx| Ok(n * 2))
        .unwrap();

    app.startup().await.unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let hook_seen = seen.clone();
    let job = f
        .schedule(21)
        .unwrap()
        .on_success(move |value| {
            hook_seen.lock().unwrap().push(value.clone());
        })
        .delay(0.0)
        .await
        .unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(seen.lock().unwrap().as_slice(), &[json!(42)]);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_hook_receives_task_error() {
    let (app, _store) = memory_app();
    let f = app
        .register_blocking("f", RouteOptions::default(), |(): (), _ctx| {
            Err::<Value, _>(TaskError::failed("boom", "nope"))
        })
        .unwrap();

    app.startup().await.unwrap();
    let codes = Arc::new(std::sync::Mutex::new(Vec::new()));
    let hook_codes = codes.clone();
    let job = f
        .schedule(())
        .unwrap()
        .on_error(move |error| {
            hook_codes.lock().unwrap().push(error.code().to_string());
        })
        .delay(0.0)
        .await
        .unwrap();
    with_timeout(job.wait()).await;
    assert_eq!(codes.lock().unwrap().as_slice(), &["boom".to_string()]);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_auto_cron_route_fires_after_startup() {
    let (app, _store) = memory_app();
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();
    app.register_blocking(
        "heartbeat",
        RouteOptions::default().cron("* * * * * * *"),
        move |_args: Value, _ctx| Ok(handler_calls.fetch_add(1, Ordering::SeqCst) + 1),
    )
    .unwrap();

    app.startup().await.unwrap();
    with_timeout(async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recovery_runs_past_due_persisted_job() {
    let store = Arc::new(MemoryStore::new());
    let (tx, mut rx) = tokio::sync::mpsc::channel::<i64>(1);

    // A record left behind by a previous process, already past due.
    let past = Utc::now() - chrono::Duration::seconds(30);
    let message = Message {
        route_name: "recover:ping".into(),
        job_id: "recov1".into(),
        arguments: json!(5),
        cron: None,
        at: Some(AtArguments {
            when: past,
            job_id: "recov1".into(),
            now: past,
        }),
    };
    store
        .add_schedule(ScheduledJob {
            job_id: "recov1".into(),
            func_name: "recover:ping".into(),
            message: message.encode(&JsonSerializer).unwrap(),
            status: JobStatus::Scheduled,
        })
        .await
        .unwrap();

    let app = App::builder().store(store.clone()).build();
    app.register_async(
        "recover:ping",
        RouteOptions::default(),
        move |n: i64, _ctx| {
            let tx = tx.clone();
            async move {
                tx.send(n).await.ok();
                Ok(n)
            }
        },
    )
    .unwrap();

    app.startup().await.unwrap();
    let received = with_timeout(rx.recv()).await;
    assert_eq!(received, Some(5));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get_schedules().await.unwrap().is_empty());
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_wakes_pending_waiters() {
    let (app, store) = memory_app();
    let f = app
        .register_blocking("f", RouteOptions::default(), |(): (), _ctx| Ok(()))
        .unwrap();

    app.startup().await.unwrap();
    let job = f.schedule(()).unwrap().delay(30.0).await.unwrap();
    let waiter = tokio::spawn({
        let job = job.clone();
        async move { job.wait().await }
    });

    app.shutdown().await.unwrap();
    with_timeout(async { waiter.await.unwrap() }).await;
    // The job never ran; its record survives for the next startup.
    assert_eq!(store.get_schedules().await.unwrap().len(), 1);
    assert!(matches!(job.result(), Err(Error::JobNotCompleted)));
}

#[tokio::test]
async fn test_worker_registry_exports_blocking_routes() {
    let (app, _store) = memory_app();
    app.register_blocking("f", RouteOptions::default(), |n: i64, _ctx| Ok(n + 1))
        .unwrap();
    app.register_async("g", RouteOptions::default(), |(): (), _ctx| async { Ok(()) })
        .unwrap();

    let registry = app.worker_registry();
    assert!(registry.is_registered("f"));
    // Async routes never run out of process.
    assert!(!registry.is_registered("g"));
}
