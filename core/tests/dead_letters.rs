use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Notify;
use upstream_guard::{
    BreakerConfig, CallContext, DeadLetterError, DeadLetterFilter, DeadLetterQueue,
    DeadLetterStatus, Fault, FaultKind, Guard, GuardError, HealthConfig, ProtectError, RetryPolicy,
};

fn guard_at(path: &std::path::Path) -> Guard {
    let guard = Guard::builder()
        .dead_letters(DeadLetterQueue::open_file(path).expect("open dead letter file"))
        .build();
    guard
        .register_target(
            "billing",
            RetryPolicy::no_retry(),
            BreakerConfig::default(),
            HealthConfig::default(),
        )
        .expect("registered");
    guard
}

#[tokio::test(start_paused = true)]
async fn exhausted_request_survives_restart_and_replays() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dead_letters.json");

    let id = {
        let guard = guard_at(&path);
        let ctx = CallContext::new()
            .with_request_id("invoice-42")
            .with_payload(json!({"invoice": 42, "amount": 1999}));
        let err = guard
            .protect("billing", || async { Err::<(), _>(Fault::status(503)) }, &ctx)
            .await
            .expect_err("upstream down");

        let ProtectError::Exhausted(failure) = err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(failure.fault.kind, FaultKind::Network);
        failure.dead_letter_id.expect("dead-lettered")
    };

    // A fresh guard over the same file sees the entry
    let guard = guard_at(&path);
    let pending = guard
        .list_dead_letters(&DeadLetterFilter::pending())
        .expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].request_id, "invoice-42");
    assert_eq!(pending[0].attempts, 1);

    // A failing replay folds into the same entry
    let err = guard
        .reprocess_dead_letter(id, |_payload| async { Err::<(), _>(Fault::status(503)) })
        .await
        .expect_err("still down");
    assert!(matches!(err, GuardError::Protect(ProtectError::Exhausted(_))));

    let stats = guard.dead_letter_stats().expect("stats");
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 1);
    let entry = &guard.list_dead_letters(&DeadLetterFilter::default()).expect("list")[0];
    assert_eq!(entry.replays, 1);
    assert_eq!(entry.attempts, 2);

    let seen = AtomicU32::new(0);
    let replayed = guard
        .reprocess_dead_letter(id, |payload: Value| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Fault>(payload["invoice"].as_u64()) }
        })
        .await
        .expect("replay succeeds");
    assert_eq!(replayed, Some(42));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // Status is durable across another restart
    drop(guard);
    let guard = guard_at(&path);
    let stats = guard.dead_letter_stats().expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.reprocessed, 1);

    let err = guard
        .reprocess_dead_letter(id, |_payload| async { Ok::<_, Fault>(()) })
        .await
        .expect_err("already reprocessed");
    assert!(matches!(err, GuardError::DeadLetter(_)));
}

#[tokio::test]
async fn discard_and_purge() {
    let guard = Guard::builder().build();
    guard
        .register_target(
            "billing",
            RetryPolicy::no_retry(),
            BreakerConfig::default(),
            HealthConfig::default(),
        )
        .expect("registered");

    let mut ids = Vec::new();
    for n in 0..2 {
        let ctx = CallContext::new().with_payload(json!({ "n": n }));
        let err = guard
            .protect("billing", || async { Err::<(), _>(Fault::status(400)) }, &ctx)
            .await
            .expect_err("validation failure");
        let ProtectError::Exhausted(failure) = err else {
            panic!("expected exhaustion");
        };
        ids.push(failure.dead_letter_id.expect("dead-lettered"));
    }

    guard.discard_dead_letter(ids[0]).expect("discard");
    let purged = guard.purge_dead_letter(ids[1]).expect("purge");
    assert_eq!(purged.request, json!({ "n": 1 }));
    assert_eq!(purged.status, DeadLetterStatus::Pending);

    let stats = guard.dead_letter_stats().expect("stats");
    assert_eq!(stats.total, 1);
    assert_eq!(stats.discarded, 1);
    assert!(guard.list_dead_letters(&DeadLetterFilter::pending()).expect("list").is_empty());
}

#[tokio::test]
async fn guard_without_queue_reports_it() {
    let guard = Guard::builder().without_dead_letters().build();
    guard
        .register_target(
            "billing",
            RetryPolicy::no_retry(),
            BreakerConfig::default(),
            HealthConfig::default(),
        )
        .expect("registered");

    let err = guard
        .protect("billing", || async { Err::<(), _>(Fault::status(503)) }, &CallContext::new())
        .await
        .expect_err("fails");
    let ProtectError::Exhausted(failure) = err else {
        panic!("expected exhaustion");
    };
    assert!(!failure.dead_lettered);
    assert!(matches!(guard.dead_letter_stats(), Err(GuardError::NoDeadLetterStore)));
}

#[tokio::test]
async fn concurrent_replays_deliver_the_payload_once() {
    let guard = Guard::builder().build();
    guard
        .register_target(
            "billing",
            RetryPolicy::no_retry(),
            BreakerConfig::default(),
            HealthConfig::default(),
        )
        .expect("registered");

    let ctx = CallContext::new().with_payload(json!({"invoice": 7}));
    let err = guard
        .protect("billing", || async { Err::<(), _>(Fault::status(503)) }, &ctx)
        .await
        .expect_err("upstream down");
    let ProtectError::Exhausted(failure) = err else {
        panic!("expected exhaustion");
    };
    let id = failure.dead_letter_id.expect("dead-lettered");

    let runs = Arc::new(AtomicU32::new(0));
    let release = Arc::new(Notify::new());
    let first = {
        let guard = guard.clone();
        let runs = Arc::clone(&runs);
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            guard
                .reprocess_dead_letter(id, move |payload: Value| {
                    let runs = Arc::clone(&runs);
                    let release = Arc::clone(&release);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok::<_, Fault>(payload)
                    }
                })
                .await
        })
    };
    while runs.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    let second = guard
        .reprocess_dead_letter(id, |payload: Value| {
            runs.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Fault>(payload) }
        })
        .await;
    assert!(matches!(
        second,
        Err(GuardError::DeadLetter(DeadLetterError::ReplayInFlight(claimed))) if claimed == id
    ));
    assert!(matches!(
        guard.discard_dead_letter(id),
        Err(GuardError::DeadLetter(DeadLetterError::ReplayInFlight(_)))
    ));
    assert!(matches!(
        guard.purge_dead_letter(id),
        Err(GuardError::DeadLetter(DeadLetterError::ReplayInFlight(_)))
    ));

    release.notify_one();
    let replayed = first.await.expect("replay task").expect("replay succeeds");
    assert_eq!(replayed, json!({"invoice": 7}));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let stats = guard.dead_letter_stats().expect("stats");
    assert_eq!(stats.reprocessed, 1);
    assert_eq!(stats.pending, 0);
}
