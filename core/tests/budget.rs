use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use upstream_guard::{
    BackoffStrategy, BreakerConfig, BudgetConfig, CallContext, Fault, Guard, HealthConfig, Jitter,
    ProtectError, RetryPolicy, StopReason,
};

const TARGETS: [&str; 3] = ["search", "billing", "geo"];

fn guard(max_per_minute: u32) -> Guard {
    let guard = Guard::builder()
        .budget(BudgetConfig {
            max_per_minute,
            max_per_hour: 1000,
            ..Default::default()
        })
        .without_dead_letters()
        .build();

    for target in TARGETS {
        guard
            .register_target(
                target,
                RetryPolicy::default()
                    .with_strategy(BackoffStrategy::Fixed)
                    .with_delays(Duration::from_millis(5), Duration::from_millis(5))
                    .with_jitter(Jitter::None)
                    .with_max_attempts(5),
                BreakerConfig {
                    failure_threshold: Some(10_000),
                    ..Default::default()
                },
                HealthConfig {
                    degraded_threshold: 10_000,
                    unhealthy_threshold: 10_000,
                    ..Default::default()
                },
            )
            .expect("registered");
    }
    guard
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_share_one_budget() {
    let guard = guard(10);
    let invocations = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for n in 0..12 {
        let guard = guard.clone();
        let invocations = Arc::clone(&invocations);
        handles.push(tokio::spawn(async move {
            let target = TARGETS[n % TARGETS.len()];
            guard
                .protect(
                    target,
                    move || {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(Fault::status(503)) }
                    },
                    &CallContext::new(),
                )
                .await
        }));
    }

    let mut budget_stops = 0;
    for handle in handles {
        match handle.await.expect("task") {
            Err(ProtectError::Exhausted(failure)) => {
                if failure.reason == StopReason::BudgetExhausted {
                    budget_stops += 1;
                }
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    let status = guard.budget_status();
    assert_eq!(status.consumed_minute, 10);
    assert_eq!(status.remaining_minute, 0);
    // 12 free first attempts plus exactly the 10 budgeted retries
    assert_eq!(invocations.load(Ordering::SeqCst), 12 + 10);
    assert!(budget_stops > 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_still_allows_first_attempts() {
    let guard = guard(1);

    let _ = guard
        .protect("search", || async { Err::<(), _>(Fault::status(503)) }, &CallContext::new())
        .await;
    assert_eq!(guard.budget_status().consumed_minute, 1);

    let calls = AtomicU32::new(0);
    let err = guard
        .protect(
            "billing",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Fault::status(503)) }
            },
            &CallContext::new(),
        )
        .await
        .expect_err("fails");
    let ProtectError::Exhausted(failure) = err else {
        panic!("expected exhaustion");
    };
    assert_eq!(failure.reason, StopReason::BudgetExhausted);
    assert_eq!(failure.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let ok = guard
        .protect("geo", || async { Ok::<_, Fault>("served") }, &CallContext::new())
        .await;
    assert_eq!(ok.expect("first attempt is free"), "served");
}
