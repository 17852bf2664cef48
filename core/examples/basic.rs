//! Basic guard usage example

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use upstream_guard::{
    BreakerConfig, CallContext, DeadLetterFilter, Event, Fault, Guard, HealthConfig, RetryPolicy,
    logging,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("upstream_guard=info");
    println!("=== Upstream Guard Basic Example ===\n");

    let guard = Guard::builder().build();
    guard.register_target(
        "payment_api",
        RetryPolicy::default().with_delays(Duration::from_millis(20), Duration::from_millis(200)),
        BreakerConfig {
            failure_threshold: Some(3),
            cooldown_secs: 1.0,
            ..Default::default()
        },
        HealthConfig::default(),
    )?;

    guard.on_event(|event| match event {
        Event::StateChange { target, from, to } => {
            println!("🔁 Circuit '{target}' {from} -> {to}")
        }
        Event::Retry {
            attempt,
            delay_ms,
            kind,
            ..
        } => println!("   retry #{attempt} in {delay_ms}ms ({kind})"),
        _ => {}
    });

    // Flaky upstream: fails twice, then recovers
    println!("--- Transient failures ---");
    let calls = AtomicU32::new(0);
    let result = guard
        .protect(
            "payment_api",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Fault::status(503).with_code("ECONNRESET"))
                    } else {
                        Ok(format!("Payment accepted after {} attempts", n + 1))
                    }
                }
            },
            &CallContext::new(),
        )
        .await;
    match result {
        Ok(message) => println!("✓ {message}"),
        Err(e) => println!("✗ {e}"),
    }
    println!();

    // Hard outage: retries exhaust and the breaker opens
    println!("--- Outage ---");
    for i in 1..=3 {
        let ctx = CallContext::new()
            .with_request_id(format!("payment-{i}"))
            .with_payload(json!({ "payment": i }));
        match guard
            .protect("payment_api", || async { Err::<String, _>(Fault::status(503)) }, &ctx)
            .await
        {
            Ok(_) => println!("✓ Success"),
            Err(e) => println!("✗ {e}"),
        }
    }

    match guard
        .protect(
            "payment_api",
            || async { Ok::<_, Fault>("Should be rejected") },
            &CallContext::new(),
        )
        .await
    {
        Ok(_) => println!("✓ Success"),
        Err(e) => println!("✗ {e}"),
    }
    println!();

    println!("--- Status ---");
    let breaker = guard.breaker_status("payment_api")?;
    println!("Breaker: {} ({} failures)", breaker.state, breaker.failure_count);
    for record in guard.health_summary() {
        println!("Health: {} is {}", record.target, record.status);
    }
    let budget = guard.budget_status();
    println!(
        "Retry budget: {}/{} used this minute\n",
        budget.consumed_minute, budget.max_per_minute
    );

    // Cooldown elapses; replay the dead letters against a healthy upstream
    println!("--- Recovery ---");
    tokio::time::sleep(Duration::from_secs(1)).await;
    for entry in guard.list_dead_letters(&DeadLetterFilter::pending())? {
        let outcome = guard
            .reprocess_dead_letter(entry.id, |payload| async move { Ok::<_, Fault>(payload) })
            .await;
        match outcome {
            Ok(payload) => println!("✓ Replayed {} ({payload})", entry.request_id),
            Err(e) => println!("✗ Replay of {} failed: {e}", entry.request_id),
        }
    }
    println!("Breaker: {}", guard.breaker_status("payment_api")?.state);

    Ok(())
}
