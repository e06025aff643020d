use evio::{run_async, yield_now, DeadlineTimer, ExecutionContext};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn wait_elapses_the_duration() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let timer = DeadlineTimer::new(&ctx);
    timer.expires_after(Duration::from_millis(40));

    run_async(&ex, async move {
        timer.wait().await.expect("wait");
    });

    let started = Instant::now();
    ctx.run().expect("run");
    assert!(
        started.elapsed() >= Duration::from_millis(40),
        "wait should last at least the requested duration"
    );
}

#[test]
fn past_deadline_completes_immediately() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let timer = DeadlineTimer::new(&ctx);
    timer.expires_at(Instant::now() - Duration::from_millis(5));

    run_async(&ex, async move {
        timer.wait().await.expect("wait");
    });

    let started = Instant::now();
    ctx.run().expect("run");
    assert!(
        started.elapsed() < Duration::from_millis(50),
        "an already-expired deadline should complete on the next pass"
    );
}

#[test]
fn earlier_deadline_shortens_the_wait() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let long_timer = DeadlineTimer::new(&ctx);
    long_timer.expires_after(Duration::from_millis(300));
    let short_timer = DeadlineTimer::new(&ctx);

    let started = Instant::now();
    let fired = Arc::new(Mutex::new(Vec::new()));

    let long_fired = fired.clone();
    run_async(&ex, async move {
        long_timer.wait().await.expect("long wait");
        long_fired.lock().unwrap().push(("long", started.elapsed()));
    });

    // Scheduled second, with the loop already waiting on the long
    // deadline: the earlier expiry must interrupt that wait.
    let short_fired = fired.clone();
    run_async(&ex, async move {
        yield_now().await;
        short_timer.expires_after(Duration::from_millis(20));
        short_timer.wait().await.expect("short wait");
        short_fired.lock().unwrap().push(("short", started.elapsed()));
    });

    ctx.run().expect("run");

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 2);
    assert_eq!(fired[0].0, "short");
    assert!(
        fired[0].1 < Duration::from_millis(150),
        "short timer fired late: {:?}",
        fired[0].1
    );
    assert!(fired[1].1 >= Duration::from_millis(300));
}

#[test]
fn cancel_completes_with_canceled() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let timer = Arc::new(DeadlineTimer::new(&ctx));
    timer.expires_after(Duration::from_secs(30));

    let hits = Arc::new(AtomicUsize::new(0));

    let waiter = timer.clone();
    let waiter_hits = hits.clone();
    run_async(&ex, async move {
        let err = waiter.wait().await.expect_err("cancelled");
        assert!(err.is_canceled());
        waiter_hits.fetch_add(1, Ordering::SeqCst);
    });

    let canceller = timer.clone();
    run_async(&ex, async move {
        yield_now().await;
        canceller.cancel();
    });

    let started = Instant::now();
    ctx.run().expect("run");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn rescheduling_cancels_the_outstanding_wait() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let timer = Arc::new(DeadlineTimer::new(&ctx));
    timer.expires_after(Duration::from_secs(30));

    let order = Arc::new(Mutex::new(Vec::new()));

    let waiter = timer.clone();
    let waiter_order = order.clone();
    run_async(&ex, async move {
        let err = waiter.wait().await.expect_err("first wait cancelled");
        assert!(err.is_canceled());
        waiter_order.lock().unwrap().push("cancelled");

        // The rescheduled deadline is observable by a new wait.
        waiter.wait().await.expect("second wait");
        waiter_order.lock().unwrap().push("expired");
    });

    let rescheduler = timer.clone();
    run_async(&ex, async move {
        yield_now().await;
        rescheduler.expires_after(Duration::from_millis(20));
    });

    let started = Instant::now();
    ctx.run().expect("run");
    assert_eq!(*order.lock().unwrap(), vec!["cancelled", "expired"]);
    assert!(started.elapsed() < Duration::from_secs(5));
}
