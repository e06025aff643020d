use evio::{run_async, run_on, spawn, yield_now, ExecutionContext, JoinSet, Socket};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn run_without_work_returns_zero() {
    let ctx = ExecutionContext::new();
    assert_eq!(ctx.run().expect("run"), 0);
    assert!(ctx.stopped(), "an idle run stops the context");
}

#[test]
fn posted_items_run_in_fifo_order() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..5 {
        let order = order.clone();
        ex.post(move || order.lock().unwrap().push(i));
    }

    let executed = ctx.run().expect("run");
    assert_eq!(executed, 5);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn run_one_and_poll_consume_bounded_amounts() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let hits = hits.clone();
        ex.post(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(ctx.run_one().expect("run_one"), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert_eq!(ctx.poll().expect("poll"), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn stopped_context_restarts() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    ex.post(|| {});
    ctx.run().expect("run");
    assert!(ctx.stopped());

    // Stopped: new work is queued but not executed.
    let ran = Arc::new(AtomicBool::new(false));
    let ran_inner = ran.clone();
    ex.post(move || ran_inner.store(true, Ordering::SeqCst));
    assert_eq!(ctx.run().expect("run while stopped"), 0);
    assert!(!ran.load(Ordering::SeqCst));

    ctx.restart();
    assert!(!ctx.stopped());
    assert_eq!(ctx.run().expect("run after restart"), 1);
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn wait_one_zero_never_blocks() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    // A parked operation keeps outstanding work alive with nothing ready.
    let timer = evio::DeadlineTimer::new(&ctx);
    timer.expires_after(Duration::from_secs(60));
    run_async(&ex, async move {
        let _ = timer.wait().await;
    });

    // Consume the task's own poll first.
    assert_eq!(ctx.run_one().expect("run_one"), 1);

    let started = Instant::now();
    assert_eq!(ctx.wait_one(Duration::ZERO).expect("wait_one"), 0);
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "wait_one(0) must behave like poll_one"
    );
    assert_eq!(ctx.poll_one().expect("poll_one"), 0);

    ctx.stop();
}

#[test]
fn running_in_this_thread_tracks_the_loop() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    assert!(!ctx.running_in_this_thread());

    let observed = Arc::new(AtomicBool::new(false));
    let observed_inner = observed.clone();
    let ex_inner = ex.clone();
    ex.post(move || {
        observed_inner.store(ex_inner.running_in_this_thread(), Ordering::SeqCst);
    });

    ctx.run().expect("run");
    assert!(observed.load(Ordering::SeqCst));
    assert!(!ctx.running_in_this_thread());
}

#[test]
fn dispatch_runs_inline_on_the_loop_thread() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let inline = Arc::new(AtomicBool::new(false));
    let inline_inner = inline.clone();
    let ex_inner = ex.clone();
    ex.post(move || {
        let seen = Arc::new(AtomicBool::new(false));
        let seen_inner = seen.clone();
        ex_inner.dispatch(move || seen_inner.store(true, Ordering::SeqCst));
        // Dispatch from the loop thread runs before control returns.
        inline_inner.store(seen.load(Ordering::SeqCst), Ordering::SeqCst);
    });

    ctx.run().expect("run");
    assert!(inline.load(Ordering::SeqCst));
}

#[test]
fn spawn_yields_results_through_join_handles() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();
    let total = Arc::new(AtomicUsize::new(0));

    let ex_inner = ex.clone();
    let total_inner = total.clone();
    run_async(&ex, async move {
        let mut set = JoinSet::new();
        for i in 0..4usize {
            set.push(spawn(&ex_inner, async move {
                yield_now().await;
                i * 10
            }));
        }
        let outputs = set.await_all().await;
        total_inner.store(outputs.iter().sum(), Ordering::SeqCst);
    });

    ctx.run().expect("run");
    assert_eq!(total.load(Ordering::SeqCst), 60);
}

#[test]
fn run_on_executes_on_the_target_executor() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let witnessed = Arc::new(AtomicBool::new(false));

    let target = ex.clone();
    let witnessed_inner = witnessed.clone();
    run_async(&ex, async move {
        let target_probe = target.clone();
        let on_target =
            run_on(&target, async move { target_probe.running_in_this_thread() }).await;
        witnessed_inner.store(on_target, Ordering::SeqCst);
    });

    ctx.run().expect("run");
    assert!(witnessed.load(Ordering::SeqCst));
}

#[test]
fn many_concurrent_reads_complete() {
    const PAIRS: usize = 100;

    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    // Phase one: build the connected pairs.
    let acceptor = evio::Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    let servers = Arc::new(Mutex::new(Vec::new()));
    let clients = Arc::new(Mutex::new(Vec::new()));

    let servers_out = servers.clone();
    run_async(&ex, async move {
        for _ in 0..PAIRS {
            let peer = acceptor.accept().await.expect("accept");
            servers_out.lock().unwrap().push(peer);
        }
    });

    for _ in 0..PAIRS {
        let client = Socket::new(&ctx);
        client.open().expect("open client");
        let clients_out = clients.clone();
        run_async(&ex, async move {
            client.connect(addr).await.expect("connect");
            clients_out.lock().unwrap().push(client);
        });
    }

    ctx.run().expect("run (connect phase)");
    ctx.restart();
    assert_eq!(servers.lock().unwrap().len(), PAIRS);

    // Phase two: park a read on every server, then feed each client one
    // byte; everything must complete.
    let completed = Arc::new(AtomicUsize::new(0));

    for server in servers.lock().unwrap().drain(..) {
        let completed = completed.clone();
        run_async(&ex, async move {
            let mut buf = [0u8; 1];
            let n = server.read_some(&mut buf).await.expect("read");
            assert_eq!(n, 1);
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }
    for client in clients.lock().unwrap().drain(..) {
        run_async(&ex, async move {
            evio::write_all(&client, b"x").await.expect("write");
            // Keep the client open until its byte has surely left.
            yield_now().await;
        });
    }

    ctx.run().expect("run (transfer phase)");
    assert_eq!(completed.load(Ordering::SeqCst), PAIRS);
}

#[test]
fn multiple_threads_drive_one_context() {
    const PAIRS: usize = 24;

    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let acceptor = evio::Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    let servers = Arc::new(Mutex::new(Vec::new()));
    let clients = Arc::new(Mutex::new(Vec::new()));

    let servers_out = servers.clone();
    run_async(&ex, async move {
        for _ in 0..PAIRS {
            let peer = acceptor.accept().await.expect("accept");
            servers_out.lock().unwrap().push(peer);
        }
    });
    for _ in 0..PAIRS {
        let client = Socket::new(&ctx);
        client.open().expect("open client");
        let clients_out = clients.clone();
        run_async(&ex, async move {
            client.connect(addr).await.expect("connect");
            clients_out.lock().unwrap().push(client);
        });
    }
    ctx.run().expect("run (connect phase)");
    ctx.restart();

    let completed = Arc::new(AtomicUsize::new(0));
    for server in servers.lock().unwrap().drain(..) {
        let completed = completed.clone();
        run_async(&ex, async move {
            let mut buf = [0u8; 1];
            server.read_some(&mut buf).await.expect("read");
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }
    for client in clients.lock().unwrap().drain(..) {
        run_async(&ex, async move {
            evio::write_all(&client, b"y").await.expect("write");
            yield_now().await;
        });
    }

    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                ctx.run().expect("run");
            });
        }
    });

    assert_eq!(completed.load(Ordering::SeqCst), PAIRS);
}

#[test]
fn zero_length_read_completes_without_registration() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let acceptor = evio::Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    run_async(&ex, async move {
        let _peer = acceptor.accept().await.expect("accept");
        // Hold the peer open briefly so the client side stays connected.
        yield_now().await;
    });

    let sock = Socket::new(&ctx);
    sock.open().expect("open client");
    let hit = Arc::new(AtomicBool::new(false));
    let hit_inner = hit.clone();
    run_async(&ex, async move {
        sock.connect(addr).await.expect("connect");
        let n = sock.read_some(&mut []).await.expect("zero-length read");
        assert_eq!(n, 0, "an empty buffer is not end-of-stream");
        hit_inner.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    ctx.run().expect("run");
    assert!(hit.load(Ordering::SeqCst));
    assert!(started.elapsed() < Duration::from_secs(2));
}
