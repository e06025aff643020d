#![cfg(target_os = "linux")]

use evio::{run_async, Acceptor, Backend, ContextBuilder, ExecutionContext, Socket};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// io_uring may be unavailable (old kernel, seccomp policy); these tests
/// prove interchangeability when it is present and skip otherwise.
fn uring_context() -> Option<ExecutionContext> {
    match ContextBuilder::new().backend(Backend::IoUring).build() {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("io_uring unavailable, skipping: {e}");
            None
        }
    }
}

#[test]
fn posts_and_timers_run_on_uring() {
    let Some(ctx) = uring_context() else { return };
    let ex = ctx.executor();

    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let hits = hits.clone();
        ex.post(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    let timer = evio::DeadlineTimer::new(&ctx);
    timer.expires_after(Duration::from_millis(30));
    let timer_hits = hits.clone();
    run_async(&ex, async move {
        timer.wait().await.expect("wait");
        timer_hits.fetch_add(10, Ordering::SeqCst);
    });

    let started = Instant::now();
    ctx.run().expect("run");
    assert_eq!(hits.load(Ordering::SeqCst), 13);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn echo_on_uring() {
    let Some(ctx) = uring_context() else { return };
    let ex = ctx.executor();

    let acceptor = Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    let hits = Arc::new(AtomicUsize::new(0));

    let server_hits = hits.clone();
    run_async(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        let mut buf = [0u8; 4];
        evio::read(&peer, &mut buf).await.expect("read");
        evio::write_all(&peer, &buf).await.expect("write");
        server_hits.fetch_add(1, Ordering::SeqCst);
    });

    let sock = Socket::new(&ctx);
    sock.open().expect("open client");
    let client_hits = hits.clone();
    run_async(&ex, async move {
        sock.connect(addr).await.expect("connect");
        evio::write_all(&sock, b"ring").await.expect("write");
        let mut buf = [0u8; 4];
        evio::read(&sock, &mut buf).await.expect("read");
        assert_eq!(&buf, b"ring");
        client_hits.fetch_add(1, Ordering::SeqCst);
    });

    ctx.run().expect("run");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
