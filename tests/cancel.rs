use evio::{run_async, yield_now, Acceptor, CancelSource, ExecutionContext, Socket};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Builds a connected pair by driving the context until both ends are up.
fn connected_pair(ctx: &ExecutionContext) -> (Socket, Socket) {
    let ex = ctx.executor();

    let acceptor = Acceptor::new(ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    let server_slot = Arc::new(Mutex::new(None));
    let client_slot = Arc::new(Mutex::new(None));

    let server_out = server_slot.clone();
    run_async(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        *server_out.lock().unwrap() = Some(peer);
    });

    let client = Socket::new(ctx);
    client.open().expect("open client");
    let client_out = client_slot.clone();
    run_async(&ex, async move {
        client.connect(addr).await.expect("connect");
        *client_out.lock().unwrap() = Some(client);
    });

    ctx.run().expect("run");
    ctx.restart();

    let server = server_slot.lock().unwrap().take().expect("server socket");
    let client = client_slot.lock().unwrap().take().expect("client socket");
    (server, client)
}

#[test]
fn stop_token_cancels_idle_read() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();
    let (server, _client) = connected_pair(&ctx);

    let source = CancelSource::new();
    let token = source.token();
    let outcomes = Arc::new(AtomicUsize::new(0));

    let reader_outcomes = outcomes.clone();
    run_async(&ex, async move {
        let mut buf = [0u8; 8];
        let err = server
            .read_some(&mut buf)
            .cancel_token(&token)
            .await
            .expect_err("read should be cancelled");
        assert!(err.is_canceled());
        assert!(server.is_open(), "cancellation must not close the socket");
        reader_outcomes.fetch_add(1, Ordering::SeqCst);
    });

    run_async(&ex, async move {
        // Let the reader suspend first.
        yield_now().await;
        source.cancel();
    });

    ctx.run().expect("run");
    assert_eq!(outcomes.load(Ordering::SeqCst), 1);
}

#[test]
fn explicit_cancel_completes_with_canceled() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();
    let (server, _client) = connected_pair(&ctx);

    let server = Arc::new(server);
    let hits = Arc::new(AtomicUsize::new(0));

    let reader = server.clone();
    let reader_hits = hits.clone();
    run_async(&ex, async move {
        let mut buf = [0u8; 8];
        let err = reader.read_some(&mut buf).await.expect_err("cancelled");
        assert!(err.is_canceled());
        reader_hits.fetch_add(1, Ordering::SeqCst);
    });

    let canceller = server.clone();
    run_async(&ex, async move {
        yield_now().await;
        canceller.cancel();
    });

    ctx.run().expect("run");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn close_with_outstanding_read() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();
    let (server, _client) = connected_pair(&ctx);

    let server = Arc::new(server);
    let hits = Arc::new(AtomicUsize::new(0));

    let reader = server.clone();
    let reader_hits = hits.clone();
    run_async(&ex, async move {
        let mut buf = [0u8; 8];
        let err = reader.read_some(&mut buf).await.expect_err("cancelled");
        assert!(err.is_canceled());
        reader_hits.fetch_add(1, Ordering::SeqCst);
    });

    let closer = server.clone();
    run_async(&ex, async move {
        yield_now().await;
        closer.close();
        assert!(!closer.is_open());
    });

    ctx.run().expect("run");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The socket is reusable after close.
    server.open().expect("reopen");
    assert!(server.is_open());
}

#[test]
fn cancelled_socket_is_reusable() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();
    let (server, client) = connected_pair(&ctx);

    let server = Arc::new(server);
    let echoed = Arc::new(AtomicUsize::new(0));

    // Round one: cancel an idle read.
    let reader = server.clone();
    run_async(&ex, async move {
        let mut buf = [0u8; 4];
        let err = reader.read_some(&mut buf).await.expect_err("cancelled");
        assert!(err.is_canceled());
    });
    let canceller = server.clone();
    run_async(&ex, async move {
        yield_now().await;
        canceller.cancel();
    });
    ctx.run().expect("run");
    ctx.restart();

    // Round two: the same socket carries data.
    let reader = server.clone();
    let reader_done = echoed.clone();
    run_async(&ex, async move {
        let mut buf = [0u8; 4];
        evio::read(&reader, &mut buf).await.expect("read after cancel");
        assert_eq!(&buf, b"data");
        reader_done.fetch_add(1, Ordering::SeqCst);
    });
    run_async(&ex, async move {
        evio::write_all(&client, b"data").await.expect("write");
    });

    ctx.run().expect("run");
    assert_eq!(echoed.load(Ordering::SeqCst), 1);
}

#[test]
fn acceptor_cancel_completes_pending_accept() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let acceptor = Arc::new(Acceptor::new(&ctx));
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");

    let hits = Arc::new(AtomicUsize::new(0));

    let waiter = acceptor.clone();
    let waiter_hits = hits.clone();
    run_async(&ex, async move {
        let err = waiter.accept().await.expect_err("cancelled");
        assert!(err.is_canceled());
        waiter_hits.fetch_add(1, Ordering::SeqCst);
    });

    let canceller = acceptor.clone();
    run_async(&ex, async move {
        yield_now().await;
        canceller.cancel();
    });

    ctx.run().expect("run");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_is_prompt_on_a_blocked_loop() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();
    let (server, _client) = connected_pair(&ctx);

    let source = CancelSource::new();
    let token = source.token();

    run_async(&ex, async move {
        let mut buf = [0u8; 8];
        let err = server
            .read_some(&mut buf)
            .cancel_token(&token)
            .await
            .expect_err("cancelled");
        assert!(err.is_canceled());
    });

    // Trigger from outside while the loop is blocked in the reactor.
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        source.cancel();
    });

    let started = Instant::now();
    ctx.run().expect("run");
    trigger.join().unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "cancellation must wake a blocked reactor promptly"
    );
}
