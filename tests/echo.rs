use evio::{run_async, Acceptor, Backend, ContextBuilder, ExecutionContext, Socket};

use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn echo_round_trip_in_context() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let acceptor = Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    let done = Arc::new(AtomicUsize::new(0));

    let server_done = done.clone();
    run_async(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        let mut buf = [0u8; 5];
        let n = evio::read(&peer, &mut buf).await.expect("server read");
        assert_eq!(n, 5);
        evio::write_all(&peer, &buf).await.expect("server write");
        server_done.fetch_add(1, Ordering::SeqCst);
    });

    let sock = Socket::new(&ctx);
    sock.open().expect("open client");
    let client_done = done.clone();
    run_async(&ex, async move {
        sock.connect(addr).await.expect("connect");
        evio::write_all(&sock, b"hello").await.expect("client write");
        let mut buf = [0u8; 5];
        evio::read(&sock, &mut buf).await.expect("client read");
        assert_eq!(&buf, b"hello");
        client_done.fetch_add(1, Ordering::SeqCst);
    });

    ctx.run().expect("run");
    assert_eq!(done.load(Ordering::SeqCst), 2, "both tasks should finish");
}

#[test]
fn echo_with_std_client_thread() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let acceptor = Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let port = acceptor.local_addr().expect("local addr").port();

    run_async(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        let mut buf = [0u8; 4];
        let n = evio::read(&peer, &mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"ping");
        evio::write_all(&peer, b"pong").await.expect("write_all");
    });

    let client = std::thread::spawn(move || {
        let mut c = StdTcpStream::connect(("127.0.0.1", port)).expect("connect");
        c.write_all(b"ping").expect("write");
        let mut buf = [0u8; 4];
        c.read_exact(&mut buf).expect("read_exact");
        buf.to_vec()
    });

    ctx.run().expect("run");
    assert_eq!(&client.join().unwrap()[..], b"pong");
}

#[test]
fn large_payload_write_all() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let acceptor = Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    let payload = vec![7u8; 256 * 1024];
    let payload_len = payload.len();
    let received = Arc::new(Mutex::new(Vec::new()));

    run_async(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        evio::write_all(&peer, &payload).await.expect("write_all");
    });

    let sock = Socket::new(&ctx);
    sock.open().expect("open client");
    let received_task = received.clone();
    run_async(&ex, async move {
        sock.connect(addr).await.expect("connect");
        let mut buf = vec![0u8; payload_len];
        evio::read(&sock, &mut buf).await.expect("read");
        *received_task.lock().unwrap() = buf;
    });

    ctx.run().expect("run");
    let got = received.lock().unwrap();
    assert_eq!(got.len(), payload_len);
    assert!(got.iter().all(|&b| b == 7));
}

#[test]
fn vectored_transfer() {
    let ctx = ExecutionContext::new();
    let ex = ctx.executor();

    let acceptor = Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    run_async(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        let parts = [
            std::io::IoSlice::new(b"scatter "),
            std::io::IoSlice::new(b"gather"),
        ];
        let n = peer.write_some_vectored(&parts).await.expect("writev");
        assert!(n > 0);
    });

    let sock = Socket::new(&ctx);
    sock.open().expect("open client");
    let collected = Arc::new(Mutex::new(Vec::new()));
    let collected_task = collected.clone();
    run_async(&ex, async move {
        sock.connect(addr).await.expect("connect");
        let mut front = [0u8; 8];
        let mut back = [0u8; 6];
        let mut total = 0;
        while total < 14 {
            let n = {
                let mut parts = [
                    std::io::IoSliceMut::new(&mut front[total.min(8)..]),
                    std::io::IoSliceMut::new(&mut back[total.saturating_sub(8)..]),
                ];
                sock.read_some_vectored(&mut parts).await.expect("readv")
            };
            assert!(n > 0, "peer closed early");
            total += n;
        }
        let mut all = front.to_vec();
        all.extend_from_slice(&back);
        *collected_task.lock().unwrap() = all;
    });

    ctx.run().expect("run");
    assert_eq!(&collected.lock().unwrap()[..], b"scatter gather");
}

#[test]
fn echo_on_select_backend() {
    let ctx = ContextBuilder::new()
        .backend(Backend::Select)
        .build()
        .expect("select context");
    let ex = ctx.executor();

    let acceptor = Acceptor::new(&ctx);
    acceptor.open("127.0.0.1:0".parse().unwrap()).expect("open acceptor");
    let addr = acceptor.local_addr().expect("local addr");

    let hits = Arc::new(AtomicUsize::new(0));

    let server_hits = hits.clone();
    run_async(&ex, async move {
        let peer = acceptor.accept().await.expect("accept");
        let mut buf = [0u8; 3];
        evio::read(&peer, &mut buf).await.expect("read");
        evio::write_all(&peer, &buf).await.expect("write");
        server_hits.fetch_add(1, Ordering::SeqCst);
    });

    let sock = Socket::new(&ctx);
    sock.open().expect("open client");
    let client_hits = hits.clone();
    run_async(&ex, async move {
        sock.connect(addr).await.expect("connect");
        evio::write_all(&sock, b"abc").await.expect("write");
        let mut buf = [0u8; 3];
        evio::read(&sock, &mut buf).await.expect("read");
        assert_eq!(&buf, b"abc");
        client_hits.fetch_add(1, Ordering::SeqCst);
    });

    ctx.run().expect("run");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
