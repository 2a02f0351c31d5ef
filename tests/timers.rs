use std::net::TcpStream as StdTcpStream;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use riptide::net::{Endpoint, TcpListener};
use riptide::{ops, Backend, CancelSource, CancelToken, Engine};

#[test]
fn sleep_observes_cancel_from_another_thread() {
    let mut engine = Engine::new(Backend::Epoll, 0);
    let source = CancelSource::new();
    let token = source.token();

    let (tx, rx) = mpsc::channel();
    engine.spawn(async move {
        let started = Instant::now();
        let result = ops::async_sleep(Duration::from_secs(2), token).await;
        tx.send((started.elapsed(), result)).unwrap();
    });

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        source.request_stop();
    });

    engine.run().expect("run");
    canceller.join().expect("canceller thread");

    let (elapsed, result) = rx.recv().expect("sleep result");
    assert_eq!(result.unwrap_err().code(), libc::ECANCELED);
    assert!(elapsed < Duration::from_secs(1), "woke after {elapsed:?}");
}

#[test]
fn read_with_timeout_expires_while_peer_is_silent() {
    let mut engine = Engine::new(Backend::Epoll, 0);
    let listener = TcpListener::bind(&Endpoint::loopback(0), 16).expect("bind listener");
    let port = listener.local_port().expect("local port");

    let (tx, rx) = mpsc::channel();
    engine.spawn(async move {
        let result = async {
            let peer = ops::async_accept(&listener).await?;
            let mut buffer = [0u8; 64];
            ops::async_read_some_with_timeout(
                &peer,
                &mut buffer,
                Duration::from_millis(80),
                CancelToken::default(),
            )
            .await
        }
        .await;
        tx.send(result).unwrap();
    });

    let client = std::thread::spawn(move || {
        let stream = StdTcpStream::connect(("127.0.0.1", port)).expect("connect");
        std::thread::sleep(Duration::from_millis(250));
        drop(stream);
    });

    engine.run().expect("run");
    let err = rx.recv().expect("read result").unwrap_err();
    assert_eq!(err.code(), libc::ETIMEDOUT);
    client.join().expect("client thread");
}

fn stop_responsiveness(backend: Backend, budget: Duration) {
    let mut engine = Engine::new(backend, 64);
    if !engine.valid() {
        eprintln!("skipping {backend:?} stop test: backend unavailable");
        return;
    }

    engine.spawn(async {
        let _ = ops::async_sleep(Duration::from_secs(5), CancelToken::default()).await;
    });

    let handle = engine.stop_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
    });

    let started = Instant::now();
    engine.run().expect("run");
    let elapsed = started.elapsed();
    assert!(elapsed < budget, "stop took {elapsed:?}, budget {budget:?}");
    stopper.join().expect("stopper thread");
}

#[test]
fn epoll_stop_interrupts_sleeping_loop() {
    stop_responsiveness(Backend::Epoll, Duration::from_millis(500));
}

#[test]
fn uring_stop_interrupts_sleeping_loop() {
    stop_responsiveness(Backend::IoUring, Duration::from_millis(1500));
}

#[test]
fn zero_read_timeout_fires_on_first_iteration() {
    let mut engine = Engine::new(Backend::Epoll, 0);
    let listener = TcpListener::bind(&Endpoint::loopback(0), 16).expect("bind listener");
    let port = listener.local_port().expect("local port");

    let (tx, rx) = mpsc::channel();
    engine.spawn(async move {
        let result = async {
            let peer = ops::async_accept(&listener).await?;
            let mut buffer = [0u8; 16];
            ops::async_read_some_with_timeout(
                &peer,
                &mut buffer,
                Duration::ZERO,
                CancelToken::default(),
            )
            .await
        }
        .await;
        tx.send(result).unwrap();
    });

    let client = std::thread::spawn(move || {
        let stream = StdTcpStream::connect(("127.0.0.1", port)).expect("connect");
        std::thread::sleep(Duration::from_millis(100));
        drop(stream);
    });

    engine.run().expect("run");
    let err = rx.recv().expect("read result").unwrap_err();
    assert_eq!(err.code(), libc::ETIMEDOUT);
    client.join().expect("client thread");
}
