use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::sync::mpsc;

use riptide::net::{Endpoint, TcpListener};
use riptide::{ops, Backend, Engine};

fn echo_roundtrip(backend: Backend) {
    let mut engine = Engine::new(backend, 64);
    if !engine.valid() {
        eprintln!("skipping {backend:?} echo test: backend unavailable");
        return;
    }

    let listener = TcpListener::bind(&Endpoint::loopback(0), 16).expect("bind listener");
    let port = listener.local_port().expect("local port");

    let (server_tx, server_rx) = mpsc::channel();
    engine.spawn(async move {
        let result = async {
            let peer = ops::async_accept(&listener).await?;
            let mut buffer = [0u8; 11];
            ops::async_read_exact(&peer, &mut buffer).await?;
            ops::async_write_all(&peer, &buffer).await?;
            Ok::<_, riptide::Error>(buffer)
        }
        .await;
        server_tx.send(result).unwrap();
    });

    let client = std::thread::spawn(move || {
        let mut stream = StdTcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream.write_all(b"hello-world").expect("client write");
        let mut echoed = [0u8; 11];
        stream.read_exact(&mut echoed).expect("client read");
        echoed
    });

    engine.run().expect("run");

    let server_bytes = server_rx.recv().expect("server result").expect("server side");
    assert_eq!(&server_bytes, b"hello-world");

    let echoed = client.join().expect("client thread");
    assert_eq!(&echoed, b"hello-world");
}

#[test]
fn epoll_echo_roundtrip() {
    echo_roundtrip(Backend::Epoll);
}

#[test]
fn uring_echo_roundtrip() {
    echo_roundtrip(Backend::IoUring);
}

#[test]
fn async_connect_echo_roundtrip() {
    // Both sides async on one loop: server echoes, client connects with
    // the runtime's own connect path.
    let mut engine = Engine::new(Backend::Epoll, 0);
    let listener = TcpListener::bind(&Endpoint::loopback(0), 16).expect("bind listener");
    let port = listener.local_port().expect("local port");

    engine.spawn(async move {
        let peer = ops::async_accept(&listener).await.expect("accept");
        let mut buffer = [0u8; 4];
        ops::async_read_exact(&peer, &mut buffer).await.expect("server read");
        ops::async_write_all(&peer, &buffer).await.expect("server write");
    });

    let (client_tx, client_rx) = mpsc::channel();
    engine.spawn(async move {
        let stream = ops::async_connect(&Endpoint::loopback(port))
            .await
            .expect("connect");
        ops::async_write_all(&stream, b"ping").await.expect("client write");
        let mut echoed = [0u8; 4];
        ops::async_read_exact(&stream, &mut echoed)
            .await
            .expect("client read");
        client_tx.send(echoed).unwrap();
    });

    engine.run().expect("run");
    assert_eq!(&client_rx.recv().unwrap(), b"ping");
}
