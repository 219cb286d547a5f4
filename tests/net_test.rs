//! Integration tests for the mock network: listen, connect, echo, close.

use mocknet::net::{
    connect, ConnectOptions, Kernel, Lifecycle, MockSocket, NetError, Server, ServerEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod common;

#[tokio::test]
async fn test_echo_round_trip() {
    let kernel = Kernel::new();
    let server = common::start_echo_server(&kernel, 0, b"").await;
    let port = server.port().unwrap();

    let mut client = connect(ConnectOptions::new(port).kernel(kernel)).unwrap();
    client.connected().await.unwrap();
    client.write_all(b"foo").await.unwrap();
    client.shutdown().await.unwrap();

    let received = common::read_all(&mut client).await.unwrap();
    assert_eq!(received, b"foo");
}

#[tokio::test]
async fn test_welcome_then_echo_then_close() {
    let kernel = Kernel::new();
    let server = common::start_echo_server(&kernel, 4000, b"Welcome!\n").await;
    assert_eq!(server.address().unwrap().to_string(), "mock:4000");

    let mut client = connect(ConnectOptions::new(4000).kernel(kernel.clone())).unwrap();
    client.connected().await.unwrap();

    let mut welcome = [0u8; 9];
    client.read_exact(&mut welcome).await.unwrap();
    assert_eq!(&welcome, b"Welcome!\n");

    client.write_all(b"example\n").await.unwrap();
    client.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"example\n");

    client.closed().await;
    assert!(client.is_closed());

    server.close();
    server.closed().await;
    assert!(kernel.lookup(4000).is_none());
}

#[tokio::test]
async fn test_listen_twice_reports_already_listening() {
    let kernel = Kernel::new();
    let server = Server::builder().kernel(kernel.clone()).build();
    server.listen(3000);
    server.listen(3001);

    assert_eq!(server.listening().await, Ok(3000));
    let err = server.listening().await.unwrap_err();
    assert_eq!(err.code(), "ERR_SERVER_ALREADY_LISTEN");
    assert_eq!(server.port(), Some(3000));
    assert!(kernel.lookup(3001).is_none());
}

#[tokio::test]
async fn test_address_in_use() {
    let kernel = Kernel::new();
    let first = Server::builder().kernel(kernel.clone()).build();
    let second = Server::builder().kernel(kernel.clone()).build();

    first.listen(8080);
    second.listen(8080);

    assert_eq!(first.listening().await, Ok(8080));
    match second.next_event().await {
        Some(ServerEvent::Error(err)) => {
            assert_eq!(err.code(), "EADDRINUSE");
            assert_eq!(err.port(), Some(8080));
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    assert_eq!(second.lifecycle(), Lifecycle::Unbound);
    assert!(kernel.lookup(8080).unwrap().ptr_eq(&first));
}

#[tokio::test]
async fn test_connection_refused() {
    let kernel = Kernel::new();
    let mut client = connect(ConnectOptions::new(5555).kernel(kernel)).unwrap();

    let err = client.connected().await.unwrap_err();
    assert_eq!(err, NetError::ConnectionRefused { port: 5555 });
    assert_eq!(err.code(), "ECONNREFUSED");

    let mut buf = [0u8; 8];
    let read = client.read(&mut buf).await.unwrap_err();
    assert_eq!(read.kind(), std::io::ErrorKind::ConnectionRefused);
}

#[tokio::test]
async fn test_unused_ports_are_allocated_in_order() {
    let kernel = Kernel::new();
    let first = Server::builder().kernel(kernel.clone()).build();
    let second = Server::builder().kernel(kernel.clone()).build();

    assert_eq!(first.listen(0).listening().await, Ok(1024));
    assert_eq!(second.listen(0).listening().await, Ok(1025));
    assert_eq!(kernel.active_count(), 2);
}

#[tokio::test]
async fn test_close_waits_for_every_client() {
    let kernel = Kernel::new();
    let server = Server::builder().kernel(kernel.clone()).build();
    let port = server.listen(0).listening().await.unwrap();

    let mut clients = Vec::new();
    let mut accepted = Vec::new();
    for _ in 0..3 {
        let client = connect(ConnectOptions::new(port).kernel(kernel.clone())).unwrap();
        client.connected().await.unwrap();
        clients.push(client);
        accepted.push(server.accept().await.unwrap());
    }
    assert_eq!(server.client_count(), 3);

    let (tx, clients_at_close) = tokio::sync::oneshot::channel();
    let observer = server.clone();
    server.close_with(move || {
        let _ = tx.send(observer.client_count());
    });
    assert!(server.is_closing());
    assert!(server.try_next_event().is_none());

    for mut socket in accepted {
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        });
    }
    for mut client in clients {
        let mut sink = Vec::new();
        client.read_to_end(&mut sink).await.unwrap();
        client.closed().await;
    }

    server.closed().await;
    assert_eq!(clients_at_close.await.unwrap(), 0);
    assert_eq!(server.client_count(), 0);
    assert!(kernel.lookup(port).is_none());

    let mut closes = 0;
    while let Some(event) = server.try_next_event() {
        if matches!(event, ServerEvent::Close) {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);

    server.close();
    assert!(server.try_next_event().is_none());
}

#[tokio::test]
async fn test_add_client_before_listen() {
    let server = Server::builder().kernel(Kernel::new()).build();
    let (_client, half) = MockSocket::pair().into_split();
    let err = server.add_client(half).unwrap_err();
    assert_eq!(err, NetError::NotListening);
}

#[tokio::test]
async fn test_get_connections() {
    let kernel = Kernel::new();
    let server = Server::builder().kernel(kernel.clone()).build();
    let port = server.listen(0).listening().await.unwrap();

    let _a = connect(ConnectOptions::new(port).kernel(kernel.clone())).unwrap();
    let _b = connect(ConnectOptions::new(port).kernel(kernel)).unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    server.get_connections(move |count| {
        let _ = tx.send(count);
    });
    assert_eq!(rx.await.unwrap(), Ok(2));
}

#[tokio::test]
async fn test_half_open_server_answers_after_request_ends() {
    let kernel = Kernel::new();
    let server = Server::builder()
        .kernel(kernel.clone())
        .allow_half_open(true)
        .on_connection(|mut socket| {
            tokio::spawn(async move {
                let mut request = Vec::new();
                socket.read_to_end(&mut request).await.unwrap();
                assert!(!socket.is_write_finished());
                socket.write_all(b"got ").await.unwrap();
                socket.write_all(&request).await.unwrap();
                socket.shutdown().await.unwrap();
            });
        })
        .build();
    let port = server.listen(0).listening().await.unwrap();

    let mut client = connect(ConnectOptions::new(port).kernel(kernel)).unwrap();
    client.write_all(b"request").await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"got request");
}

#[tokio::test]
async fn test_byte_fidelity_across_many_writes() {
    let (mut client, mut server) = MockSocket::pair().into_split();
    let mut expected = Vec::new();
    for i in 0..200u32 {
        let chunk: Vec<u8> = (0..(i % 37)).map(|b| (b as u8).wrapping_add(i as u8)).collect();
        client.write_all(&chunk).await.unwrap();
        expected.extend_from_slice(&chunk);
    }
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    server.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_global_kernel_by_default() {
    let server = Server::new();
    let port = server.listen(0).listening().await.unwrap();
    assert!(Kernel::global().lookup(port).unwrap().ptr_eq(&server));

    let client = connect(port).unwrap();
    client.connected().await.unwrap();
    assert_eq!(client.remote_port(), Some(port));
}
