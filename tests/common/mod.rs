//! Shared utilities for integration tests.

use std::io;

use mocknet::net::{Kernel, Server};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Greet with `greeting`, then echo everything back until the peer finishes.
pub async fn echo<S>(stream: S, greeting: &'static [u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    if !greeting.is_empty() {
        let _ = writer.write_all(greeting).await;
    }
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
}

/// An echo server on `kernel`, already listening on `port`.
#[allow(dead_code)]
pub async fn start_echo_server(kernel: &Kernel, port: u16, greeting: &'static [u8]) -> Server {
    let server = Server::builder()
        .kernel(kernel.clone())
        .on_connection(move |socket| {
            tokio::spawn(echo(socket, greeting));
        })
        .build();
    server.listen(port).listening().await.unwrap();
    server
}

/// Read until end of stream, treating a missing TLS close_notify as a clean
/// end.
#[allow(dead_code)]
pub async fn read_all<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut received = Vec::new();
    match stream.read_to_end(&mut received).await {
        Ok(_) => Ok(received),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(received),
        Err(e) => Err(e),
    }
}
