//! Local TCP backends standing in for the tcp-echo deployment.
//!
//! The real backends prefix each echoed line with their version word
//! (`one`, `two`). These helpers do the same on an ephemeral localhost port.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use shift_verifier::types::Endpoint;

/// Spawn a backend that replies `"{prefix} {line}"` to the first line it
/// receives on each connection, then closes.
pub async fn spawn_echo_backend(prefix: &str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let prefix = prefix.to_string();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let prefix = prefix.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut line = String::new();
                if BufReader::new(read).read_line(&mut line).await.is_ok() {
                    let _ = write.write_all(format!("{prefix} {line}").as_bytes()).await;
                }
            });
        }
    });

    addr
}

/// Spawn a backend that answers the first line with `reply` as raw bytes.
///
/// With `hold_open` the connection stays up after the reply, so the client
/// only stops reading on its own limits. Otherwise the backend closes at once.
pub async fn spawn_raw_backend(reply: Vec<u8>, hold_open: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let reply = reply.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut line = String::new();
                if BufReader::new(read).read_line(&mut line).await.is_ok() {
                    let _ = write.write_all(&reply).await;
                    if hold_open {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                }
            });
        }
    });

    addr
}

/// Spawn a backend that accepts connections but never answers.
pub async fn spawn_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

/// Address with nothing listening on it.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    // Give the OS a moment to release the port.
    tokio::time::sleep(Duration::from_millis(10)).await;
    addr
}

/// Convert a local socket address into a probe endpoint.
pub fn endpoint_of(addr: SocketAddr) -> Endpoint {
    Endpoint::new(addr.ip().to_string(), addr.port())
}
