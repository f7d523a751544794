//! `DirectTunnel` + `IdleTimeoutPipe` integration tests
//!
//! The production dial path and copy loop carrying real traffic, both on
//! their own and behind a listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use tcp_redirect::error::{DialError, ResolutionError, SessionError};
use tcp_redirect::io::{IdleTimeoutPipe, Pipe};
use tcp_redirect::redirect::{DestinationResolver, RedirectListenerBuilder};
use tcp_redirect::tunnel::{DirectTunnel, TunnelClient, TunnelStream};

/// Non-loopback destination every session claims to be redirected from
const REDIRECTED_DST: &str = "192.0.2.80:80";

struct StaticResolver(SocketAddr);

impl DestinationResolver for StaticResolver {
    fn resolve(&self, _stream: &TcpStream) -> Result<SocketAddr, ResolutionError> {
        Ok(self.0)
    }
}

/// `DirectTunnel` with every dial rewritten to a local server
struct RewritingTunnel {
    inner: DirectTunnel,
    target: SocketAddr,
}

#[async_trait]
impl TunnelClient for RewritingTunnel {
    async fn dial_tcp(&self, endpoint: &str) -> Result<Box<dyn TunnelStream>, DialError> {
        assert_eq!(endpoint, REDIRECTED_DST);
        self.inner.dial_tcp(&self.target.to_string()).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Server that reads the whole request and answers with its length
async fn spawn_length_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                stream.read_to_end(&mut request).await.unwrap();
                let reply = format!("received {} bytes", request.len());
                stream.write_all(reply.as_bytes()).await.unwrap();
            });
        }
    });

    addr
}

/// Server that accepts and then never reads or writes
async fn spawn_silent_server() -> SocketAddr {
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

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    (client, accepted)
}

#[tokio::test]
async fn test_pipe_over_direct_tunnel_counts_bytes() {
    let server = spawn_length_server().await;
    let upstream = DirectTunnel::default()
        .dial_tcp(&server.to_string())
        .await
        .unwrap();

    let (mut client, accepted) = tcp_pair().await;
    let pipe = tokio::spawn(async move {
        IdleTimeoutPipe::new()
            .with_buffer_size(4096)
            .with_half_close(true)
            .pipe(accepted, upstream, Duration::from_secs(5))
            .await
    });

    let request = vec![0x5au8; 256 * 1024];
    client.write_all(&request).await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = String::new();
    client.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "received 262144 bytes");

    let copy = pipe.await.unwrap().unwrap();
    assert_eq!(copy.client_to_upstream, 256 * 1024);
    assert_eq!(copy.upstream_to_client, reply.len() as u64);
    assert_eq!(copy.total(), 256 * 1024 + reply.len() as u64);
}

#[tokio::test]
async fn test_listener_end_to_end_through_direct_tunnel() {
    let server = spawn_length_server().await;
    let dst: SocketAddr = REDIRECTED_DST.parse().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let tunnel = Arc::new(RewritingTunnel {
        inner: DirectTunnel::new(Duration::from_secs(2)),
        target: server,
    });
    let listener = RedirectListenerBuilder::new(tunnel)
        .listen("127.0.0.1:0")
        .resolver(Arc::new(StaticResolver(dst)))
        .pipe(Arc::new(IdleTimeoutPipe::new().with_half_close(true)))
        .on_error(move |client, dst, err| {
            let _ = tx.send((client, dst, err.map(ToString::to_string)));
        })
        .bind()
        .await
        .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());

    let mut client = TcpStream::connect(addr).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.write_all(b"GET / HTTP/1.1\r\nHost: example\r\n\r\n").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = String::new();
    client.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "received 33 bytes");

    let ended = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(ended, (client_addr, dst, None));
}

#[tokio::test]
async fn test_client_close_ends_session_with_open_upstream() {
    let server = spawn_silent_server().await;
    let dst: SocketAddr = REDIRECTED_DST.parse().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let tunnel = Arc::new(RewritingTunnel {
        inner: DirectTunnel::default(),
        target: server,
    });
    let listener = RedirectListenerBuilder::new(tunnel)
        .listen("127.0.0.1:0")
        .idle_timeout(Duration::from_secs(30))
        .resolver(Arc::new(StaticResolver(dst)))
        .on_error(move |client, _, err| {
            let _ = tx.send((client, err.map(ToString::to_string)));
        })
        .bind()
        .await
        .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());

    let mut client = TcpStream::connect(addr).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.write_all(b"ping").await.unwrap();
    drop(client);

    // The upstream never closes; the session must end on the client's close
    let ended = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("session outlived the client")
        .unwrap();
    assert_eq!(ended, (client_addr, None));
}

#[tokio::test]
async fn test_idle_session_is_reported() {
    let server = spawn_silent_server().await;
    let dst: SocketAddr = REDIRECTED_DST.parse().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let tunnel = Arc::new(RewritingTunnel {
        inner: DirectTunnel::default(),
        target: server,
    });
    let listener = RedirectListenerBuilder::new(tunnel)
        .listen("127.0.0.1:0")
        .idle_timeout(Duration::from_millis(150))
        .resolver(Arc::new(StaticResolver(dst)))
        .on_error(move |_, _, err| {
            let _ = tx.send(err.map(SessionError::is_idle_timeout));
        })
        .bind()
        .await
        .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());

    let started = Instant::now();
    let mut client = TcpStream::connect(addr).await.unwrap();

    let idle = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(idle, Some(true));
    assert!(started.elapsed() >= Duration::from_millis(150));

    // Client side is closed once the pipe gives up
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
}
