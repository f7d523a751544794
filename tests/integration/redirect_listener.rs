//! Redirect listener integration tests
//!
//! Real sockets on loopback. Destinations that iptables would normally
//! supply come from a resolver derived from the client's source port, and
//! the tunnel double sends every dial to a local echo server.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use tcp_redirect::error::{DialError, ResolutionError};
use tcp_redirect::redirect::{DestinationResolver, RedirectListener, RedirectListenerBuilder};
use tcp_redirect::tunnel::{DirectTunnel, TunnelClient, TunnelStream};

// ============================================================================
// Test Doubles
// ============================================================================

/// Documentation prefix (TEST-NET-2); never routed
const FAKE_DST_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));

/// Pretends every connection was redirected from `198.51.100.1:<client port>`
struct ClientPortResolver;

impl DestinationResolver for ClientPortResolver {
    fn resolve(&self, stream: &TcpStream) -> Result<SocketAddr, ResolutionError> {
        let peer = stream.peer_addr().map_err(|source| ResolutionError::Unavailable {
            option: "peer_addr",
            source,
        })?;
        Ok(SocketAddr::new(FAKE_DST_IP, peer.port()))
    }
}

/// Resolves every connection to one fixed address
struct FixedResolver(SocketAddr);

impl DestinationResolver for FixedResolver {
    fn resolve(&self, _stream: &TcpStream) -> Result<SocketAddr, ResolutionError> {
        Ok(self.0)
    }
}

/// Destinations passed to the connect hook, in call order
type Observed = Arc<Mutex<Vec<SocketAddr>>>;

/// Fails the dial unless the connect hook already saw `endpoint` exactly once
fn require_observed_once(observed: &Observed, endpoint: &str) -> Result<(), DialError> {
    let seen = observed
        .lock()
        .unwrap()
        .iter()
        .filter(|dst| dst.to_string() == endpoint)
        .count();
    if seen == 1 {
        Ok(())
    } else {
        Err(DialError::connection_failed(
            endpoint,
            format!("dialed after {seen} connect hooks"),
        ))
    }
}

/// Dials `target` whatever endpoint it is asked for
struct LocalTunnel {
    target: SocketAddr,
    observed: Observed,
    dialed: Mutex<Vec<String>>,
}

impl LocalTunnel {
    fn new(target: SocketAddr, observed: &Observed) -> Arc<Self> {
        Arc::new(Self {
            target,
            observed: Arc::clone(observed),
            dialed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TunnelClient for LocalTunnel {
    async fn dial_tcp(&self, endpoint: &str) -> Result<Box<dyn TunnelStream>, DialError> {
        self.dialed.lock().unwrap().push(endpoint.to_string());
        require_observed_once(&self.observed, endpoint)?;
        let stream = TcpStream::connect(self.target)
            .await
            .map_err(|e| DialError::connection_failed(endpoint, e.to_string()))?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Always refuses, once the connect hook has run
struct RefusingTunnel {
    observed: Observed,
}

#[async_trait]
impl TunnelClient for RefusingTunnel {
    async fn dial_tcp(&self, endpoint: &str) -> Result<Box<dyn TunnelStream>, DialError> {
        require_observed_once(&self.observed, endpoint)?;
        Err(DialError::connection_failed(endpoint, "connection refused"))
    }

    fn name(&self) -> &str {
        "refusing"
    }
}

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug)]
enum Event {
    Connect(SocketAddr, SocketAddr),
    End(SocketAddr, SocketAddr, Option<String>),
}

/// Echo server that mirrors each connection until the client closes
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

async fn bind_with_events(
    builder: RedirectListenerBuilder,
    observed: &Observed,
) -> (RedirectListener, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connect_tx = tx.clone();
    let observed = Arc::clone(observed);

    let listener = builder
        .listen("127.0.0.1:0")
        .idle_timeout(Duration::from_secs(5))
        .on_connect(move |client, dst| {
            observed.lock().unwrap().push(dst);
            let _ = connect_tx.send(Event::Connect(client, dst));
        })
        .on_error(move |client, dst, err| {
            let _ = tx.send(Event::End(client, dst, err.map(ToString::to_string)));
        })
        .bind()
        .await
        .unwrap();

    (listener, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for hook")
        .expect("hook channel closed")
}

async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<Event>) {
    let result = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(result.is_err(), "unexpected hook: {result:?}");
}

async fn assert_closed(mut client: TcpStream) {
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_direct_connection_is_dropped_silently() {
    // Default resolver: a connection that bypassed netfilter either has no
    // conntrack entry or maps to the listener itself (loopback).
    let tunnel = Arc::new(DirectTunnel::default());
    let observed = Observed::default();
    let (listener, mut rx) =
        bind_with_events(RedirectListenerBuilder::new(tunnel), &observed).await;
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());

    let mut client = TcpStream::connect(addr).await.unwrap();
    let _ = client.write_all(b"hello").await;

    assert_closed(client).await;
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn test_loopback_destination_is_dropped_silently() {
    let echo = spawn_echo_server().await;
    let observed = Observed::default();
    let tunnel = LocalTunnel::new(echo, &observed);
    let builder = RedirectListenerBuilder::new(tunnel.clone())
        .resolver(Arc::new(FixedResolver("[::ffff:127.0.0.1]:80".parse().unwrap())));
    let (listener, mut rx) = bind_with_events(builder, &observed).await;
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());

    let client = TcpStream::connect(addr).await.unwrap();

    assert_closed(client).await;
    assert_no_event(&mut rx).await;
    assert!(tunnel.dialed.lock().unwrap().is_empty());
    assert!(observed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_sessions_report_their_own_destination() {
    const SESSIONS: usize = 16;

    let echo = spawn_echo_server().await;
    let observed = Observed::default();
    let tunnel = LocalTunnel::new(echo, &observed);
    let builder =
        RedirectListenerBuilder::new(tunnel.clone()).resolver(Arc::new(ClientPortResolver));
    let (listener, mut rx) = bind_with_events(builder, &observed).await;
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());

    let mut handles = Vec::new();
    for i in 0..SESSIONS {
        handles.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let local = client.local_addr().unwrap();
            let payload = format!("session {i} from {local}");

            client.write_all(payload.as_bytes()).await.unwrap();

            let mut echoed = vec![0u8; payload.len()];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload.as_bytes());
            local
        }));
    }

    let mut clients = HashSet::new();
    for handle in handles {
        clients.insert(handle.await.unwrap());
    }
    assert_eq!(clients.len(), SESSIONS);

    let mut connected = HashSet::new();
    let mut ended = HashSet::new();
    while connected.len() < SESSIONS || ended.len() < SESSIONS {
        match next_event(&mut rx).await {
            Event::Connect(client, dst) => {
                assert_eq!(dst, SocketAddr::new(FAKE_DST_IP, client.port()));
                assert!(connected.insert(client), "{client} connected twice");
            }
            Event::End(client, dst, err) => {
                assert_eq!(dst, SocketAddr::new(FAKE_DST_IP, client.port()));
                // The tunnel refuses any dial the connect hook has not seen first
                assert_eq!(err, None, "{client} ended with an error");
                assert!(connected.contains(&client), "{client} ended before connecting");
                assert!(ended.insert(client), "{client} ended twice");
            }
        }
    }

    assert_eq!(connected, clients);
    assert_eq!(ended, clients);
    assert_no_event(&mut rx).await;

    let dialed = tunnel.dialed.lock().unwrap();
    assert_eq!(dialed.len(), SESSIONS);
    for client in &clients {
        let endpoint = format!("198.51.100.1:{}", client.port());
        assert!(dialed.contains(&endpoint), "{endpoint} was not dialed");
    }
}

#[tokio::test]
async fn test_dial_failure_reported_once() {
    let dst: SocketAddr = "[2001:db8::10]:443".parse().unwrap();
    let observed = Observed::default();
    let tunnel = Arc::new(RefusingTunnel {
        observed: Arc::clone(&observed),
    });
    let builder = RedirectListenerBuilder::new(tunnel).resolver(Arc::new(FixedResolver(dst)));
    let (listener, mut rx) = bind_with_events(builder, &observed).await;
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());

    let client = TcpStream::connect(addr).await.unwrap();
    let client_addr = client.local_addr().unwrap();

    match next_event(&mut rx).await {
        Event::Connect(c, d) => assert_eq!((c, d), (client_addr, dst)),
        other => panic!("expected connect, got {other:?}"),
    }
    match next_event(&mut rx).await {
        Event::End(c, d, Some(err)) => {
            assert_eq!((c, d), (client_addr, dst));
            assert!(err.contains("[2001:db8::10]:443"), "{err}");
            // Reaching the refusal means the connect hook ran before the dial
            assert!(err.contains("connection refused"), "{err}");
        }
        other => panic!("expected dial error, got {other:?}"),
    }

    assert_closed(client).await;
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let tunnel = Arc::new(DirectTunnel::default());
    let (listener, _rx) =
        bind_with_events(RedirectListenerBuilder::new(tunnel), &Observed::default()).await;
    let addr = listener.local_addr();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serve = tokio::spawn(listener.serve_with_shutdown(async {
        let _ = stop_rx.await;
    }));

    stop_tx.send(()).unwrap();
    serve.await.unwrap().unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}
