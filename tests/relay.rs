use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use chat_relay::server::TcpPeerRegistry;
use chat_relay::{Message, RelayConfig, RelayServer, ServerState, Stopped};

const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(200);

async fn wait_for_registry(registry: &TcpPeerRegistry, count: usize) {
    timeout(WAIT, async {
        while registry.len().await != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {count} peers"));
}

struct RunningRelay {
    addr: SocketAddr,
    registry: Arc<TcpPeerRegistry>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Stopped>,
}

impl RunningRelay {
    async fn start(config: RelayConfig) -> Self {
        let server = RelayServer::bind(config.bind("127.0.0.1:0".parse().unwrap()))
            .await
            .expect("bind relay");
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(server.serve(async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            addr,
            registry,
            shutdown,
            task,
        }
    }

    async fn wait_for_peers(&self, count: usize) {
        wait_for_registry(&self.registry, count).await;
    }

    async fn stop(self) -> Stopped {
        self.shutdown.send(()).unwrap();
        timeout(WAIT, self.task).await.unwrap().unwrap()
    }
}

struct Client {
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(relay: SocketAddr) -> Self {
        let stream = TcpStream::connect(relay).await.expect("connect to relay");
        stream.set_nodelay(true).unwrap();
        let addr = stream.local_addr().unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            addr,
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        assert!(n > 0, "connection closed while waiting for a line");
        line
    }

    async fn expect_silence(&mut self) {
        let mut line = String::new();
        let result = timeout(QUIET, self.reader.read_line(&mut line)).await;
        assert!(result.is_err(), "unexpected data: {line:?}");
    }

    async fn expect_closed(&mut self) {
        let mut buf = [0u8; 64];
        let n = timeout(WAIT, self.reader.read(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}

#[tokio::test]
async fn message_fans_out_to_everyone_but_sender() {
    let relay = RunningRelay::start(RelayConfig::default()).await;
    let mut a = Client::connect(relay.addr).await;
    let mut b = Client::connect(relay.addr).await;
    let mut c = Client::connect(relay.addr).await;
    relay.wait_for_peers(3).await;

    a.send("hello\n").await;

    for peer in [&mut b, &mut c] {
        let line = peer.read_line().await;
        assert!(line.starts_with('['), "unexpected frame: {line:?}");
        assert!(line.contains(&format!("({})", a.addr)));
        assert!(line.ends_with("> hello\n"));
        peer.expect_silence().await;
    }
    a.expect_silence().await;

    let stopped = relay.stop().await;
    assert_eq!(stopped.connections_accepted, 3);
    assert_eq!(stopped.messages_dispatched, 1);
}

#[tokio::test]
async fn disconnected_peer_is_skipped() {
    let relay = RunningRelay::start(RelayConfig::default()).await;
    let a = Client::connect(relay.addr).await;
    let mut b = Client::connect(relay.addr).await;
    let mut c = Client::connect(relay.addr).await;
    relay.wait_for_peers(3).await;

    let a_addr = a.addr;
    drop(a);
    relay.wait_for_peers(2).await;
    assert!(!relay.registry.contains(a_addr).await);

    b.send("still here\n").await;

    let line = c.read_line().await;
    assert!(line.contains(&format!("({})", b.addr)));
    assert!(line.ends_with("> still here\n"));
    b.expect_silence().await;

    relay.stop().await;
}

#[tokio::test]
async fn whitespace_is_not_relayed() {
    let relay = RunningRelay::start(RelayConfig::default()).await;
    let mut a = Client::connect(relay.addr).await;
    let mut b = Client::connect(relay.addr).await;
    relay.wait_for_peers(2).await;

    a.send("\n").await;
    b.expect_silence().await;

    a.send("after blank\n").await;
    let line = b.read_line().await;
    assert!(line.ends_with("> after blank\n"));

    let stopped = relay.stop().await;
    assert_eq!(stopped.messages_dispatched, 1);
}

#[tokio::test]
async fn both_directions_relay() {
    let relay = RunningRelay::start(RelayConfig::default()).await;
    let mut a = Client::connect(relay.addr).await;
    let mut b = Client::connect(relay.addr).await;
    relay.wait_for_peers(2).await;

    a.send("ping\n").await;
    assert!(b.read_line().await.ends_with("> ping\n"));

    b.send("pong\n").await;
    let line = a.read_line().await;
    assert!(line.contains(&format!("({})", b.addr)));
    assert!(line.ends_with("> pong\n"));

    relay.stop().await;
}

#[tokio::test]
async fn shutdown_returns_stopped_and_closes_connections() {
    let relay = RunningRelay::start(RelayConfig::default()).await;
    let mut a = Client::connect(relay.addr).await;
    relay.wait_for_peers(1).await;

    let addr = relay.addr;
    let registry = Arc::clone(&relay.registry);
    let stopped = relay.stop().await;
    assert_eq!(stopped.connections_accepted, 1);
    assert!(stopped.to_string().starts_with("shutting down server"));

    // Connection tasks were told to end
    a.expect_closed().await;
    timeout(WAIT, async {
        while !registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Nothing accepts new connections any more
    if let Ok(mut late) = TcpStream::connect(addr).await {
        let mut buf = [0u8; 1];
        let n = timeout(WAIT, late.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
    }
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn connections_can_outlive_shutdown_when_configured() {
    let relay = RunningRelay::start(RelayConfig::default().keep_connections_on_shutdown()).await;
    let mut a = Client::connect(relay.addr).await;
    relay.wait_for_peers(1).await;

    let registry = Arc::clone(&relay.registry);
    relay.stop().await;

    // Handler keeps reading; its messages are no longer dispatched
    a.send("into the void\n").await;
    a.expect_silence().await;
    assert_eq!(registry.len().await, 1);

    drop(a);
    timeout(WAIT, async {
        while !registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn connection_limit_refuses_extra_clients() {
    let relay = RunningRelay::start(RelayConfig::default().max_connections(1)).await;
    let _a = Client::connect(relay.addr).await;
    relay.wait_for_peers(1).await;

    let mut b = Client::connect(relay.addr).await;
    b.expect_closed().await;
    assert_eq!(relay.registry.len().await, 1);

    let stopped = relay.stop().await;
    assert_eq!(stopped.connections_accepted, 1);
}

#[tokio::test]
async fn state_follows_lifecycle() {
    let server = RelayServer::bind(RelayConfig::with_addr("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    let mut state = server.subscribe_state();
    assert_eq!(*state.borrow(), ServerState::Idle);

    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(async move {
        let _ = shutdown_rx.await;
    }));

    timeout(WAIT, state.wait_for(|s| *s == ServerState::Serving))
        .await
        .unwrap()
        .unwrap();

    shutdown.send(()).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(*state.borrow(), ServerState::Stopped);
}

#[tokio::test]
async fn single_delivery_slot_still_delivers_every_message() {
    let relay = RunningRelay::start(RelayConfig::default().max_inflight_deliveries(1)).await;
    let mut a = Client::connect(relay.addr).await;
    let mut b = Client::connect(relay.addr).await;
    let mut c = Client::connect(relay.addr).await;
    relay.wait_for_peers(3).await;

    // Separate reads, sent faster than anyone drains them
    for i in 0..5 {
        a.send(&format!("msg {i}\n")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for peer in [&mut b, &mut c] {
        for i in 0..5 {
            let line = peer.read_line().await;
            assert!(line.ends_with(&format!("> msg {i}\n")), "unexpected frame: {line:?}");
        }
        peer.expect_silence().await;
    }

    let stopped = relay.stop().await;
    assert_eq!(stopped.messages_dispatched, 5);
}

#[tokio::test]
async fn messages_queued_at_shutdown_are_delivered_before_serve_returns() {
    let server = RelayServer::bind(RelayConfig::with_addr("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let broadcaster = server.broadcaster();
    let announcer = SocketAddr::from(([127, 0, 0, 1], 1));
    let (ready, ready_rx) = oneshot::channel::<()>();

    // Queue three messages, then let shutdown fire straight away
    let task = tokio::spawn(server.serve(async move {
        let _ = ready_rx.await;
        for text in ["first\n", "second\n", "third\n"] {
            let message = Message::new(announcer, Bytes::from_static(text.as_bytes()));
            broadcaster.submit(message).await.unwrap();
        }
    }));

    let mut b = Client::connect(addr).await;
    wait_for_registry(&registry, 1).await;
    ready.send(()).unwrap();

    let stopped = timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(stopped.messages_dispatched, 3);

    // Written before serve returned, so they sit ahead of the close
    let mut payloads = Vec::new();
    for _ in 0..3 {
        let line = b.read_line().await;
        assert!(line.contains(&format!("({announcer})")));
        payloads.push(line.rsplit("> ").next().unwrap().to_string());
    }
    payloads.sort();
    assert_eq!(payloads, ["first\n", "second\n", "third\n"]);
    b.expect_closed().await;
}

#[tokio::test]
async fn stalled_reader_does_not_block_shutdown() {
    let config = RelayConfig::default()
        .with_write_timeout(Duration::from_millis(200))
        .with_shutdown_drain_timeout(Duration::from_secs(1));
    let relay = RunningRelay::start(config).await;

    // Tiny receive window on a client that never reads
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let _stalled = socket.connect(relay.addr).await.unwrap();
    let mut flooder = Client::connect(relay.addr).await;
    relay.wait_for_peers(2).await;

    let flood = tokio::spawn(async move {
        let chunk = vec![b'x'; 8 * 1024];
        for _ in 0..(16 * 1024 * 1024 / chunk.len()) {
            if flooder.writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    relay.shutdown.send(()).unwrap();
    let stopped = timeout(Duration::from_secs(5), relay.task)
        .await
        .expect("serve did not return Stopped within 5s of shutdown")
        .unwrap();
    assert_eq!(stopped.connections_accepted, 2);

    flood.abort();
}
