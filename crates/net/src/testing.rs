//! Shared helpers for the engine tests

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::id::ClientId;
use crate::listener::{ClientListener, RoomListener, ServerListener};
use crate::server::Server;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Connect(ClientId),
    Disconnect(ClientId),
    Message(ClientId, String),
    RoomDisconnect(ClientId),
    RoomMessage(ClientId, String),
    ServerDisconnect,
    ServerMessage(String),
}

/// Listener that forwards every callback into a channel
pub(crate) struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub(crate) fn new() -> (Arc<Self>, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), Events { rx })
    }

    fn record(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl ClientListener for Recorder {
    fn on_connect(&self, client: &Arc<Connection>) {
        self.record(Event::Connect(client.id()));
    }

    fn on_disconnect(&self, client: &Arc<Connection>) {
        self.record(Event::Disconnect(client.id()));
    }

    fn on_message(&self, client: &Arc<Connection>, message: &str) {
        self.record(Event::Message(client.id(), message.to_string()));
    }
}

impl RoomListener for Recorder {
    fn on_client_disconnect(&self, client: &Arc<Connection>) {
        self.record(Event::RoomDisconnect(client.id()));
    }

    fn on_client_message(&self, client: &Arc<Connection>, message: &str) {
        self.record(Event::RoomMessage(client.id(), message.to_string()));
    }
}

impl ServerListener for Recorder {
    fn on_disconnect(&self) {
        self.record(Event::ServerDisconnect);
    }

    fn on_message(&self, message: &str) {
        self.record(Event::ServerMessage(message.to_string()));
    }
}

pub(crate) struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    pub(crate) async fn next(&mut self) -> Event {
        timeout(EVENT_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("recorder dropped")
    }

    pub(crate) async fn next_connect(&mut self) -> ClientId {
        match self.next().await {
            Event::Connect(id) => id,
            other => panic!("Expected Connect, got {:?}", other),
        }
    }

    /// Assert nothing else arrives for a short while
    pub(crate) async fn assert_quiet(&mut self) {
        if let Ok(Some(event)) = timeout(QUIET_PERIOD, self.rx.recv()).await {
            panic!("Unexpected event: {:?}", event);
        }
    }
}

/// Listener that parks every disconnect notification until released
///
/// While parked, the client's session is closed but it is still in the
/// connection table and its room.
pub(crate) struct TeardownGate {
    entered: mpsc::UnboundedSender<ClientId>,
    hold: Mutex<std_mpsc::Receiver<()>>,
}

impl TeardownGate {
    pub(crate) fn new() -> (Arc<Self>, GateControl) {
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let gate = Arc::new(Self {
            entered: entered_tx,
            hold: Mutex::new(release_rx),
        });
        let control = GateControl {
            entered: entered_rx,
            release: release_tx,
        };
        (gate, control)
    }
}

impl ClientListener for TeardownGate {
    fn on_disconnect(&self, client: &Arc<Connection>) {
        let _ = self.entered.send(client.id());
        let hold = self.hold.lock().unwrap_or_else(|e| e.into_inner());
        // Returns at once after release, since the sender is gone
        let _ = hold.recv_timeout(EVENT_TIMEOUT);
    }
}

pub(crate) struct GateControl {
    entered: mpsc::UnboundedReceiver<ClientId>,
    release: std_mpsc::Sender<()>,
}

impl GateControl {
    /// Wait for a client's teardown to reach the gate
    pub(crate) async fn parked(&mut self) -> ClientId {
        timeout(EVENT_TIMEOUT, self.entered.recv())
            .await
            .expect("timed out waiting for teardown")
            .expect("gate dropped")
    }

    /// Let every parked and future teardown through
    pub(crate) fn release(self) {
        drop(self.release);
    }
}

/// Server on an ephemeral loopback port with a recorder already registered
pub(crate) async fn local_server() -> (Server, Events) {
    let server = Server::with_config(&ServerConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
    })
    .await
    .unwrap();
    let (recorder, events) = Recorder::new();
    server.add_client_listener(recorder);
    (server, events)
}

/// Raw line-level peer, for driving the wire protocol by hand
pub(crate) struct RawPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    pub(crate) async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub(crate) async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next line without its terminator, or None at end of stream
    pub(crate) async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = timeout(EVENT_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for line")
            .unwrap();
        if read == 0 {
            return None;
        }
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Wait until `check` holds, polling briefly
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
