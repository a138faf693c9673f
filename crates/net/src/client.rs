//! TCP client for connecting to a server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, ControlOp, Frame};
use crate::listener::{ListenerSet, ServerListener};
use crate::session::{CloseMode, Session, SessionState};

/// Client handle for network operations
pub struct Client {
    peer_addr: SocketAddr,
    inner: Arc<ClientInner>,
}

struct ClientInner {
    session: Session,
    listeners: ListenerSet<dyn ServerListener>,
}

impl ClientInner {
    async fn shutdown(&self, mode: CloseMode) -> Result<()> {
        if !self.session.begin_close() {
            return Err(Error::ConnectionClosed);
        }
        let result = self.session.release(mode).await;
        self.listeners.dispatch(|l| l.on_disconnect());
        info!("Disconnected from server");
        result
    }
}

impl Client {
    /// Connect to a server
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::open(addr, None).await
    }

    /// Connect to a server with a listener registered before the first
    /// frame can be read, so nothing the server sends early is missed
    pub async fn connect_with_listener(
        addr: SocketAddr,
        listener: Arc<dyn ServerListener>,
    ) -> Result<Self> {
        Self::open(addr, Some(listener)).await
    }

    async fn open(addr: SocketAddr, listener: Option<Arc<dyn ServerListener>>) -> Result<Self> {
        info!(addr = %addr, "Connecting to server");

        let stream = TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let inner = Arc::new(ClientInner {
            session: Session::new(writer),
            listeners: ListenerSet::default(),
        });
        if let Some(listener) = listener {
            inner.listeners.add(listener);
        }

        // Spawn connection handler
        tokio::spawn(connection_task(inner.clone(), BufReader::new(reader)));

        Ok(Client { peer_addr, inner })
    }

    /// Address of the server this client is connected to
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns false if this listener was already registered
    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ServerListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Send a message to the server
    pub async fn send(&self, message: &str) -> Result<()> {
        self.inner.session.send(message).await
    }

    /// Tell the server we are leaving, then close the connection
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.shutdown(CloseMode::Announced).await
    }

    /// Close the connection without telling the server
    pub async fn close(&self) {
        let _ = self.inner.shutdown(CloseMode::Silent).await;
    }

    /// Get current connection state
    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.inner.session.is_open() {
            return;
        }
        // Without a runtime the read task is gone already
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move {
                let _ = inner.shutdown(CloseMode::Silent).await;
            });
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Main connection task
async fn connection_task(inner: Arc<ClientInner>, mut reader: BufReader<OwnedReadHalf>) {
    loop {
        tokio::select! {
            biased;
            _ = inner.session.released() => {
                debug!("Read loop stopped by local close");
                break;
            }
            result = read_frame(&mut reader) => {
                match result {
                    Ok(Frame::Payload(message)) => {
                        if !inner.session.is_open() {
                            break;
                        }
                        inner.listeners.dispatch(|l| l.on_message(&message));
                    }
                    Ok(Frame::Control { op: ControlOp::Disconnect, .. }) => {
                        debug!("Server announced disconnect");
                        break;
                    }
                    Ok(Frame::Control { op: ControlOp::Ping, .. }) => {
                        if let Err(e) = inner.session.send_control(ControlOp::Pong).await {
                            debug!(error = %e, "Failed to answer ping");
                        }
                    }
                    Ok(Frame::Control { op, .. }) => {
                        debug!(op = %op, "Ignoring control frame");
                    }
                    Err(Error::Protocol(reason)) => {
                        warn!(reason = %reason, "Skipping malformed line");
                    }
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }
        }
    }

    let _ = inner.shutdown(CloseMode::Silent).await;
}
