//! Server-side session for one accepted client

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, ControlOp, Frame};
use crate::id::ClientId;
use crate::room::Room;
use crate::server::Shared;
use crate::session::{CloseMode, Session, SessionState};

/// One connected client as seen by the server
pub struct Connection {
    id: ClientId,
    remote_addr: SocketAddr,
    session: Session,
    shared: Weak<Shared>,
}

impl Connection {
    pub(crate) fn new(
        id: ClientId,
        remote_addr: SocketAddr,
        writer: OwnedWriteHalf,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            session: Session::new(writer),
            shared,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.session.state() == SessionState::Closed
    }

    /// The room this client currently belongs to
    pub fn room(&self) -> Option<Arc<Room>> {
        let shared = self.shared.upgrade()?;
        shared.with_tables(|tables| tables.room_of(self.id))
    }

    /// Send one message to this client
    pub async fn send(&self, message: &str) -> Result<()> {
        self.session.send(message).await
    }

    /// Drop the connection without telling the client
    pub async fn close(self: &Arc<Self>) {
        // Nothing is written, so the only failure is "already closing"
        let _ = self.shutdown(CloseMode::Silent).await;
    }

    /// Tell the client it is being disconnected, then drop the connection
    ///
    /// Teardown completes even if the announcement cannot be written; the
    /// write error is returned afterwards.
    pub async fn kick(self: &Arc<Self>) -> Result<()> {
        self.shutdown(CloseMode::Announced).await
    }

    pub(crate) async fn send_ping(&self) -> Result<()> {
        self.session.send_control(ControlOp::Ping).await
    }

    async fn shutdown(self: &Arc<Self>, mode: CloseMode) -> Result<()> {
        if !self.session.begin_close() {
            return Err(Error::ConnectionClosed);
        }
        let result = self.session.release(mode).await;
        if let Some(shared) = self.shared.upgrade() {
            shared.finish_disconnect(self);
        }
        result
    }

    /// Read loop; runs until the peer leaves or the session is closed locally
    pub(crate) async fn run(self: Arc<Self>, mut reader: BufReader<OwnedReadHalf>) {
        loop {
            tokio::select! {
                biased;
                _ = self.session.released() => {
                    debug!(client_id = %self.id, "Read loop stopped by local close");
                    break;
                }
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Frame::Payload(message)) => {
                            if !self.session.is_open() {
                                break;
                            }
                            if let Some(shared) = self.shared.upgrade() {
                                shared.dispatch_message(&self, &message);
                            }
                        }
                        Ok(Frame::Control { op: ControlOp::Disconnect, .. }) => {
                            debug!(client_id = %self.id, "Client announced disconnect");
                            break;
                        }
                        Ok(Frame::Control { op: ControlOp::Pong, .. }) => {
                            if let Some(shared) = self.shared.upgrade() {
                                match shared.pings.resolve(self.id) {
                                    Some(elapsed) => {
                                        debug!(client_id = %self.id, elapsed_ms = elapsed.as_millis() as u64, "Pong received");
                                    }
                                    None => debug!(client_id = %self.id, "Unsolicited pong ignored"),
                                }
                            }
                        }
                        Ok(Frame::Control { op: ControlOp::Ping, .. }) => {
                            if let Err(e) = self.session.send_control(ControlOp::Pong).await {
                                debug!(client_id = %self.id, error = %e, "Failed to answer ping");
                            }
                        }
                        Ok(Frame::Control { op: ControlOp::Unknown(op), .. }) => {
                            debug!(client_id = %self.id, op = %op, "Ignoring unknown control op");
                        }
                        Err(Error::Protocol(reason)) => {
                            warn!(client_id = %self.id, reason = %reason, "Skipping malformed line");
                        }
                        Err(Error::ConnectionClosed) => {
                            debug!(client_id = %self.id, "Connection closed by peer");
                            break;
                        }
                        Err(e) => {
                            warn!(client_id = %self.id, error = %e, "Read error");
                            break;
                        }
                    }
                }
            }
        }

        // The peer is gone or already knows; nothing to announce
        let _ = self.shutdown(CloseMode::Silent).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}
