//! TCP server accepting clients and coordinating rooms
//!
//! Each accepted client gets its own read loop task. Payload lines are handed
//! to the registered [`ClientListener`]s and, when the client is in a room, to
//! that room's [`RoomListener`]s. Control lines (disconnect, ping, pong) are
//! handled by the engine and never reach listeners.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{BroadcastOutcome, Error, Result};
use crate::frame::Frame;
use crate::id::{ClientId, RoomId};
use crate::listener::{ClientListener, ListenerSet};
use crate::ping::{PingHandle, PingTracker};
use crate::room::Room;
use crate::tables::Tables;

/// Server state shared across tasks
pub(crate) struct Shared {
    tables: Mutex<Tables>,
    listeners: ListenerSet<dyn ClientListener>,
    pub(crate) pings: PingTracker,
    accepting: AtomicBool,
    /// Signalled each time a client leaves the connection table
    removed: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            listeners: ListenerSet::default(),
            pings: PingTracker::default(),
            accepting: AtomicBool::new(true),
            removed: Notify::new(),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with exclusive access to the connection and room tables
    pub(crate) fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables();
        f(&mut tables)
    }

    /// Register a freshly accepted stream and start its read loop
    fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (reader, writer) = stream.into_split();
        let client = Arc::new(Connection::new(
            ClientId::new(),
            addr,
            writer,
            Arc::downgrade(self),
        ));

        self.with_tables(|tables| tables.insert_client(client.clone()));
        info!(client_id = %client.id(), addr = %addr, "Client connected");

        self.listeners.dispatch(|l| l.on_connect(&client));

        tokio::spawn(client.run(BufReader::new(reader)));
    }

    pub(crate) fn dispatch_message(&self, client: &Arc<Connection>, message: &str) {
        debug!(client_id = %client.id(), len = message.len(), "Message received");
        self.listeners.dispatch(|l| l.on_message(client, message));
        if let Some(room) = self.with_tables(|tables| tables.room_of(client.id())) {
            room.listeners
                .dispatch(|l| l.on_client_message(client, message));
        }
    }

    /// Notify listeners of a finished session, then drop it from every table
    ///
    /// A closing client cannot be moved or taken out of its room, so the room
    /// read here is still the client's room when its listeners run. Only
    /// removing the whole room in the meantime detaches it early.
    pub(crate) fn finish_disconnect(&self, client: &Arc<Connection>) {
        let room = self.with_tables(|tables| tables.room_of(client.id()));

        self.listeners.dispatch(|l| l.on_disconnect(client));
        if let Some(room) = &room {
            room.listeners.dispatch(|l| l.on_client_disconnect(client));
        }

        self.with_tables(|tables| tables.remove_client(client.id()));
        self.pings.cancel(client.id());
        self.removed.notify_waiters();

        info!(client_id = %client.id(), "Client disconnected");
    }
}

/// Server handle
pub struct Server {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Start a new server on the given port of every interface; 0 picks a
    /// free port
    pub async fn start(port: u16) -> Result<Self> {
        Self::with_config(&ServerConfig {
            port,
            ..ServerConfig::default()
        })
        .await
    }

    /// Start a new server on the configured address
    pub async fn with_config(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(Shared::new());

        // Spawn accept loop
        let accept_task = tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            shutdown_tx.subscribe(),
        ));

        Ok(Server {
            addr: bound_addr,
            shared,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Returns false if this listener was already registered
    pub fn add_client_listener(&self, listener: Arc<dyn ClientListener>) -> bool {
        self.shared.listeners.add(listener)
    }

    pub fn remove_client_listener(&self, listener: &Arc<dyn ClientListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    /// Whether new connections are admitted
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// While disabled, incoming connections are closed as soon as they are
    /// accepted, without any listener being notified
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Snapshot of the connected clients
    pub fn clients(&self) -> Vec<Arc<Connection>> {
        self.shared.with_tables(|tables| tables.clients())
    }

    pub fn client(&self, id: ClientId) -> Option<Arc<Connection>> {
        self.shared.with_tables(|tables| tables.client(id))
    }

    pub fn client_count(&self) -> usize {
        self.shared.with_tables(|tables| tables.client_count())
    }

    /// Create and register an empty room
    pub fn create_room(&self) -> Arc<Room> {
        let room = Arc::new(Room::new(Arc::downgrade(&self.shared)));
        self.shared
            .with_tables(|tables| tables.insert_room(room.clone()));
        debug!(room_id = %room.id(), "Room created");
        room
    }

    /// Register again a room previously removed from this server
    ///
    /// Returns false if the room is already registered or was created by
    /// another server.
    pub fn add_room(&self, room: &Arc<Room>) -> bool {
        if !room.belongs_to(&self.shared) {
            return false;
        }
        self.shared
            .with_tables(|tables| tables.insert_room(room.clone()))
    }

    /// Unregister a room. Its members stay connected but are left roomless.
    pub fn remove_room(&self, room: &Room) -> bool {
        let removed = self
            .shared
            .with_tables(|tables| tables.remove_room(room.id()))
            .is_some();
        if removed {
            debug!(room_id = %room.id(), "Room removed");
        }
        removed
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.shared.with_tables(|tables| tables.rooms())
    }

    pub fn room(&self, id: RoomId) -> Option<Arc<Room>> {
        self.shared.with_tables(|tables| tables.room(id))
    }

    /// Send a message to one client
    pub async fn send(&self, id: ClientId, message: &str) -> Result<()> {
        let client = self.client(id).ok_or(Error::UnknownClient(id))?;
        client.send(message).await
    }

    /// Broadcast a message to all connected clients
    pub async fn broadcast(&self, message: &str) -> Result<()> {
        self.broadcast_except(message, &HashSet::new()).await
    }

    /// Broadcast a message to all clients not in `exclude`
    ///
    /// Every recipient is tried; failures are reported together afterwards.
    pub async fn broadcast_except(
        &self,
        message: &str,
        exclude: &HashSet<ClientId>,
    ) -> Result<()> {
        Frame::payload(message)?;

        let mut outcome = BroadcastOutcome::default();
        for client in self.clients() {
            if exclude.contains(&client.id()) {
                continue;
            }
            let result = client.send(message).await;
            if let Err(e) = &result {
                debug!(client_id = %client.id(), error = %e, "Broadcast to client failed");
            }
            outcome.record(client.id(), result);
        }
        outcome.finish().map_err(Error::from)
    }

    /// Announce the disconnect to a client and drop it from every table
    pub async fn kick(&self, id: ClientId) -> Result<()> {
        let client = self.client(id).ok_or(Error::UnknownClient(id))?;
        info!(client_id = %id, "Kicking client");
        client.kick().await
    }

    /// Probe a client's round-trip latency
    ///
    /// The returned handle completes when the client answers. Starting a new
    /// probe for the same client before then orphans this one, and so does
    /// the client disconnecting: an orphaned handle never completes.
    pub async fn get_ping(&self, id: ClientId) -> Result<PingHandle> {
        let client = self.client(id).ok_or(Error::UnknownClient(id))?;
        let handle = self.shared.pings.start(id);
        if let Err(e) = client.send_ping().await {
            self.shared.pings.cancel(id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Stop accepting and release the listening socket, then kick every
    /// client
    ///
    /// Returns once the connection table is empty, including clients whose
    /// teardown was already under way.
    pub async fn close(&self) {
        self.set_accepting(false);

        // No client can be admitted once the accept loop has exited
        let _ = self.shutdown_tx.send(());
        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        for client in self.clients() {
            if let Err(e) = client.kick().await {
                debug!(client_id = %client.id(), error = %e, "Kick during shutdown failed");
            }
        }

        loop {
            // Created before the check so a removal in between is not missed
            let removed = self.shared.removed.notified();
            let remaining = self.client_count();
            if remaining == 0 {
                break;
            }
            debug!(remaining, "Waiting for client teardown");
            removed.await;
        }

        info!(addr = %self.addr, "Server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Stops the accept loop if close() was never called
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("clients", &self.client_count())
            .finish()
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if !shared.accepting.load(Ordering::SeqCst) {
                            debug!(addr = %addr, "Refusing connection: not accepting");
                            drop(stream);
                            continue;
                        }
                        shared.admit(stream, addr);
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}
