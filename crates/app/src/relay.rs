//! Lobby relay
//!
//! Every client that connects is put in the lobby room. A payload from one
//! member is relayed to the rest of the lobby, except for a few commands:
//!
//! - `/who`: number of clients in the lobby
//! - `/ping`: measure the sender's round-trip latency
//! - `/quit`: get kicked
//!
//! Listener callbacks run on the engine's read loops, so they only queue a
//! command; a single relay task does the sending.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use roomlink_net::{ClientId, ClientListener, Connection, Error, Room, Server};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Give up on a latency probe after this long
const PING_TIMEOUT: Duration = Duration::from_secs(5);

enum RelayCommand {
    Joined(Arc<Connection>),
    Said(Arc<Connection>, String),
    Left(ClientId),
}

/// Queues engine events for the relay task
struct RelayListener {
    cmd_tx: mpsc::UnboundedSender<RelayCommand>,
}

impl ClientListener for RelayListener {
    fn on_connect(&self, client: &Arc<Connection>) {
        let _ = self.cmd_tx.send(RelayCommand::Joined(client.clone()));
    }

    fn on_disconnect(&self, client: &Arc<Connection>) {
        let _ = self.cmd_tx.send(RelayCommand::Left(client.id()));
    }

    fn on_message(&self, client: &Arc<Connection>, message: &str) {
        let _ = self
            .cmd_tx
            .send(RelayCommand::Said(client.clone(), message.to_string()));
    }
}

/// Handle to a running relay
pub struct Relay {
    lobby: Arc<Room>,
    listener: Arc<dyn ClientListener>,
}

impl Relay {
    /// Create the lobby on `server` and start relaying
    pub fn install(server: Arc<Server>, lobby_name: String) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let lobby = server.create_room();
        let listener: Arc<dyn ClientListener> = Arc::new(RelayListener { cmd_tx });
        server.add_client_listener(listener.clone());

        info!(room_id = %lobby.id(), lobby = %lobby_name, "Relay installed");
        tokio::spawn(relay_task(server, lobby.clone(), lobby_name, cmd_rx));

        Self { lobby, listener }
    }

    pub fn lobby(&self) -> &Arc<Room> {
        &self.lobby
    }

    /// Stop relaying; the relay task ends once queued commands are handled
    pub fn uninstall(self, server: &Server) {
        server.remove_client_listener(&self.listener);
        server.remove_room(&self.lobby);
    }
}

fn short_id(id: ClientId) -> String {
    id.to_string()[..8].to_string()
}

async fn relay_task(
    server: Arc<Server>,
    lobby: Arc<Room>,
    lobby_name: String,
    mut cmd_rx: mpsc::UnboundedReceiver<RelayCommand>,
) {
    // Clients that made it into the lobby; only they get a "left" line
    let mut joined = HashSet::new();
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            RelayCommand::Joined(client) => {
                let id = client.id();
                if let Err(e) = lobby.add(&client) {
                    debug!(client_id = %id, error = %e, "Client left before joining the lobby");
                    continue;
                }
                joined.insert(id);
                let _ = client
                    .send(&format!("* welcome to {}, you are {}", lobby_name, short_id(id)))
                    .await;
                announce(&lobby, &format!("* {} joined", short_id(id)), Some(id)).await;
            }
            RelayCommand::Said(client, message) => {
                handle_message(&server, &lobby, client, message).await;
            }
            RelayCommand::Left(id) => {
                if !joined.remove(&id) {
                    continue;
                }
                announce(&lobby, &format!("* {} left", short_id(id)), None).await;
            }
        }
    }
    debug!("Relay task finished");
}

async fn handle_message(
    server: &Arc<Server>,
    lobby: &Room,
    client: Arc<Connection>,
    message: String,
) {
    let id = client.id();
    match message.trim() {
        "/who" => {
            let _ = client
                .send(&format!("* {} in the lobby", lobby.size()))
                .await;
        }
        "/ping" => match server.get_ping(id).await {
            // Waiting on the probe must not hold up other clients
            Ok(handle) => {
                tokio::spawn(async move {
                    let reply = match tokio::time::timeout(PING_TIMEOUT, handle).await {
                        Ok(latency) => format!("* ping {} ms", latency.as_millis()),
                        Err(_) => "* ping timed out".to_string(),
                    };
                    let _ = client.send(&reply).await;
                });
            }
            Err(e) => debug!(client_id = %id, error = %e, "Ping failed"),
        },
        "/quit" => {
            if let Err(e) = server.kick(id).await {
                debug!(client_id = %id, error = %e, "Kick failed");
            }
        }
        _ => {
            let line = format!("{}: {}", short_id(id), message);
            announce(lobby, &line, Some(id)).await;
        }
    }
}

async fn announce(lobby: &Room, message: &str, except: Option<ClientId>) {
    let exclude: HashSet<ClientId> = except.into_iter().collect();
    match lobby.broadcast_except(message, &exclude).await {
        Ok(()) => {}
        Err(Error::Broadcast(e)) => {
            warn!(failed = e.failures.len(), attempted = e.attempted, "Relay broadcast incomplete");
        }
        Err(e) => warn!(error = %e, "Relay broadcast rejected"),
    }
}
