//! Roomlink Network Library
//!
//! Line-based TCP client/server engine with rooms, broadcast and latency
//! probes.
//!
//! # Architecture
//!
//! - **Server**: accepts clients, keeps the connection and room tables
//! - **Connection**: one accepted client, with its own read loop task
//! - **Room**: a group of clients for scoped broadcast and events; a client
//!   is in at most one room at a time
//! - **Client**: connects to a server
//! - **Frame**: one UTF-8 line per message; lines starting with the
//!   [`SENTINEL`] token are engine control frames, all others are payloads
//!
//! # Usage
//!
//! ```ignore
//! // Host starts a server
//! let server = Server::start(7878).await?;
//! server.add_client_listener(Arc::new(MyListener));
//! let lobby = server.create_room();
//!
//! // Client connects
//! let client = Client::connect_with_listener(addr, Arc::new(MyServerListener)).await?;
//! client.send("hello").await?;
//!
//! // Server side, e.g. from a task spawned by a listener
//! lobby.add(&connection)?;
//! lobby.broadcast("someone joined").await?;
//! let latency = server.get_ping(connection.id()).await?.await;
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
mod id;
pub mod listener;
mod ping;
pub mod room;
pub mod server;
mod session;
mod tables;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::ServerConfig;
pub use connection::Connection;
pub use error::{BroadcastError, Error, Result};
pub use frame::SENTINEL;
pub use id::{ClientId, RoomId};
pub use listener::{ClientListener, RoomListener, ServerListener};
pub use ping::PingHandle;
pub use room::Room;
pub use server::Server;
pub use session::SessionState;

/// Default port for Roomlink servers
pub const DEFAULT_PORT: u16 = 7878;
