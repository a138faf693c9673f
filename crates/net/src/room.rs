//! Rooms: named groups of clients with scoped broadcast and events
//!
//! A client is in at most one room at a time. Adding it to a room moves it
//! out of whatever room it was in before, silently. Membership is stored in
//! the server's tables, so a `Room` handle is cheap and only meaningful
//! while its server is alive and the room is registered there.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::connection::Connection;
use crate::error::{BroadcastOutcome, Error, Result};
use crate::frame::Frame;
use crate::id::{ClientId, RoomId};
use crate::listener::{ListenerSet, RoomListener};
use crate::server::Shared;

pub struct Room {
    id: RoomId,
    shared: Weak<Shared>,
    pub(crate) listeners: ListenerSet<dyn RoomListener>,
}

impl Room {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self {
            id: RoomId::new(),
            shared,
            listeners: ListenerSet::default(),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    /// Put a client in this room, taking it out of its previous one
    ///
    /// Adding a client that is already a member does nothing.
    pub fn add(&self, client: &Arc<Connection>) -> Result<()> {
        self.shared()?
            .with_tables(|tables| tables.move_to_room(client, self.id))
    }

    /// Add several clients at once; if any of them cannot be added, none are
    pub fn add_all<'a>(
        &self,
        clients: impl IntoIterator<Item = &'a Arc<Connection>>,
    ) -> Result<()> {
        self.shared()?
            .with_tables(|tables| tables.move_all_to_room(clients, self.id))
    }

    /// Take a client out of this room. Returns false if it was not a member
    /// or is in the middle of disconnecting.
    pub fn remove(&self, client: &Connection) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            shared.with_tables(|tables| tables.remove_from_room(client.id(), self.id))
        })
    }

    /// Returns the number of clients that were members and got removed
    pub fn remove_all<'a>(
        &self,
        clients: impl IntoIterator<Item = &'a Arc<Connection>>,
    ) -> usize {
        let Some(shared) = self.shared.upgrade() else {
            return 0;
        };
        shared.with_tables(|tables| {
            clients
                .into_iter()
                .filter(|client| tables.remove_from_room(client.id(), self.id))
                .count()
        })
    }

    pub fn contains(&self, client: &Connection) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            shared.with_tables(|tables| tables.is_member(client.id(), self.id))
        })
    }

    pub fn size(&self) -> usize {
        self.shared
            .upgrade()
            .map_or(0, |shared| shared.with_tables(|tables| tables.room_size(self.id)))
    }

    /// Snapshot of the current members
    pub fn members(&self) -> Vec<Arc<Connection>> {
        self.shared
            .upgrade()
            .map(|shared| shared.with_tables(|tables| tables.room_members(self.id)))
            .unwrap_or_default()
    }

    pub fn add_listener(&self, listener: Arc<dyn RoomListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RoomListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Send a message to every member
    pub async fn broadcast(&self, message: &str) -> Result<()> {
        self.broadcast_except(message, &HashSet::new()).await
    }

    /// Send a message to every member not in `exclude`
    ///
    /// A failed send does not stop delivery to the remaining members; all
    /// failures are reported together once every member has been tried.
    pub async fn broadcast_except(
        &self,
        message: &str,
        exclude: &HashSet<ClientId>,
    ) -> Result<()> {
        Frame::payload(message)?;

        let mut outcome = BroadcastOutcome::default();
        for member in self.members() {
            if exclude.contains(&member.id()) {
                continue;
            }
            let result = member.send(message).await;
            if let Err(e) = &result {
                debug!(room_id = %self.id, client_id = %member.id(), error = %e, "Room broadcast to member failed");
            }
            outcome.record(member.id(), result);
        }
        outcome.finish().map_err(Error::from)
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.shared.as_ptr(), Arc::as_ptr(shared))
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared.upgrade().ok_or(Error::UnknownRoom(self.id))
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}
