//! Connection table, room table and room membership
//!
//! All three live behind one lock held by the server, so moving a client
//! between rooms and tearing a client down are each a single step: no
//! observer can see a client in the connection table but missing from its
//! room, or in a room it no longer belongs to.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::id::{ClientId, RoomId};
use crate::room::Room;

struct RoomEntry {
    room: Arc<Room>,
    members: HashMap<ClientId, Arc<Connection>>,
}

#[derive(Default)]
pub(crate) struct Tables {
    clients: HashMap<ClientId, Arc<Connection>>,
    rooms: HashMap<RoomId, RoomEntry>,
    /// Back-reference: the single room each client is in, if any
    membership: HashMap<ClientId, RoomId>,
}

impl Tables {
    pub(crate) fn insert_client(&mut self, client: Arc<Connection>) {
        self.clients.insert(client.id(), client);
    }

    /// Remove a client from the connection table and from its room
    pub(crate) fn remove_client(&mut self, id: ClientId) -> Option<Arc<Connection>> {
        self.leave_room(id);
        self.clients.remove(&id)
    }

    pub(crate) fn client(&self, id: ClientId) -> Option<Arc<Connection>> {
        self.clients.get(&id).cloned()
    }

    pub(crate) fn clients(&self) -> Vec<Arc<Connection>> {
        self.clients.values().cloned().collect()
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Returns false if a room with the same id is already registered
    pub(crate) fn insert_room(&mut self, room: Arc<Room>) -> bool {
        if self.rooms.contains_key(&room.id()) {
            return false;
        }
        self.rooms.insert(
            room.id(),
            RoomEntry {
                room,
                members: HashMap::new(),
            },
        );
        true
    }

    /// Unregister a room; its members stay connected but belong to no room
    pub(crate) fn remove_room(&mut self, id: RoomId) -> Option<Arc<Room>> {
        let entry = self.rooms.remove(&id)?;
        for member in entry.members.keys() {
            self.membership.remove(member);
        }
        Some(entry.room)
    }

    pub(crate) fn room(&self, id: RoomId) -> Option<Arc<Room>> {
        self.rooms.get(&id).map(|entry| entry.room.clone())
    }

    pub(crate) fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.values().map(|entry| entry.room.clone()).collect()
    }

    pub(crate) fn room_of(&self, id: ClientId) -> Option<Arc<Room>> {
        let room_id = self.membership.get(&id)?;
        self.room(*room_id)
    }

    /// Move a client into `room`, leaving its previous room if any
    pub(crate) fn move_to_room(&mut self, client: &Arc<Connection>, room: RoomId) -> Result<()> {
        self.check_movable(client, room)?;
        self.attach(client, room);
        Ok(())
    }

    /// Move several clients into `room`; nothing moves unless all of them can
    pub(crate) fn move_all_to_room<'a>(
        &mut self,
        clients: impl IntoIterator<Item = &'a Arc<Connection>>,
        room: RoomId,
    ) -> Result<()> {
        let clients: Vec<&Arc<Connection>> = clients.into_iter().collect();
        for client in &clients {
            self.check_movable(client, room)?;
        }
        for client in clients {
            self.attach(client, room);
        }
        Ok(())
    }

    /// Take a client out of `room`; false if it was not a member
    ///
    /// A client that is disconnecting stays in its room until its teardown
    /// removes it, so this also returns false for one.
    pub(crate) fn remove_from_room(&mut self, id: ClientId, room: RoomId) -> bool {
        if self.membership.get(&id) != Some(&room) {
            return false;
        }
        if self.clients.get(&id).is_some_and(|client| !client.is_open()) {
            return false;
        }
        self.leave_room(id);
        true
    }

    pub(crate) fn is_member(&self, id: ClientId, room: RoomId) -> bool {
        self.membership.get(&id) == Some(&room)
    }

    pub(crate) fn room_size(&self, room: RoomId) -> usize {
        self.rooms
            .get(&room)
            .map_or(0, |entry| entry.members.len())
    }

    pub(crate) fn room_members(&self, room: RoomId) -> Vec<Arc<Connection>> {
        self.rooms
            .get(&room)
            .map(|entry| entry.members.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check_movable(&self, client: &Connection, room: RoomId) -> Result<()> {
        if !self.rooms.contains_key(&room) {
            return Err(Error::UnknownRoom(room));
        }
        match self.clients.get(&client.id()) {
            Some(registered) if std::ptr::eq(Arc::as_ptr(registered), client) => {}
            _ => return Err(Error::UnknownClient(client.id())),
        }
        if !client.is_open() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn attach(&mut self, client: &Arc<Connection>, room: RoomId) {
        let id = client.id();
        if self.membership.get(&id) == Some(&room) {
            return;
        }
        self.leave_room(id);
        if let Some(entry) = self.rooms.get_mut(&room) {
            entry.members.insert(id, client.clone());
            self.membership.insert(id, room);
        }
    }

    fn leave_room(&mut self, id: ClientId) -> Option<RoomId> {
        let room = self.membership.remove(&id)?;
        if let Some(entry) = self.rooms.get_mut(&room) {
            entry.members.remove(&id);
        }
        Some(room)
    }
}
