//! Network error types

use std::fmt;
use std::io;

use crate::id::{ClientId, RoomId};

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Line too long: {len} bytes (max {max})")]
    LineTooLong { len: usize, max: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("Unknown room: {0}")]
    UnknownRoom(RoomId),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

/// Aggregate failure of a fan-out send.
///
/// Delivery to every other recipient has already been attempted when this
/// is returned.
#[derive(Debug)]
pub struct BroadcastError {
    /// Number of recipients a send was attempted on
    pub attempted: usize,
    /// Recipients whose send failed, with the failure
    pub failures: Vec<(ClientId, Error)>,
}

impl BroadcastError {
    /// Ids of the recipients that did not receive the payload
    pub fn failed_clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.failures.iter().map(|(id, _)| *id)
    }
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Broadcast failed for {} of {} recipients",
            self.failures.len(),
            self.attempted
        )
    }
}

impl std::error::Error for BroadcastError {}

/// Collects per-recipient send results during a fan-out.
#[derive(Debug, Default)]
pub(crate) struct BroadcastOutcome {
    attempted: usize,
    failures: Vec<(ClientId, Error)>,
}

impl BroadcastOutcome {
    pub(crate) fn record(&mut self, id: ClientId, result: Result<()>) {
        self.attempted += 1;
        if let Err(e) = result {
            self.failures.push((id, e));
        }
    }

    pub(crate) fn finish(self) -> std::result::Result<(), BroadcastError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(BroadcastError {
                attempted: self.attempted,
                failures: self.failures,
            })
        }
    }
}
