//! Per-connection output path and lifecycle state
//!
//! Shared by the server-side [`Connection`](crate::Connection) and the
//! [`Client`](crate::Client). The read half of the stream is owned by the
//! read loop task; everything else lives here.

use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::{write_frame, ControlOp, Frame};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Teardown has started; no further sends are accepted
    Closing,
    /// Stream released in both directions
    Closed,
}

/// How a session announces its end to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    /// Release the stream without telling the peer
    Silent,
    /// Send a `disconnect` control frame first
    Announced,
}

pub(crate) struct Session {
    /// Serializes writers so frames never interleave
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    state: Mutex<SessionState>,
    /// Wakes the read loop when the stream is released locally
    released: Notify,
}

impl Session {
    pub(crate) fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: AsyncMutex::new(Some(writer)),
            state: Mutex::new(SessionState::Open),
            released: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Send a payload frame; only allowed while Open
    pub(crate) async fn send(&self, message: &str) -> Result<()> {
        let frame = Frame::payload(message)?;
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.write(&frame).await
    }

    /// Send a control frame; only allowed while Open
    pub(crate) async fn send_control(&self, op: ControlOp) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.write(&Frame::control(op)).await
    }

    async fn write(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::ConnectionClosed)?;
        write_frame(writer, frame).await
    }

    /// Move Open → Closing. Returns false if teardown already started, in
    /// which case the caller must not run it again.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != SessionState::Open {
            return false;
        }
        *state = SessionState::Closing;
        true
    }

    /// Release the stream (Closing → Closed), announcing the end first when
    /// asked to. The announcement's write error, if any, is returned after
    /// the stream has been released regardless.
    pub(crate) async fn release(&self, mode: CloseMode) -> Result<()> {
        let mut result = Ok(());
        {
            let mut guard = self.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                if mode == CloseMode::Announced {
                    result = write_frame(&mut writer, &Frame::control(ControlOp::Disconnect)).await;
                }
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "Stream shutdown failed");
                }
            }
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Closed;
        self.released.notify_one();
        result
    }

    /// Resolves once [`release`](Self::release) has run
    pub(crate) async fn released(&self) {
        self.released.notified().await;
    }
}
