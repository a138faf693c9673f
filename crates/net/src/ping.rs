//! Latency probes
//!
//! A probe is recorded when the server emits a `ping` control frame to a
//! client and resolved when that client's `pong` comes back. At most one
//! probe per client is tracked; starting another one orphans the earlier
//! handle, which then never completes. A probe whose connection closes first
//! is orphaned the same way, so callers should wrap the handle in their own
//! timeout.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

use crate::id::ClientId;

struct PendingPing {
    started: Instant,
    tx: oneshot::Sender<Duration>,
}

/// Outstanding probes keyed by client
#[derive(Default)]
pub(crate) struct PingTracker {
    pending: Mutex<HashMap<ClientId, PendingPing>>,
}

impl PingTracker {
    /// Record a probe start for `id`, replacing any outstanding one
    pub(crate) fn start(&self, id: ClientId) -> PingHandle {
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().insert(
            id,
            PendingPing {
                started: Instant::now(),
                tx,
            },
        );
        if previous.is_some() {
            debug!(client_id = %id, "Outstanding ping replaced by a new probe");
        }
        PingHandle {
            rx,
            orphaned: false,
        }
    }

    /// Complete the outstanding probe for `id` with the time since it started
    pub(crate) fn resolve(&self, id: ClientId) -> Option<Duration> {
        let pending = self.lock().remove(&id)?;
        let elapsed = pending.started.elapsed();
        // The caller may have dropped the handle already
        let _ = pending.tx.send(elapsed);
        Some(elapsed)
    }

    /// Drop the outstanding probe for `id` without completing it
    pub(crate) fn cancel(&self, id: ClientId) -> bool {
        self.lock().remove(&id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, PendingPing>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Round-trip time of one probe, available once the client has answered
///
/// Completes with the measured latency. If the probe is replaced or its
/// connection closes before the answer arrives, the handle stays pending
/// forever.
#[must_use = "a ping handle does nothing unless awaited"]
#[derive(Debug)]
pub struct PingHandle {
    rx: oneshot::Receiver<Duration>,
    orphaned: bool,
}

impl Future for PingHandle {
    type Output = Duration;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Duration> {
        if self.orphaned {
            return Poll::Pending;
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(elapsed)) => Poll::Ready(elapsed),
            Poll::Ready(Err(_)) => {
                self.orphaned = true;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
