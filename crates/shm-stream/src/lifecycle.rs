//! Peer thread lifecycle.
//!
//! A peer is the thread on the other side of a region. When it exits or fails
//! before closing its control word, the region is told via
//! [`ShmRegion::report_peer`], which releases every waiter so the surviving side
//! can resolve to an error instead of hanging.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crate::error::ShmError;
use crate::region::ShmRegion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer thread finished.
    Exited,
    /// The peer returned an error or panicked.
    Failed(String),
}

impl PeerEvent {
    /// The error a surviving side reports for this event.
    pub fn to_error(&self) -> ShmError {
        match self {
            PeerEvent::Exited => ShmError::PrematureClose,
            PeerEvent::Failed(reason) => ShmError::PeerFailed(reason.clone()),
        }
    }
}

thread_local! {
    static MANAGED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread was started by [`spawn_peer`].
///
/// Adapters dropped on a managed thread leave exit reporting to the manager.
pub(crate) fn is_managed_thread() -> bool {
    MANAGED.with(Cell::get)
}

/// A peer thread whose exit is reported to a region.
pub struct PeerHandle {
    name: String,
    handle: JoinHandle<PeerEvent>,
}

impl PeerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the peer and return how it ended.
    pub fn join(self) -> PeerEvent {
        self.handle
            .join()
            .unwrap_or_else(|payload| PeerEvent::Failed(panic_message(payload.as_ref())))
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Run `f` on a new named thread and report its outcome to `region`.
///
/// `Ok` reports [`PeerEvent::Exited`]; an `Err` or a panic reports
/// [`PeerEvent::Failed`]. Exits after the peer closed its word are harmless:
/// the surviving side has already seen `Closed`. Failing to start the thread
/// is reported as [`ShmError::Io`].
pub fn spawn_peer<F, E>(
    name: impl Into<String>,
    region: &ShmRegion,
    f: F,
) -> crate::error::Result<PeerHandle>
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: fmt::Display,
{
    let name = name.into();
    let region = region.clone();
    let thread_name = name.clone();
    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        MANAGED.with(|m| m.set(true));
        let event = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => PeerEvent::Exited,
            Ok(Err(err)) => PeerEvent::Failed(err.to_string()),
            Err(payload) => PeerEvent::Failed(panic_message(payload.as_ref())),
        };
        match &event {
            PeerEvent::Exited => tracing::debug!(peer = %thread_name, "peer exited"),
            PeerEvent::Failed(reason) => {
                tracing::warn!(peer = %thread_name, %reason, "peer failed")
            }
        }
        region.report_peer(event.clone());
        event
    })?;
    Ok(PeerHandle { name, handle })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "peer panicked".to_string()
    }
}
