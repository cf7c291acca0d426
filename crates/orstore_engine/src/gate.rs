//! Single-flight guard for persistence loops.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Admits one persistence drain at a time.
///
/// Callers that find the gate taken wait until it is released and then
/// re-check whether they still have anything to persist.
#[derive(Default)]
pub(crate) struct PersistGate {
    busy: AtomicBool,
    released: Notify,
}

/// Holds the gate until dropped.
pub(crate) struct GatePass<'a> {
    gate: &'a PersistGate,
}

impl PersistGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Runs `pending` and, while it reports work, acquires the gate.
    ///
    /// Returns `Ok(None)` once `pending` reports nothing left to do.
    pub(crate) async fn enter<E>(
        &self,
        mut pending: impl FnMut() -> Result<bool, E>,
    ) -> Result<Option<GatePass<'_>>, E> {
        loop {
            // Registered before the checks so a release in between is seen.
            let released = self.released.notified();
            if !pending()? {
                return Ok(None);
            }
            if self
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Some(GatePass { gate: self }));
            }
            released.await;
        }
    }

    /// Wakes every waiter without releasing the gate.
    pub(crate) fn wake(&self) {
        self.released.notify_waiters();
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
        self.gate.released.notify_waiters();
    }
}
