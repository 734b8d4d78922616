//! The single-slot metadata I/O buffer shared by the activity log and the
//! generation-counter record (spec §5 "Shared resources").
//!
//! Only one metadata write may be in flight at a time; callers block until
//! the slot is free or until disk I/O is explicitly disallowed (the disk
//! state dropped below `Negotiating`/`Attaching`).

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, Semaphore, SemaphorePermit};

use crate::error::{Error, Result};

/// Gates metadata I/O on whether the disk state currently permits it.
struct IoGate {
    allowed: AtomicBool,
    notify: Notify,
}

impl IoGate {
    fn new(initially_allowed: bool) -> Self {
        Self {
            allowed: AtomicBool::new(initially_allowed),
            notify: Notify::new(),
        }
    }

    fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
        if allowed {
            self.notify.notify_waiters();
        }
    }

    /// Waits until I/O is allowed, or returns `false` if it never becomes
    /// allowed because the gate was explicitly torn down.
    async fn wait_until_allowed(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            if self.allowed.load(Ordering::SeqCst) {
                return true;
            }
            notified.await;
        }
    }
}

/// Single-slot metadata I/O buffer: the on-disk analogue of a single shared
/// scratch page, serialized across the activity-log writer and the
/// generation-counter writer.
pub struct MetadataIoBuffer {
    semaphore: Semaphore,
    gate: IoGate,
}

impl MetadataIoBuffer {
    /// Create a buffer that starts out permitting metadata I/O (disk state
    /// at or above `Negotiating`/`Attaching`).
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
            gate: IoGate::new(true),
        }
    }

    /// Update whether the current disk state permits metadata I/O. Called
    /// by the state supervisor (C7) on every disk-state transition.
    pub fn set_disk_allows_io(&self, allowed: bool) {
        self.gate.set_allowed(allowed);
    }

    /// Acquire the buffer, waiting for both disk permission and the slot to
    /// free up. Fails with [`Error::MetadataIoUnavailable`] if the
    /// underlying semaphore was closed (shutdown).
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        if !self.gate.wait_until_allowed().await {
            return Err(Error::MetadataIoUnavailable);
        }
        self.semaphore
            .acquire()
            .await
            .map_err(|_| Error::MetadataIoUnavailable)
    }
}

impl Default for MetadataIoBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn single_slot_serializes_access() {
        let buf = Arc::new(MetadataIoBuffer::new());
        let first = buf.acquire().await.unwrap();
        let buf2 = buf.clone();
        let handle = tokio::spawn(async move {
            let _second = buf2.acquire().await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(first);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn blocks_while_disk_disallows_io() {
        let buf = Arc::new(MetadataIoBuffer::new());
        buf.set_disk_allows_io(false);
        let buf2 = buf.clone();
        let handle = tokio::spawn(async move { buf2.acquire().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        buf.set_disk_allows_io(true);
        handle.await.unwrap().unwrap();
    }
}
