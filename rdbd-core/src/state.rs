//! Role, connection, and disk state machines (spec §4.7 component C7).
//!
//! Three independent state axes describe a device at any moment: the
//! [`Role`] it plays (only `Primary` accepts application writes), the
//! [`ConnectionState`] of the replication link, and the [`DiskState`] of the
//! local backing disk. [`StateSupervisor`] holds all three behind one lock,
//! exposes transitions that wake waiters (matching the `al_wait`/
//! `misc_wait`/`cstate_wait` wakeups of spec §5), and gates metadata I/O
//! through [`crate::metadata_io::MetadataIoBuffer`] whenever the disk state
//! moves across the `Negotiating`/`Attaching` line (spec §4.7 "Metadata I/O
//! is permitted when...").

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::metadata_io::MetadataIoBuffer;

/// Role of a device: only `Primary` accepts application writes, and a
/// device is opened in write mode only if `Primary` (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
    Unknown,
}

/// Connection state of the replication link.
///
/// Transitions follow spec §4.7: `Unconfigured` is reached only once, at
/// shutdown, and is the sole terminal state; every other state can return
/// to `Unconnected` and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No peer has ever been configured; terminal.
    Unconfigured,
    /// Configured but not attempting to connect.
    StandAlone,
    /// Not connected, about to retry.
    Unconnected,
    /// TCP connect in progress.
    WfConnection,
    /// Connected, waiting for the peer's `ReportParams`.
    WfReportParams,
    /// Fully connected, peer is up to date.
    Connected,
    /// Fully connected, this side is the sync source for a full resync.
    SyncingAll,
    /// Fully connected, this side is the sync source for a quick
    /// (bitmap-only) resync.
    SyncingQuick,
    /// The data socket's send timed out and the ping went unanswered.
    Timeout,
    /// A socket reported an I/O error.
    BrokenPipe,
    /// A lower-level network failure was observed.
    NetworkFailure,
}

impl ConnectionState {
    /// True if application I/O and replication are both fully functional.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::SyncingAll
                | ConnectionState::SyncingQuick
        )
    }

    /// True once the data socket is healthy enough to carry
    /// `CStateChanged` notifications to the peer (spec §4.7 `set_cstate`).
    pub fn data_socket_healthy(self) -> bool {
        !matches!(
            self,
            ConnectionState::Unconfigured
                | ConnectionState::StandAlone
                | ConnectionState::Unconnected
                | ConnectionState::WfConnection
                | ConnectionState::Timeout
                | ConnectionState::BrokenPipe
                | ConnectionState::NetworkFailure
        )
    }
}

/// Disk state of the local backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    /// No local disk attached.
    Diskless,
    /// Local disk is being attached.
    Attaching,
    /// Local disk I/O failed; replicating from the peer only, if possible.
    Failed,
    /// Post-attach handshake with the peer in progress.
    Negotiating,
    /// Attached but known to be behind (e.g. freshly created, never synced).
    Inconsistent,
    /// Attached and consistent, but known stale relative to the peer.
    Outdated,
    /// Attached and consistent, not yet confirmed current.
    Consistent,
    /// Attached, consistent, and current.
    UpToDate,
}

impl DiskState {
    /// Metadata I/O is permitted at or above `Negotiating`, or while
    /// `Attaching` (spec §4.7).
    pub fn permits_metadata_io(self) -> bool {
        matches!(
            self,
            DiskState::Attaching
                | DiskState::Negotiating
                | DiskState::Inconsistent
                | DiskState::Outdated
                | DiskState::Consistent
                | DiskState::UpToDate
        )
    }
}

/// Snapshot of all three state axes, broadcast to waiters on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub role: Role,
    pub cstate: ConnectionState,
    pub dstate: DiskState,
}

/// Trait the sender implements so [`StateSupervisor::set_cstate`] can
/// notify the peer of a connection-state change without this module
/// depending on `rdbd-protocol` directly (spec §4.7 `set_cstate`: "sends
/// `CStateChanged` to the peer when the data socket is healthy").
pub trait PeerNotifier {
    fn notify_cstate_changed(&self, cstate: ConnectionState);
}

/// A notifier that drops the notification; used when no peer link exists
/// yet (e.g. `StandAlone`).
pub struct NoPeerNotifier;

impl PeerNotifier for NoPeerNotifier {
    fn notify_cstate_changed(&self, _cstate: ConnectionState) {}
}

/// Owns the role/connection/disk state triple for one device and gates the
/// metadata I/O buffer on disk-state transitions.
pub struct StateSupervisor {
    state: Mutex<DeviceState>,
    tx: watch::Sender<DeviceState>,
    io_buffer: Arc<MetadataIoBuffer>,
}

impl StateSupervisor {
    /// Create a supervisor starting in `Unknown`/`StandAlone`/`Diskless`.
    pub fn new(io_buffer: Arc<MetadataIoBuffer>) -> Self {
        let initial = DeviceState {
            role: Role::Unknown,
            cstate: ConnectionState::StandAlone,
            dstate: DiskState::Diskless,
        };
        let (tx, _rx) = watch::channel(initial);
        io_buffer.set_disk_allows_io(initial.dstate.permits_metadata_io());
        Self { state: Mutex::new(initial), tx, io_buffer }
    }

    /// Current snapshot.
    pub fn current(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    /// Subscribe to state changes; every transition is broadcast.
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.tx.subscribe()
    }

    /// Wait until the predicate holds against the live state, returning
    /// immediately if it already does.
    pub async fn wait_until(&self, mut pred: impl FnMut(DeviceState) -> bool) -> DeviceState {
        let mut rx = self.tx.subscribe();
        loop {
            let snapshot = *rx.borrow();
            if pred(snapshot) {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }

    pub fn set_role(&self, role: Role) {
        let mut state = self.state.lock().unwrap();
        state.role = role;
        self.tx.send_replace(*state);
    }

    /// Transition connection state, notifying the peer via `notifier` when
    /// the data socket is (or remains) healthy (spec §4.7 `set_cstate`).
    pub fn set_cstate(&self, cstate: ConnectionState, notifier: &dyn PeerNotifier) {
        let mut state = self.state.lock().unwrap();
        state.cstate = cstate;
        self.tx.send_replace(*state);
        if cstate.data_socket_healthy() {
            notifier.notify_cstate_changed(cstate);
        }
    }

    /// Transition disk state, updating the metadata I/O gate accordingly.
    pub fn set_dstate(&self, dstate: DiskState) {
        let mut state = self.state.lock().unwrap();
        state.dstate = dstate;
        self.tx.send_replace(*state);
        self.io_buffer.set_disk_allows_io(dstate.permits_metadata_io());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingNotifier(std::sync::Mutex<Vec<ConnectionState>>);

    impl PeerNotifier for RecordingNotifier {
        fn notify_cstate_changed(&self, cstate: ConnectionState) {
            self.0.lock().unwrap().push(cstate);
        }
    }

    #[test]
    fn only_primary_may_accept_writes_is_expressed_via_role() {
        let sup = StateSupervisor::new(Arc::new(MetadataIoBuffer::new()));
        assert_eq!(sup.current().role, Role::Unknown);
        sup.set_role(Role::Primary);
        assert_eq!(sup.current().role, Role::Primary);
    }

    #[test]
    fn cstate_change_notifies_peer_only_when_data_socket_healthy() {
        let sup = StateSupervisor::new(Arc::new(MetadataIoBuffer::new()));
        let notifier = RecordingNotifier(Mutex::new(Vec::new()));
        sup.set_cstate(ConnectionState::WfConnection, &notifier);
        assert!(notifier.0.lock().unwrap().is_empty());
        sup.set_cstate(ConnectionState::Connected, &notifier);
        assert_eq!(notifier.0.lock().unwrap(), vec![ConnectionState::Connected]);
    }

    #[test]
    fn disk_state_gates_metadata_io_permission() {
        assert!(!DiskState::Diskless.permits_metadata_io());
        assert!(DiskState::Attaching.permits_metadata_io());
        assert!(DiskState::Negotiating.permits_metadata_io());
        assert!(DiskState::UpToDate.permits_metadata_io());
    }

    #[tokio::test]
    async fn wait_until_resolves_once_predicate_holds() {
        let sup = Arc::new(StateSupervisor::new(Arc::new(MetadataIoBuffer::new())));
        let sup2 = sup.clone();
        let handle = tokio::spawn(async move {
            sup2.wait_until(|s| s.cstate == ConnectionState::Connected).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        sup.set_cstate(ConnectionState::Connected, &NoPeerNotifier);
        let state = handle.await.unwrap();
        assert_eq!(state.cstate, ConnectionState::Connected);
    }
}
