//! Sender: the data-socket side of a device's replication link (spec §4.6
//! "Send path (`send`)", "Send-barrier policy").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use rdbd_core::TransferLog;

use crate::error::Result;
use crate::io::{write_packet, TimeoutPolicy};
use crate::packet::Packet;

/// Counters for successfully sent packets. Only advanced once a full
/// packet send completes — never on a partial-write retry (spec §9 "open
/// question: `send_cnt` accounting with partial sends").
#[derive(Debug, Default)]
pub struct SendStats {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl SendStats {
    fn record_send(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Total packets sent successfully since creation.
    pub fn packets_sent(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Total payload+header bytes sent successfully since creation.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Drives the data socket: serializes every outgoing packet through one
/// send mutex so a barrier is never reordered with the data that preceded
/// it (spec §5 ordering guarantee), and folds the transfer log's
/// `ISSUE_BARRIER` signal into the send path automatically.
pub struct Sender<W> {
    writer: Mutex<W>,
    tl: Arc<TransferLog>,
    timeout: Duration,
    /// Notified by a timed-out send; the asender watches this to emit an
    /// out-of-band `Ping` on the meta socket (spec §4.6 asender loop).
    pub ping_requested: Arc<Notify>,
    cancel: CancellationToken,
    stats: SendStats,
}

impl<W> Sender<W>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    pub fn new(writer: W, tl: Arc<TransferLog>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            writer: Mutex::new(writer),
            tl,
            timeout,
            ping_requested: Arc::new(Notify::new()),
            cancel,
            stats: SendStats::default(),
        }
    }

    pub fn stats(&self) -> &SendStats {
        &self.stats
    }

    /// Send one already-built packet over an already-locked writer,
    /// honoring the data socket's request-ping timeout policy.
    async fn send_locked(&self, writer: &mut W, packet: &Packet) -> Result<()> {
        let len = packet.encode().len();
        write_packet(
            writer,
            packet,
            self.timeout,
            TimeoutPolicy::RequestPing,
            &self.ping_requested,
            &self.cancel,
        )
        .await?;
        self.stats.record_send(len);
        Ok(())
    }

    /// Send a `Data` packet for an application write, prepending a
    /// `Barrier` first if the transfer log's ring has crossed 75% full
    /// since the last one. The whole sequence — barrier append, `Barrier`
    /// send, `Data` send — runs under one held send-mutex guard so nothing
    /// else can interleave a conflicting barrier/data ordering (spec §4.6).
    pub async fn send_data(&self, sector: u64, block_id: u64, payload: bytes::Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.tl.should_issue_barrier() {
            if let Ok(bnr) = self.tl.add_barrier() {
                self.send_locked(&mut writer, &Packet::Barrier { barrier_nr: bnr }).await?;
            }
        }
        self.send_locked(&mut writer, &Packet::Data { sector, block_id, payload }).await
    }

    /// Send a bare `Barrier` packet outside the automatic 75%-full policy
    /// (e.g. an explicit flush request).
    pub async fn send_barrier(&self, barrier_nr: u32) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.send_locked(&mut writer, &Packet::Barrier { barrier_nr }).await
    }

    /// Send a `ReportParams` handshake packet (post-(re)connect).
    pub async fn send_report_params(&self, params: crate::packet::ReportParams) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.send_locked(&mut writer, &Packet::ReportParams(params)).await
    }

    /// Notify the peer of a connection-state change (spec §4.7
    /// `set_cstate`); callers only reach for this once the data socket is
    /// known healthy.
    pub async fn send_cstate_changed(&self, cstate: u32) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.send_locked(&mut writer, &Packet::CStateChanged { cstate }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn barrier_is_sent_once_tl_crosses_three_quarters_full() {
        let (a, mut b) = tokio::io::duplex(8192);
        let tl = Arc::new(TransferLog::new(8));
        let sender = Sender::new(a, tl.clone(), Duration::from_secs(1), CancellationToken::new());
        for i in 0..6 {
            tl.append_write(i, i).unwrap();
            sender.send_data(i, i, bytes::Bytes::new()).await.unwrap();
        }
        // 6/8 crossed 75%; the 6th send must have been preceded by a Barrier.
        let first = crate::io::read_packet(&mut b).await.unwrap();
        assert!(matches!(first, Packet::Data { .. }), "writes 1..5 send plain Data");
        for _ in 0..4 {
            let _ = crate::io::read_packet(&mut b).await.unwrap();
        }
        let maybe_barrier = crate::io::read_packet(&mut b).await.unwrap();
        assert!(matches!(maybe_barrier, Packet::Barrier { .. }));
    }
}
