//! Asender: the meta-socket loop (spec §4.6 "asender").
//!
//! Owns both halves of the meta socket. Inbound `RecvAck`/`WriteAck`
//! advance the local [`RequestTracker`]; inbound `BarrierAck` releases the
//! transfer log up to that barrier; inbound `Ping` is answered with
//! `PingAck` and vice versa. Outbound acks produced by a [`Receiver`] and
//! outbound `Ping`s requested by a stalled [`Sender`] both flow through
//! `outgoing`, so the socket never needs two independent writers.
//!
//! [`Receiver`]: crate::receiver::Receiver
//! [`Sender`]: crate::sender::Sender

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use rdbd_core::{Advance, RequestStage, RequestTracker, TransferLog};

use crate::error::Result;
use crate::io::{read_packet, write_packet, TimeoutPolicy};
use crate::packet::Packet;

/// Runs the meta socket's combined read/write loop until cancelled or the
/// socket closes.
pub struct Asender {
    tracker: Arc<RequestTracker>,
    tl: Arc<TransferLog>,
    /// Notified when the data socket's sender wants an out-of-band `Ping`
    /// because a send stalled past its timeout.
    ping_requested: Arc<Notify>,
    outgoing: mpsc::Receiver<Packet>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Asender {
    pub fn new(
        tracker: Arc<RequestTracker>,
        tl: Arc<TransferLog>,
        ping_requested: Arc<Notify>,
        outgoing: mpsc::Receiver<Packet>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { tracker, tl, ping_requested, outgoing, timeout, cancel }
    }

    /// Drive `socket` (meta socket, already connected) until cancellation.
    /// `R`/`W` are split halves of the same stream in production and of a
    /// `tokio::io::duplex` pipe in tests.
    pub async fn run<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),

                incoming = read_packet(&mut reader) => {
                    self.handle_incoming(incoming?, &mut writer).await?;
                }

                Some(outgoing) = self.outgoing.recv() => {
                    self.send(&mut writer, &outgoing).await?;
                }

                _ = self.ping_requested.notified() => {
                    self.send(&mut writer, &Packet::Ping).await?;
                }
            }
        }
    }

    async fn handle_incoming<W>(&self, packet: Packet, writer: &mut W) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        match packet {
            Packet::RecvAck { block_id } => {
                if self.tracker.advance(block_id, RequestStage::SENT) == Advance::CompleteClean {
                    self.tracker.forget(block_id);
                }
            }
            Packet::WriteAck { block_id } => {
                let advance = self.tracker.advance(block_id, RequestStage::SENT | RequestStage::WRITTEN);
                if advance == Advance::CompleteClean {
                    self.tracker.forget(block_id);
                }
            }
            Packet::BarrierAck { barrier_nr, set_size } => {
                self.tl.release(barrier_nr, set_size);
            }
            Packet::Ping => {
                self.send(writer, &Packet::PingAck).await?;
            }
            Packet::PingAck => {}
            other => {
                log::warn!("asender: unexpected packet on meta socket: {:?}", other.command());
            }
        }
        Ok(())
    }

    async fn send<W>(&self, writer: &mut W, packet: &Packet) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        write_packet(writer, packet, self.timeout, TimeoutPolicy::TearDown, &self.ping_requested, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdbd_core::Protocol;

    #[tokio::test]
    async fn write_ack_advances_tracker_to_written() {
        let tracker = Arc::new(RequestTracker::new(Protocol::C));
        tracker.register(7, 0);
        let tl = Arc::new(TransferLog::new(8));
        let (_out_tx, out_rx) = mpsc::channel(4);
        let mut asender = Asender::new(
            tracker.clone(),
            tl,
            Arc::new(Notify::new()),
            out_rx,
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        let (mut meta_a, meta_b) = tokio::io::duplex(4096);
        let (b_read, mut b_write) = tokio::io::split(meta_b);

        let run = tokio::spawn(async move {
            let _ = asender.run(b_read, &mut b_write).await;
        });

        write_packet(
            &mut meta_a,
            &Packet::WriteAck { block_id: 7 },
            Duration::from_secs(1),
            TimeoutPolicy::TearDown,
            &Notify::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.len(), 0);
        run.abort();
    }

    #[tokio::test]
    async fn ping_is_answered_with_ping_ack() {
        let tracker = Arc::new(RequestTracker::new(Protocol::C));
        let tl = Arc::new(TransferLog::new(8));
        let (_out_tx, out_rx) = mpsc::channel(4);
        let mut asender = Asender::new(
            tracker,
            tl,
            Arc::new(Notify::new()),
            out_rx,
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        let (mut meta_a, meta_b) = tokio::io::duplex(4096);
        let (b_read, mut b_write) = tokio::io::split(meta_b);
        let run = tokio::spawn(async move {
            let _ = asender.run(b_read, &mut b_write).await;
        });

        write_packet(
            &mut meta_a,
            &Packet::Ping,
            Duration::from_secs(1),
            TimeoutPolicy::TearDown,
            &Notify::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let reply = read_packet(&mut meta_a).await.unwrap();
        assert!(matches!(reply, Packet::PingAck));
        run.abort();
    }
}
