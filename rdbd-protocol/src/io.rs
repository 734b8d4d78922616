//! Low-level framed read/write over a single socket (spec §4.6 "Wire
//! framing", "Send path (`send`)").
//!
//! Generic over `AsyncRead`/`AsyncWrite` so the same code path drives a
//! real `TcpStream` in production and an in-memory `tokio::io::duplex` pipe
//! in tests, the same way `fatrs`'s `ReadWriteSeek` bound lets its tests
//! swap a `Cursor` in for a real block device.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};
use crate::packet::{Header, Packet, HEADER_LEN};

/// What a send timeout means on this socket (spec §4.6 table: data socket
/// timeout requests a ping; meta socket timeout tears the connection down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Expiry asks the asender to probe with a `Ping`; the send itself is
    /// retried rather than failed.
    RequestPing,
    /// Expiry is fatal to the connection.
    TearDown,
}

/// Read one full packet (header + body + payload) from `r`.
pub async fn read_packet<R>(r: &mut R) -> Result<Packet>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    r.read_exact(&mut header_buf)
        .await
        .map_err(ProtocolError::BrokenPipe)?;
    let header = Header::decode(&header_buf)?;
    let mut rest = vec![0u8; header.length as usize];
    if !rest.is_empty() {
        r.read_exact(&mut rest).await.map_err(ProtocolError::BrokenPipe)?;
    }
    Packet::decode(header, Bytes::from(rest))
}

/// Write `packet` to `w`, retrying partial writes, subject to `timeout` and
/// `cancel`. On timeout, `on_timeout` decides whether to retry (with a
/// fresh notification to the asender's ping watcher) or fail outright,
/// matching [`TimeoutPolicy`].
///
/// Byte/packet counters must only advance after a full packet send
/// succeeds (spec §9 "`send_cnt` accounting with partial sends" — the
/// caller, not this function, bumps its stats on `Ok(())`).
pub async fn write_packet<W>(
    w: &mut W,
    packet: &Packet,
    timeout: Duration,
    policy: TimeoutPolicy,
    ping_requested: &tokio::sync::Notify,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut body: BytesMut = BytesMut::from(&packet.encode()[..]);
    loop {
        let write_fut = w.write_all_buf(&mut body);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            res = write_fut => {
                return res.map_err(ProtocolError::BrokenPipe);
            }
            _ = tokio::time::sleep(timeout) => {
                match policy {
                    TimeoutPolicy::TearDown => return Err(ProtocolError::SendTimeout(timeout)),
                    TimeoutPolicy::RequestPing => {
                        ping_requested.notify_one();
                        // body still holds the unsent remainder; loop retries it.
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[tokio::test]
    async fn round_trips_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let ping = tokio::sync::Notify::new();
        let packet = Packet::BarrierAck { barrier_nr: 9, set_size: 4 };
        write_packet(&mut a, &packet, Duration::from_secs(1), TimeoutPolicy::TearDown, &ping, &cancel)
            .await
            .unwrap();
        let got = read_packet(&mut b).await.unwrap();
        assert!(matches!(got, Packet::BarrierAck { barrier_nr: 9, set_size: 4 }));
    }

    #[tokio::test]
    async fn ping_policy_retries_instead_of_failing_on_timeout() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let ping = tokio::sync::Notify::new();
        let packet = Packet::Ping;
        // Nobody reads from `b`, and the duplex buffer is large enough that
        // this tiny packet never blocks — so a RequestPing timeout would
        // only fire if the timeout were absurdly short. Use a short timeout
        // to exercise the retry path, then drain from `b` before the retry
        // limit matters for the test's own timeout.
        let send = write_packet(
            &mut a,
            &packet,
            Duration::from_millis(5),
            TimeoutPolicy::RequestPing,
            &ping,
            &cancel,
        );
        let drain = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = read_packet(&mut b).await;
        };
        tokio::join!(send, drain).0.unwrap();
    }
}
