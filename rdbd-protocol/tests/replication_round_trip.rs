//! End-to-end wire-level integration tests driving `Sender`/`Receiver`/
//! `Asender` together over in-memory duplex pipes, standing in for a real
//! TCP data socket + meta socket pair.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use rdbd_block_device::{BlockDevice, MemoryBlockDevice};
use rdbd_core::{Bitmap, Protocol, RequestTracker, TransferLog};
use rdbd_protocol::{Asender, Receiver, Sender};

/// A clean write under protocol C round-trips: the sender's write is
/// durably applied on the "peer" device and the sender's `RequestTracker`
/// sees `WriteAck` complete the request.
#[tokio::test]
async fn protocol_c_write_completes_after_peer_write_ack() {
    let (data_a, data_b) = tokio::io::duplex(64 * 1024);
    let (meta_a, meta_b) = tokio::io::duplex(64 * 1024);
    let (data_a_read, data_a_write) = tokio::io::split(data_a);
    let (meta_a_read, meta_a_write) = tokio::io::split(meta_a);
    let (meta_b_read, meta_b_write) = tokio::io::split(meta_b);

    let tl = Arc::new(TransferLog::new(64));
    let tracker = Arc::new(RequestTracker::new(Protocol::C));
    let cancel = CancellationToken::new();

    let sender = Arc::new(Sender::new(data_a_write, tl.clone(), Duration::from_secs(2), cancel.clone()));

    let mut local_asender = Asender::new(
        tracker.clone(),
        tl.clone(),
        sender.ping_requested.clone(),
        mpsc::channel(1).1, // this side never emits its own acks/pings
        Duration::from_secs(2),
        cancel.clone(),
    );
    let asender_task = {
        let mut writer = meta_a_write;
        tokio::spawn(async move {
            let _ = local_asender.run(meta_a_read, &mut writer).await;
        })
    };

    let peer_device = Arc::new(Mutex::new(MemoryBlockDevice::new(64)));
    let peer_bitmap = Arc::new(Bitmap::new(64 * 1024 / 4096));
    peer_bitmap.mark_out_of_sync(0, 4096);
    let (ack_tx, ack_rx) = mpsc::channel(16);
    let receiver = Receiver::new(peer_device.clone(), peer_bitmap.clone(), Protocol::C, ack_tx, cancel.clone());
    let receiver_task = tokio::spawn(async move {
        let _ = receiver.run(data_b).await;
    });

    let mut peer_asender = Asender::new(
        Arc::new(RequestTracker::new(Protocol::C)),
        Arc::new(TransferLog::new(64)),
        Arc::new(Notify::new()),
        ack_rx,
        Duration::from_secs(2),
        cancel.clone(),
    );
    let peer_asender_task = tokio::spawn(async move {
        let _ = peer_asender.run(meta_b_read, meta_b_write).await;
    });

    tl.append_write(1, 0).unwrap();
    tracker.register(1, 0);
    tracker.advance(1, rdbd_core::RequestStage::IN_TL);
    sender.send_data(0, 1, bytes::Bytes::from(vec![0xAB; 4096])).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(peer_bitmap.weight(), 0, "peer applied the write and cleared out-of-sync");
    assert_eq!(tracker.len(), 0, "WriteAck flowed back and completed the request");

    cancel.cancel();
    let _ = tokio::join!(asender_task, receiver_task, peer_asender_task);
}

/// A barrier crossing the transfer log's 75%-full threshold is sent before
/// the triggering `Data` packet, and the receiving side's `BarrierAck`
/// reports the right number of completed writes.
#[tokio::test]
async fn barrier_epoch_reports_correct_completed_count() {
    let (data_a, data_b) = tokio::io::duplex(64 * 1024);

    let tl = Arc::new(TransferLog::new(4));
    let cancel = CancellationToken::new();
    let sender = Sender::new(data_a, tl.clone(), Duration::from_secs(2), cancel.clone());

    let device = Arc::new(Mutex::new(MemoryBlockDevice::new(8)));
    let bitmap = Arc::new(Bitmap::new(8));
    let (ack_tx, mut ack_rx) = mpsc::channel(16);
    let receiver = Receiver::new(device, bitmap, Protocol::A, ack_tx, cancel.clone());
    let receiver_task = tokio::spawn(async move {
        let _ = receiver.run(data_b).await;
    });

    for i in 0..3u64 {
        tl.append_write(i, i).unwrap();
        sender.send_data(i, i, bytes::Bytes::new()).await.unwrap();
    }
    assert!(tl.should_issue_barrier(), "3/4 crosses the 75% threshold");
    let bnr = tl.add_barrier().unwrap();
    sender.send_barrier(bnr).await.unwrap();

    let mut barrier_ack = None;
    for _ in 0..8 {
        if let Some(p) = ack_rx.recv().await {
            if let rdbd_protocol::Packet::BarrierAck { barrier_nr, set_size } = p {
                barrier_ack = Some((barrier_nr, set_size));
                break;
            }
        }
    }
    let (barrier_nr, set_size) = barrier_ack.expect("receiver must ack the barrier");
    assert_eq!(barrier_nr, bnr);
    assert_eq!(set_size, 3);

    cancel.cancel();
    let _ = receiver_task.await;
}
