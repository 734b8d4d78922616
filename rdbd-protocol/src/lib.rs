//! Replication protocol: wire framing, packet codec, and the
//! sender/receiver/asender trio that drive a device's data and meta
//! sockets (spec §4.6 component C6).
//!
//! This crate is transport-agnostic: every socket-facing function is
//! generic over `AsyncRead`/`AsyncWrite`, so production code drives a real
//! `TcpStream` split in two and tests drive an in-memory
//! `tokio::io::duplex` pipe, matching the way `rdbd-block-device`'s
//! `BlockDevice` trait lets `rdbd-core` stay disk-agnostic.

#![allow(async_fn_in_trait)]

pub mod asender;
pub mod error;
pub mod io;
pub mod packet;
pub mod receiver;
pub mod sender;

pub use asender::Asender;
pub use error::{ProtocolError, Result, MAX_PAYLOAD_LEN};
pub use io::{read_packet, write_packet, TimeoutPolicy};
pub use packet::{Command, Header, Packet, ReportParams, HEADER_LEN, PACKET_MAGIC};
pub use receiver::Receiver;
pub use sender::{SendStats, Sender};
