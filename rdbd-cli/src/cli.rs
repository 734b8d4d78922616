//! Replicated block device control-surface CLI.
//!
//! Maps the in-process control surface on [`rdbd_replicator::Replicator`]
//! (`attach`, `detach`, `connect`, `disconnect`, `set_role`, `get_state`,
//! `invalidate`) onto subcommands, the way `fatrs-cli`'s `Cli`/`Command`
//! maps filesystem operations onto a `clap` derive tree. This is not a
//! production control plane (there is no resident daemon or netlink-style
//! IPC); each invocation attaches a backing device, drives the surface, and
//! exits.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use rdbd_block_device::{MemoryBlockDevice, SECTOR_SIZE};
use rdbd_core::bitmap::BM_BLOCK_SIZE;
use rdbd_core::{ReplicationConfig, Role};
use rdbd_replicator::Replicator;

const SECTORS_PER_BLOCK: u64 = BM_BLOCK_SIZE / SECTOR_SIZE as u64;

/// Command-line control surface for the replication data plane.
#[derive(Parser, Debug)]
#[command(author, version, about = "Control surface for a replicated block device")]
pub struct Cli {
    /// Path to a TOML file overriding the default `ReplicationConfig`.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Role argument, mirrored onto [`rdbd_core::Role`] (`Unknown` is
/// unreachable from the CLI: a device is always brought up as one or the
/// other).
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum RoleArg {
    Primary,
    Secondary,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Primary => Role::Primary,
            RoleArg::Secondary => Role::Secondary,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the control surface end-to-end against two in-memory devices
    /// connected over a loopback pipe, printing each step's resulting
    /// state. Useful to see `attach`/`connect`/`set-role`/`invalidate`
    /// wired together without needing a second process or real network.
    Demo {
        /// Capacity of each demo device, in 512-byte sectors.
        #[arg(long, default_value_t = 4096)]
        capacity_sectors: u64,
    },

    /// Attach an in-memory demo device, optionally connect to a peer over
    /// TCP, and drive it interactively from stdin (`write <block> <text>`,
    /// `status`, `invalidate`, `disconnect`, `quit`).
    Serve {
        /// Capacity of the demo device, in 512-byte sectors.
        #[arg(long, default_value_t = 4096)]
        capacity_sectors: u64,

        /// Role to start in.
        #[arg(long, value_enum, default_value_t = RoleArg::Secondary)]
        role: RoleArg,

        /// Listen for the peer's data-socket connection on this address
        /// (server side of the pairing).
        #[arg(long)]
        listen_data: Option<SocketAddr>,
        /// Listen for the peer's meta-socket connection on this address.
        #[arg(long)]
        listen_meta: Option<SocketAddr>,

        /// Dial the peer's data socket at this address (client side of the
        /// pairing). Mutually exclusive with `--listen-data`.
        #[arg(long)]
        peer_data: Option<SocketAddr>,
        /// Dial the peer's meta socket at this address.
        #[arg(long)]
        peer_meta: Option<SocketAddr>,
    },
}

/// Load a [`ReplicationConfig`] from `path` if given, falling back to
/// documented defaults (spec §2 ambient "Configuration" expansion).
fn load_config(path: Option<&PathBuf>) -> Result<ReplicationConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => ReplicationConfig::default(),
    };
    config.validate().context("invalid replication config")?;
    Ok(config)
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Demo { capacity_sectors } => cmd_demo(capacity_sectors, config).await,
        Command::Serve { capacity_sectors, role, listen_data, listen_meta, peer_data, peer_meta } => {
            cmd_serve(capacity_sectors, role.into(), listen_data, listen_meta, peer_data, peer_meta, config).await
        }
    }
}

fn print_state(label: &str, replicator: &Replicator<MemoryBlockDevice>) {
    let state = replicator.device_state();
    println!(
        "{label}: role={:?} cstate={:?} dstate={:?} out_of_sync={} blocks",
        state.role,
        state.cstate,
        state.dstate,
        replicator.out_of_sync_weight()
    );
}

async fn cmd_demo(capacity_sectors: u64, config: ReplicationConfig) -> Result<()> {
    let primary = Replicator::new(MemoryBlockDevice::new(capacity_sectors), capacity_sectors, config);
    let secondary = Replicator::new(MemoryBlockDevice::new(capacity_sectors), capacity_sectors, config);

    primary.attach().await.context("primary attach")?;
    secondary.attach().await.context("secondary attach")?;
    primary.set_role(Role::Primary);
    secondary.set_role(Role::Secondary);
    print_state("primary (attached)", &primary);
    print_state("secondary (attached)", &secondary);

    let (data_a, data_b) = tokio::io::duplex(1 << 16);
    let (meta_a, meta_b) = tokio::io::duplex(1 << 16);
    let (ra, rb) = tokio::join!(primary.connect(data_a, meta_a), secondary.connect(data_b, meta_b));
    ra.context("primary connect")?;
    rb.context("secondary connect")?;
    print_state("primary (connected)", &primary);
    print_state("secondary (connected)", &secondary);

    let block = (primary.al_reserved_sectors() + SECTORS_PER_BLOCK - 1) / SECTORS_PER_BLOCK;
    let sector = block * SECTORS_PER_BLOCK;
    let mut payload = vec![0u8; BM_BLOCK_SIZE as usize];
    payload[..b"hello from the demo".len()].copy_from_slice(b"hello from the demo");
    primary.write(sector, bytes::Bytes::from(payload)).await.context("demo write")?;
    primary.flush().await.context("demo flush")?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    print_state("primary (after write+flush)", &primary);
    print_state("secondary (after replication)", &secondary);

    primary.disconnect().await.context("primary disconnect")?;
    secondary.disconnect().await.context("secondary disconnect")?;
    primary.detach().await.context("primary detach")?;
    secondary.detach().await.context("secondary detach")?;
    print_state("primary (final)", &primary);
    print_state("secondary (final)", &secondary);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_serve(
    capacity_sectors: u64,
    role: Role,
    listen_data: Option<SocketAddr>,
    listen_meta: Option<SocketAddr>,
    peer_data: Option<SocketAddr>,
    peer_meta: Option<SocketAddr>,
    config: ReplicationConfig,
) -> Result<()> {
    let replicator = Replicator::new(MemoryBlockDevice::new(capacity_sectors), capacity_sectors, config);
    replicator.attach().await.context("attach")?;
    replicator.set_role(role);
    print_state("attached", &replicator);

    match (listen_data, listen_meta, peer_data, peer_meta) {
        (Some(ld), Some(lm), None, None) => {
            let data = accept_one(ld).await.context("accepting peer data socket")?;
            let meta = accept_one(lm).await.context("accepting peer meta socket")?;
            replicator.connect(data, meta).await.context("connect")?;
            print_state("connected (listener)", &replicator);
        }
        (None, None, Some(pd), Some(pm)) => {
            let data = TcpStream::connect(pd).await.with_context(|| format!("dialing peer data socket {pd}"))?;
            let meta = TcpStream::connect(pm).await.with_context(|| format!("dialing peer meta socket {pm}"))?;
            replicator.connect(data, meta).await.context("connect")?;
            print_state("connected (dialer)", &replicator);
        }
        (None, None, None, None) => {
            println!("no peer addresses given; running standalone");
        }
        _ => anyhow::bail!("pass either --listen-data/--listen-meta or --peer-data/--peer-meta, not both"),
    }

    repl(&replicator).await
}

async fn accept_one(addr: SocketAddr) -> Result<TcpStream> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    let (stream, _) = listener.accept().await.with_context(|| format!("accepting on {addr}"))?;
    Ok(stream)
}

/// Line-oriented stdin session: `write <block> <text>`, `status`,
/// `invalidate`, `disconnect`, `quit`.
async fn repl(replicator: &Replicator<MemoryBlockDevice>) -> Result<()> {
    println!("commands: write <block> <text> | status | invalidate | disconnect | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or("") {
            "write" => {
                let Some(block) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
                    println!("usage: write <block> <text>");
                    continue;
                };
                let text = parts.next().unwrap_or("").as_bytes();
                let mut payload = vec![0u8; BM_BLOCK_SIZE as usize];
                let n = text.len().min(payload.len());
                payload[..n].copy_from_slice(&text[..n]);
                let sector = replicator.al_reserved_sectors() + block * SECTORS_PER_BLOCK;
                match replicator.write(sector, bytes::Bytes::from(payload)).await {
                    Ok(()) => println!("wrote block {block} (sector {sector})"),
                    Err(e) => println!("write failed: {e}"),
                }
            }
            "status" => print_state("status", replicator),
            "invalidate" => {
                replicator.invalidate();
                println!("invalidated");
            }
            "disconnect" => match replicator.disconnect().await {
                Ok(()) => println!("disconnected"),
                Err(e) => println!("disconnect failed: {e}"),
            },
            "quit" | "exit" => break,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }
    Ok(())
}
