//! Minimal sender/receiver demo wiring two [`Transport`] handles through an
//! in-process loopback channel instead of real multicast sockets. Raw
//! socket creation, multicast group join, and router-alert option setting
//! are the `net_iface` collaborator the data model marks as an external
//! boundary, not something this crate owns — so the demo's `DatagramSender`
//! just shuttles bytes over a channel and this binary exercises the rest of
//! the ambient stack (CLI parsing, TOML config loading, structured logging)
//! around it.
//!
//! Run with `cargo run --example loopback_demo -- --payload "hi"`.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver, Sender as ChannelSender};
use tracing_subscriber::EnvFilter;

use pgm_transport::clock::Clock;
use pgm_transport::config::TransportConfig;
use pgm_transport::io::{DatagramSender, PacketIo};
use pgm_transport::wire::Nla;
use pgm_transport::Transport;

#[derive(Parser, Debug)]
#[command(name = "pgm-loopback-demo", about = "Send one message through a loopback PGM transport pair")]
struct Cli {
    /// Optional TOML file overriding `TransportConfig` defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Payload to send from the sender side to the receiver side.
    #[arg(long, default_value = "hello pgm")]
    payload: String,
}

/// Hands every outbound datagram to an in-process channel. Stands in for
/// the real socket the `net_iface` boundary would own.
struct LoopbackSender {
    tx: ChannelSender<Bytes>,
}

impl DatagramSender for LoopbackSender {
    fn send_plain(&mut self, data: &[u8]) -> std::io::Result<bool> {
        let _ = self.tx.send(Bytes::copy_from_slice(data));
        Ok(true)
    }

    fn send_router_alert(&mut self, data: &[u8]) -> std::io::Result<bool> {
        self.send_plain(data)
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<TransportConfig> {
    match path {
        None => Ok(TransportConfig::default()),
        Some(p) => {
            let text = fs::read_to_string(&p)
                .with_context(|| format!("reading config {}", p.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", p.display()))
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config)?;

    let clock = Clock::new();
    let now = clock.now();

    let gsi = [1, 2, 3, 4, 5, 6];
    let dport = 7000;
    let nla = Nla::V4([127, 0, 0, 1]);
    let grp_nla = Nla::V4([239, 0, 0, 1]);

    let (to_receiver_tx, to_receiver_rx): (ChannelSender<Bytes>, Receiver<Bytes>) = unbounded();
    let (sink_tx, _sink_rx) = unbounded();

    let mut sender_transport = Transport::create(cfg.clone(), gsi, dport, 1000, nla, grp_nla, grp_nla, now);
    sender_transport.bind(PacketIo::new(LoopbackSender { tx: to_receiver_tx }, cfg.rate_bytes_per_sec))?;

    let mut receiver_transport = Transport::create(cfg.clone(), gsi, dport, 1000, nla, grp_nla, grp_nla, now);
    receiver_transport.bind(PacketIo::new(LoopbackSender { tx: sink_tx }, 0))?;

    tracing::info!(payload = %cli.payload, "sending");
    sender_transport.send(Bytes::from(cli.payload.clone().into_bytes()))?;

    // The ODATA for this send lands on the channel synchronously; drain
    // whatever is there (plus any ambient SPM the scheduler thread
    // happened to fire) into the receiver side.
    while let Ok(pkt) = to_receiver_rx.try_recv() {
        receiver_transport.on_receive(pkt, nla, true, clock.now());
    }

    match receiver_transport.recv() {
        Some(bytes) => println!("received: {}", String::from_utf8_lossy(&bytes)),
        None => println!("nothing delivered yet"),
    }

    sender_transport.destroy(false);
    receiver_transport.destroy(false);
    Ok(())
}
