//! Mesh node binary.
//!
//! Runs two nodes joined by an in-process advertising bearer: the first sends
//! access messages to the second, both exchange secure beacons and fire
//! their network-layer timers.
//!
//! # Usage
//!
//! ```bash
//! # Fresh random NetKey, state kept in memory
//! meshnet-node --messages 10
//!
//! # Fixed NetKey, state kept across restarts
//! meshnet-node --net-key 7dd7364cd842ad18c17c2b820c84c3d6 --data-dir ./state
//! ```

use std::{collections::VecDeque, path::PathBuf, time::Duration};

use clap::Parser;
use meshnet_core::{Environment, MemoryStorage, NetConfig, Storage};
use meshnet_node::{
    Node, NodeConfig, NodeError, Outbound, RedbStorage, SystemEnv, log_delivered, parse_key,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Mesh network-layer node
#[derive(Parser, Debug)]
#[command(name = "meshnet-node")]
#[command(about = "Mesh network-layer node with a loopback bearer")]
#[command(version)]
struct Args {
    /// Primary NetKey as 32 hex digits (random if omitted)
    #[arg(long)]
    net_key: Option<String>,

    /// Unicast address of the sending node
    #[arg(long, default_value_t = 0x0001)]
    address: u16,

    /// Unicast address of the receiving node
    #[arg(long, default_value_t = 0x0002)]
    peer: u16,

    /// IV Index at provisioning
    #[arg(long, default_value_t = 0)]
    iv_index: u32,

    /// Directory for durable state (memory only if omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of messages to send before exiting
    #[arg(long, default_value_t = 5)]
    messages: u32,

    /// Interval between messages in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Interval between secure beacons in seconds
    #[arg(long, default_value_t = 10)]
    beacon_interval_secs: u64,

    /// Default TTL for outgoing messages
    #[arg(long, default_value_t = 7)]
    default_ttl: u8,

    /// Retransmit PDUs addressed to other nodes
    #[arg(long)]
    relay: bool,

    /// Replay protection list capacity
    #[arg(long, default_value_t = 64)]
    replay_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self, addr: u16, net_key: [u8; 16]) -> NodeConfig {
        NodeConfig {
            net: NetConfig {
                default_ttl: self.default_ttl,
                replay_capacity: self.replay_capacity,
                relay: self.relay,
                ..NetConfig::new(addr)
            },
            net_key,
            iv_index: self.iv_index,
            app_idx: 0,
        }
    }
}

/// Both ends of the loopback bearer.
struct Loopback<S: Storage> {
    sender: Node<SystemEnv, S>,
    receiver: Node<SystemEnv, S>,
}

impl<S: Storage> Loopback<S> {
    /// Deliver frames until neither node has anything left to send.
    fn pump(&self, from_sender: bool, frames: Vec<Outbound>) {
        let mut queue: VecDeque<(bool, Outbound)> =
            frames.into_iter().map(|frame| (from_sender, frame)).collect();

        while let Some((from_sender, frame)) = queue.pop_front() {
            let to = if from_sender { &self.receiver } else { &self.sender };
            let replies = match frame {
                Outbound::Network(pdu) => match to.receive(&pdu, -40) {
                    Ok(Some(delivered)) => {
                        log_delivered(&delivered);
                        delivered.relay
                    },
                    Ok(None) => Vec::new(),
                    Err(err) => {
                        tracing::error!(%err, "Message withheld");
                        Vec::new()
                    },
                },
                Outbound::Beacon(bytes) => to.receive_beacon(&bytes).unwrap_or_else(|err| {
                    tracing::debug!(%err, "Beacon rejected");
                    Vec::new()
                }),
            };
            queue.extend(replies.into_iter().map(|frame| (!from_sender, frame)));
        }
    }

    fn beacons(&self) -> Result<(), NodeError> {
        self.pump(true, vec![self.sender.beacon()?]);
        self.pump(false, vec![self.receiver.beacon()?]);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let env = SystemEnv::new();
    let net_key = match &args.net_key {
        Some(hex_key) => parse_key(hex_key)?,
        None => {
            tracing::warn!("No NetKey given - generated a random one");
            env.random_key()
        },
    };

    if let Some(dir) = &args.data_dir {
        std::fs::create_dir_all(dir)?;
        let open = |addr: u16| RedbStorage::open(dir.join(format!("node-{addr:04x}.redb")));
        run(&args, env, net_key, open(args.address)?, open(args.peer)?).await?;
    } else {
        run(&args, env, net_key, MemoryStorage::new(), MemoryStorage::new()).await?;
    }

    Ok(())
}

async fn run<S: Storage>(
    args: &Args,
    env: SystemEnv,
    net_key: [u8; 16],
    sender_storage: S,
    receiver_storage: S,
) -> Result<(), NodeError> {
    let bearer = Loopback {
        sender: Node::open(env.clone(), sender_storage, args.node_config(args.address, net_key))?,
        receiver: Node::open(env, receiver_storage, args.node_config(args.peer, net_key))?,
    };
    tracing::info!(sender = args.address, receiver = args.peer, "Loopback bearer up");

    let mut send_timer = tokio::time::interval(Duration::from_millis(args.interval_ms));
    let mut beacon_timer = tokio::time::interval(Duration::from_secs(args.beacon_interval_secs));
    let mut sent = 0u32;

    loop {
        tokio::select! {
            _ = send_timer.tick() => {
                if sent == args.messages {
                    break;
                }
                let frames = bearer.sender.send(args.peer, format!("msg {sent}").as_bytes())?;
                bearer.pump(true, frames);
                sent += 1;
            },
            _ = beacon_timer.tick() => bearer.beacons()?,
            () = bearer.sender.sleep_until_due(Duration::from_secs(1)) => {
                let due = bearer.sender.tick();
                bearer.pump(true, due);
                let due = bearer.receiver.tick();
                bearer.pump(false, due);
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            },
        }
    }

    tracing::info!(sent, seq = bearer.sender.net().seq(), "Done");
    Ok(())
}
