//! Entry point for `udp-mux`.
//!
//! Parses CLI arguments and starts either the **client** or the **proxy**
//! reactor.  All protocol work is delegated to library modules; `main.rs`
//! owns only process setup (logging, signal handling, argument parsing).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use udp_mux::{Config, Reactor};

/// Multiplex TCP connections over a single UDP flow.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    debug: bool,

    /// Interval between retransmissions of close-handshake messages.
    #[arg(long, global = true, default_value_t = 500)]
    retransmit_ms: u64,

    /// Longest the event loop sleeps when nothing is scheduled.
    #[arg(long, global = true, default_value_t = 60_000)]
    wait_ceiling_ms: u64,

    /// Timeout for the proxy's outbound TCP connects.
    #[arg(long, global = true, default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Go-Back-N window, in segments.
    #[arg(long, global = true, default_value_t = 32)]
    window: usize,

    /// Largest application chunk per DATA datagram, in bytes.
    #[arg(long, global = true, default_value_t = 1200)]
    max_segment: usize,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept local TCP connections and tunnel them to a proxy.
    Client {
        /// UDP address of the proxy (e.g. 203.0.113.7:9000).
        #[arg(short, long)]
        remote: SocketAddr,

        /// Local TCP port to accept connections on.
        #[arg(short, long)]
        listen: u16,

        /// Local UDP address to send from.
        #[arg(long, default_value = "0.0.0.0:0")]
        udp_bind: SocketAddr,

        /// Destination for connections that were not redirected by iptables.
        #[arg(short, long)]
        destination: Option<SocketAddr>,
    },
    /// Receive tunnelled connections and dial their destinations.
    Proxy {
        /// UDP port to listen on.
        #[arg(short, long)]
        port: u16,

        /// Address to bind the UDP port on.
        #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,
    },
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = match self.mode {
            Mode::Client {
                remote,
                listen,
                udp_bind,
                destination,
            } => {
                let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen));
                let config = Config::client(remote, listen).with_udp_bind(udp_bind);
                match destination {
                    Some(dest) => config.with_destination(dest),
                    None => config,
                }
            }
            Mode::Proxy { port, bind } => Config::proxy(SocketAddr::new(bind, port)),
        };
        config.timers.retransmit_interval = Duration::from_millis(self.retransmit_ms);
        config.timers.wait_ceiling = Duration::from_millis(self.wait_ceiling_ms);
        config.timers.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config.coder.window = self.window;
        config.coder.max_segment = self.max_segment;
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; --debug only changes the default.
    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = cli.into_config();
    config.validate().context("invalid configuration")?;

    let mut reactor = Reactor::bind(&config)
        .await
        .with_context(|| format!("cannot start {}", config.role()))?;

    tokio::select! {
        () = reactor.run() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("cannot listen for ctrl-c")?;
            log::info!("shutting down");
        }
    }
    Ok(())
}
