//! # CLI Interface
//!
//! Command-line structure for `phonon-remote-cli`, built with `clap`
//! derive. Every connection flag can also come from the environment.

use clap::{Parser, Subcommand, ValueEnum};

/// Pair a software phonon card with a remote card through a relay.
#[derive(Parser, Debug)]
#[command(
    name = "phonon-remote-cli",
    about = "Remote phonon card pairing over an untrusted relay",
    version,
    propagate_version = true
)]
pub struct PhononRemoteCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect a fresh software card to a relay and pair it with a peer.
    Pair(PairArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `pair` subcommand.
#[derive(Parser, Debug)]
pub struct PairArgs {
    /// Relay URL, e.g. `tls://relay.example.com:443` or `tcp://127.0.0.1:8080`.
    #[arg(long, env = "PHONON_RELAY_URL")]
    pub relay: String,

    /// Id of the peer card to link with.
    #[arg(long, env = "PHONON_PEER_CARD")]
    pub peer_card: String,

    /// Drive pairing from this side. Without it the card waits to be paired.
    #[arg(long)]
    pub initiate: bool,

    /// Hex-encoded transfer packet to send once paired. Initiator only.
    #[arg(long, requires = "initiate")]
    pub send: Option<String>,

    /// Skip relay TLS certificate verification. Development relays only.
    #[arg(long, env = "PHONON_IGNORE_TLS")]
    pub ignore_tls: bool,

    /// Timeout for every exchange, in milliseconds.
    #[arg(long, env = "PHONON_TIMEOUT_MS", default_value_t = phonon_remote::config::DEFAULT_EXCHANGE_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Log output format.
    #[arg(long, value_enum, env = "PHONON_LOG_FORMAT", default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}
