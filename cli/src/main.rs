// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Phonon Remote CLI
//!
//! Runs a software card against a relay:
//!
//! - `pair`: link with a peer card, verify it, and pair as initiator or
//!   responder, optionally sending one transfer
//! - `version`: print build version information

mod cli;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;

use phonon_remote::config::RemoteConfig;
use phonon_remote::remote::RemoteConnection;
use phonon_remote::session::CardSession;
use phonon_remote::soft_card::SoftCard;

use cli::{Commands, PairArgs, PhononRemoteCli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PhononRemoteCli::parse();

    match cli.command {
        Commands::Pair(args) => pair(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

async fn pair(args: PairArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);

    let transfer = args
        .send
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("--send must be hex")?;

    let config = RemoteConfig {
        ignore_tls: args.ignore_tls,
        ..RemoteConfig::default()
    }
    .with_uniform_timeout(Duration::from_millis(args.timeout_ms));

    let card = Arc::new(SoftCard::generate().context("failed to create software card")?);
    println!("Local card public key: {}", hex::encode(card.public_key()));

    let session: Arc<dyn CardSession> = card.clone();
    let conn = RemoteConnection::connect(session, &args.relay, config)
        .await
        .with_context(|| format!("failed to connect to relay {}", args.relay))?;

    let outcome = run_pairing(&conn, &card, &args, transfer.as_deref()).await;
    conn.close().await;
    outcome
}

async fn run_pairing(
    conn: &Arc<RemoteConnection>,
    card: &SoftCard,
    args: &PairArgs,
    transfer: Option<&[u8]>,
) -> Result<()> {
    conn.connect_to_card(&args.peer_card)
        .await
        .with_context(|| format!("relay could not link card {}", args.peer_card))?;

    // Certificate first so identify also checks the key against it.
    let cert = conn
        .get_certificate()
        .await
        .context("peer certificate unavailable")?;
    conn.identify().await.context("peer card failed identify")?;
    println!("Peer card verified: {}", hex::encode(&cert.public_key));

    if !args.initiate {
        tracing::info!("waiting to be paired; press Ctrl+C to stop");
        shutdown_signal().await;
        if !card.is_paired() {
            bail!("peer never completed pairing");
        }
        for (i, packet) in card.received().iter().enumerate() {
            println!("Received transfer {}: {}", i + 1, hex::encode(packet));
        }
        return Ok(());
    }

    card.pair_with(&**conn)
        .await
        .context("pairing failed")?;
    println!("Paired with {}", args.peer_card);

    if let Some(packet) = transfer {
        card.send_phonons(packet).await.context(
            "transfer not acknowledged; check the peer card before retrying",
        )?;
        println!("Transfer of {} bytes acknowledged", packet.len());
    }
    Ok(())
}

fn print_version() {
    println!("phonon-remote-cli {}", env!("CARGO_PKG_VERSION"));
    println!(
        "frame limit       {} bytes",
        phonon_remote::config::MAX_FRAME_LENGTH
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
