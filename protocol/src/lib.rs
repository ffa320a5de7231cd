// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Phonon Remote: Card Pairing over an Untrusted Relay
//!
//! Two cards in different places establish mutual trust and move phonons
//! (card-held value objects) through a relay that only routes messages.
//! The relay can drop or delay traffic, but it cannot forge a card's
//! identity: every side challenges its peer with a fresh nonce and checks
//! the card's signature itself.
//!
//! ## Architecture
//!
//! - **wire**: envelope framing and the message taxonomy.
//! - **transport**: relay URLs and the TCP/TLS stream.
//! - **crypto**: secp256k1 challenge signatures.
//! - **session**: the local card boundary (`CardSession`) and the remote
//!   card handle (`Counterparty`), plus certificate and identify payloads.
//! - **remote**: the connection: dispatch loop, exchange correlation,
//!   identify, certificate, pairing, transfer and relay card linking.
//! - **validator**: checks that a received phonon is backed on its ledger.
//! - **soft_card**: a software `CardSession` for tests and tooling.
//! - **config**: protocol constants and `RemoteConfig`.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use phonon_remote::{config::RemoteConfig, remote::RemoteConnection, soft_card::SoftCard};
//!
//! let card = Arc::new(SoftCard::generate()?);
//! let conn = RemoteConnection::connect(card.clone(), "tls://relay.example.com", RemoteConfig::default()).await?;
//! conn.connect_to_card("peer-card-id").await?;
//! conn.identify().await?;
//! card.pair_with(&*conn).await?;
//! card.send_phonons(b"serialized transfer").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod remote;
pub mod session;
pub mod soft_card;
pub mod transport;
pub mod validator;
pub mod wire;
