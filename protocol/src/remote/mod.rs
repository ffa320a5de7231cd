//! # Remote Card Connection
//!
//! Drives one card's conversation with one peer card through an untrusted
//! relay. A connection is simultaneously a *requester* (methods such as
//! [`RemoteConnection::identify`] send a request and await the matching
//! reply) and a *responder* (a background dispatch task answers the peer's
//! requests by delegating to the local [`CardSession`]).
//!
//! ## Lifecycle
//!
//! ```text
//!   connect ──► relay sends identifiedWithServer
//!          ──► connect_to_card(peer id)           relay links the two cards
//!          ──► identify / get_certificate          per side, any order
//!          ──► card_pair ──► finalize_card_pair    one side initiates
//!          ──► receive_phonons …                   once finalized
//!          ──► close
//! ```
//!
//! Identify must succeed on a side before that side takes part in pairing,
//! in either role.
//!
//! ## Exchanges
//!
//! The wire carries no correlation ids. A reply is matched to its request
//! purely by kind, so at most one request of each class is outstanding per
//! connection; concurrent callers of the same operation queue on a
//! per-class lock. Every wait is bounded by the class timeout from
//! [`RemoteConfig`](crate::config::RemoteConfig).
//!
//! [`CardSession`]: crate::session::CardSession

mod card_link;
mod certificate;
mod connection;
mod correlator;
mod dispatch;
mod error;
mod identify;
mod pairing;
mod transfer;

pub use connection::{ConnectionState, RemoteConnection};
pub use error::RemoteError;
pub use pairing::{PairingEvent, PairingState};
