use std::time::Duration;

use thiserror::Error;

use super::pairing::PairingState;
use crate::session::SessionError;
use crate::transport::TransportError;
use crate::wire::{MessageKind, WireError};

/// Errors surfaced by remote connection operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("timed out after {}ms waiting for {awaiting}", .after.as_millis())]
    Timeout {
        awaiting: MessageKind,
        after: Duration,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("peer rejected the request: {0}")]
    PeerRejected(String),

    #[error("peer failed identity verification")]
    VerificationFailed,

    #[error("malformed {kind} payload: {reason}")]
    MalformedResponse { kind: MessageKind, reason: String },

    #[error("peer identity has not been verified")]
    PeerNotVerified,

    #[error("cannot {action} while pairing is {state:?}")]
    InvalidPairingState {
        state: PairingState,
        action: &'static str,
    },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("local card: {0}")]
    Session(#[from] SessionError),
}

impl RemoteError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn malformed(kind: MessageKind, err: impl std::fmt::Display) -> Self {
        Self::MalformedResponse {
            kind,
            reason: err.to_string(),
        }
    }
}
