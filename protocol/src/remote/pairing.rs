//! Two-phase card pairing.
//!
//! ```text
//!              SendPair1                SendFinalize             FinalizeAcknowledged
//!   Unpaired ─────────────► Pair1Sent ──────────────► FinalizeSent ───────────────────► Finalized
//!      │                        ▲                                                          ▲
//!      │ AnswerPair1            │ (failure reverts)                                        │
//!      └──────────────► Pair1Answered ─────────────────────────────────────────────────────┘
//!                                                PeerFinalized
//! ```
//!
//! Either side may initiate. The responder reaches `Finalized` when it
//! accepts the initiator's finalize request. `Finalized` is terminal; repeat
//! finalize requests are acknowledged without involving the card again.

use tracing::{error, info, warn};

use super::connection::RemoteConnection;
use super::error::RemoteError;
use crate::wire::MessageKind;

/// Pairing progress on one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PairingState {
    #[default]
    Unpaired,
    /// We sent phase one as initiator.
    Pair1Sent,
    /// We answered the peer's phase one as responder.
    Pair1Answered,
    /// Our finalize request is in flight.
    FinalizeSent,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingEvent {
    SendPair1,
    AnswerPair1,
    SendFinalize,
    FinalizeAcknowledged,
    PeerFinalized,
}

impl PairingEvent {
    fn action(self) -> &'static str {
        match self {
            Self::SendPair1 => "send pairing phase one",
            Self::AnswerPair1 => "answer pairing phase one",
            Self::SendFinalize => "send finalize",
            Self::FinalizeAcknowledged => "accept finalize acknowledgment",
            Self::PeerFinalized => "accept peer finalize",
        }
    }
}

impl PairingState {
    /// The state after `event`, or `None` if the event is not allowed here.
    pub fn on(self, event: PairingEvent) -> Option<PairingState> {
        use PairingEvent::*;
        use PairingState::*;

        match (self, event) {
            (Finalized, SendFinalize | FinalizeAcknowledged | PeerFinalized) => Some(Finalized),
            (Finalized, _) => None,
            (FinalizeSent, SendPair1 | AnswerPair1 | SendFinalize) => None,
            (_, SendPair1) => Some(Pair1Sent),
            (_, AnswerPair1) => Some(Pair1Answered),
            (Pair1Sent | Pair1Answered, SendFinalize) => Some(FinalizeSent),
            (FinalizeSent, FinalizeAcknowledged) => Some(Finalized),
            (Pair1Sent | Pair1Answered | FinalizeSent, PeerFinalized) => Some(Finalized),
            _ => None,
        }
    }
}

impl RemoteConnection {
    /// Applies `event` to the pairing state, returning the prior state.
    fn advance(&self, event: PairingEvent) -> Result<PairingState, RemoteError> {
        let mut state = self.state.write();
        let prior = state.pairing;
        match prior.on(event) {
            Some(next) => {
                state.pairing = next;
                Ok(prior)
            }
            None => Err(RemoteError::InvalidPairingState {
                state: prior,
                action: event.action(),
            }),
        }
    }

    /// Undoes a transition unless something else moved the state since.
    fn revert(&self, from: PairingState, to: PairingState) {
        let mut state = self.state.write();
        if state.pairing == from {
            state.pairing = to;
        }
    }

    fn peer_finalize_allowed(&self) -> Result<(), RemoteError> {
        let state = self.pairing_state();
        match state.on(PairingEvent::PeerFinalized) {
            Some(_) => Ok(()),
            None => Err(RemoteError::InvalidPairingState {
                state,
                action: PairingEvent::PeerFinalized.action(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Initiator
    // -----------------------------------------------------------------------

    /// Phase one: sends the local card's opening payload and returns the
    /// peer card's answer. Requires a verified peer.
    pub async fn card_pair(&self, init_payload: &[u8]) -> Result<Vec<u8>, RemoteError> {
        let _guard = self.locks.pair.lock().await;
        self.require_verified()?;
        let prior = self.advance(PairingEvent::SendPair1)?;

        let result = self
            .exchange(
                MessageKind::RequestCardPair1,
                init_payload.to_vec(),
                MessageKind::ResponseCardPair1,
                self.config.pairing_timeout(),
            )
            .await;
        if result.is_err() {
            self.revert(PairingState::Pair1Sent, prior);
        }
        result
    }

    /// Phase two. An empty response payload is success; any other payload
    /// is the peer's failure text.
    ///
    /// If this side already finalized as responder, the request is still
    /// sent for the peer's benefit but the reply is not awaited.
    pub async fn finalize_card_pair(&self, final_payload: &[u8]) -> Result<(), RemoteError> {
        let _guard = self.locks.finalize.lock().await;
        self.require_verified()?;

        if self.is_pair_finalized() {
            self.send(MessageKind::RequestFinalizeCardPair, final_payload.to_vec())
                .await?;
            return Ok(());
        }

        let prior = self.advance(PairingEvent::SendFinalize)?;
        let result = self
            .exchange(
                MessageKind::RequestFinalizeCardPair,
                final_payload.to_vec(),
                MessageKind::ResponseFinalizeCardPair,
                self.config.pairing_timeout(),
            )
            .await;

        match result {
            Ok(payload) if payload.is_empty() => {
                self.advance(PairingEvent::FinalizeAcknowledged)?;
                self.bind_remote_card();
                info!(role = "initiator", "card pairing finalized");
                Ok(())
            }
            Ok(payload) => {
                self.revert(PairingState::FinalizeSent, prior);
                let reason = String::from_utf8_lossy(&payload).into_owned();
                warn!(%reason, "peer refused to finalize pairing");
                Err(RemoteError::PeerRejected(reason))
            }
            Err(e) => {
                self.revert(PairingState::FinalizeSent, prior);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Responder
    // -----------------------------------------------------------------------

    pub(crate) async fn answer_card_pair(&self, peer_payload: Vec<u8>) {
        if let Err(e) = self.require_verified() {
            warn!("refusing pairing from an unverified peer");
            self.reply_error(format!("card pairing refused: {e}")).await;
            return;
        }
        let prior = match self.advance(PairingEvent::AnswerPair1) {
            Ok(prior) => prior,
            Err(e) => {
                warn!(error = %e, "refusing pairing");
                self.reply_error(format!("card pairing refused: {e}")).await;
                return;
            }
        };

        match self.session.card_pair(&peer_payload).await {
            Ok(answer) => self.reply(MessageKind::ResponseCardPair1, answer).await,
            Err(e) => {
                self.revert(PairingState::Pair1Answered, prior);
                error!(error = %e, "local card failed pairing phase one");
                self.reply_error(format!("card pairing failed: {e}")).await;
            }
        }
    }

    /// Failures travel back in the response payload itself so the initiator
    /// sees them without waiting out its timeout.
    pub(crate) async fn answer_finalize_card_pair(&self, peer_payload: Vec<u8>) {
        if self.is_pair_finalized() {
            self.reply(MessageKind::ResponseFinalizeCardPair, Vec::new())
                .await;
            return;
        }

        let refusal = self
            .require_verified()
            .and_then(|_| self.peer_finalize_allowed());
        if let Err(e) = refusal {
            warn!(error = %e, "refusing to finalize pairing");
            self.reply(
                MessageKind::ResponseFinalizeCardPair,
                format!("finalize refused: {e}").into_bytes(),
            )
            .await;
            return;
        }

        match self.session.finalize_card_pair(&peer_payload).await {
            Ok(()) => {
                // Recorded before replying so the initiator never observes
                // success ahead of this side.
                if let Err(e) = self.advance(PairingEvent::PeerFinalized) {
                    warn!(error = %e, "pairing state moved during finalize");
                }
                self.bind_remote_card();
                info!(role = "responder", "card pairing finalized");
                self.reply(MessageKind::ResponseFinalizeCardPair, Vec::new())
                    .await;
            }
            Err(e) => {
                error!(error = %e, "local card failed to finalize pairing");
                self.reply(
                    MessageKind::ResponseFinalizeCardPair,
                    format!("finalize failed: {e}").into_bytes(),
                )
                .await;
            }
        }
    }
}
