//! Phonon transfer.
//!
//! The acknowledgment is a separate notification, not a response carrying
//! the outcome. A timeout therefore does not mean the peer rejected the
//! transfer: the peer card may have applied it and the ack been lost. There
//! is no transfer id or idempotent replay, so callers must reconcile a
//! timed-out transfer against the peer's card contents before retrying.

use tracing::{error, info, warn};

use super::connection::RemoteConnection;
use super::error::RemoteError;
use crate::wire::MessageKind;

impl RemoteConnection {
    /// Sends an opaque transfer packet to the paired peer and waits for its
    /// acknowledgment.
    pub async fn receive_phonons(&self, transfer: &[u8]) -> Result<(), RemoteError> {
        let _guard = self.locks.transfer.lock().await;

        let pairing = self.pairing_state();
        if !self.is_pair_finalized() {
            return Err(RemoteError::InvalidPairingState {
                state: pairing,
                action: "transfer phonons",
            });
        }

        match self
            .exchange(
                MessageKind::RequestReceivePhonon,
                transfer.to_vec(),
                MessageKind::MessagePhononAck,
                self.config.transfer_timeout(),
            )
            .await
        {
            Ok(_) => {
                info!(len = transfer.len(), "peer acknowledged phonon transfer");
                Ok(())
            }
            Err(e) => {
                if e.is_timeout() {
                    error!(
                        len = transfer.len(),
                        "no acknowledgment for phonon transfer; remote state unknown"
                    );
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn answer_receive_phonons(&self, transfer: Vec<u8>) {
        if !self.is_pair_finalized() {
            warn!("refusing phonons before pairing is finalized");
            self.reply_error("phonon transfer refused: pairing not finalized".to_string())
                .await;
            return;
        }

        match self.session.receive_phonons(&transfer).await {
            Ok(()) => {
                info!(len = transfer.len(), "accepted phonon transfer");
                self.reply(MessageKind::MessagePhononAck, Vec::new()).await;
            }
            Err(e) => {
                error!(error = %e, "local card rejected phonon transfer");
                self.reply_error(format!("receive phonons failed: {e}")).await;
            }
        }
    }
}
