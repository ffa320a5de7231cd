//! Identify challenge.
//!
//! The requester sends a fresh 32-byte nonce; the peer's card signs it and
//! returns its key with the signature. `verified` ends up true only if that
//! signature checks out for exactly the nonce we sent and, when a peer
//! certificate is already cached, the key matches the certified one.

use tracing::{error, info, warn};

use super::connection::RemoteConnection;
use super::error::RemoteError;
use crate::crypto;
use crate::session::IdentifyResponse;
use crate::wire::MessageKind;

impl RemoteConnection {
    /// Challenges the peer card. A timeout leaves `verified` as it was; any
    /// answer that fails to verify clears it.
    pub async fn identify(&self) -> Result<(), RemoteError> {
        let _guard = self.locks.identify.lock().await;

        let nonce = crypto::fresh_nonce();
        let prior_nonce = self.state.write().challenge_nonce.replace(nonce);

        let payload = match self
            .exchange(
                MessageKind::RequestIdentify,
                nonce.to_vec(),
                MessageKind::ResponseIdentify,
                self.config.identify_timeout(),
            )
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                if e.is_timeout() {
                    self.state.write().challenge_nonce = prior_nonce;
                }
                return Err(e);
            }
        };

        let checked = IdentifyResponse::decode(&payload)
            .map_err(|e| RemoteError::malformed(MessageKind::ResponseIdentify, e))
            .and_then(|response| {
                self.check_identity(&nonce, &response)?;
                Ok(response)
            });

        let mut state = self.state.write();
        match checked {
            Ok(response) => {
                let fingerprint = hex::encode(&response.public_key[..response.public_key.len().min(8)]);
                state.verified = true;
                state.peer_public_key = Some(response.public_key);
                drop(state);
                info!(peer_key = %fingerprint, "peer card identity verified");
                Ok(())
            }
            Err(e) => {
                state.verified = false;
                state.peer_public_key = None;
                drop(state);
                warn!(error = %e, "peer card failed identify");
                Err(e)
            }
        }
    }

    fn check_identity(
        &self,
        nonce: &[u8],
        response: &IdentifyResponse,
    ) -> Result<(), RemoteError> {
        response
            .verify(nonce)
            .map_err(|_| RemoteError::VerificationFailed)?;

        let state = self.state.read();
        if let Some(cert) = state.peer_certificate.as_ref() {
            if !crypto::same_public_key(&cert.public_key, &response.public_key) {
                warn!("identify key does not match the peer certificate");
                return Err(RemoteError::VerificationFailed);
            }
        }
        Ok(())
    }

    /// Answers the peer's challenge with the local card's signature.
    pub(crate) async fn answer_identify(&self, nonce: Vec<u8>) {
        let response = match self.session.identify_card(&nonce).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "local card could not answer identify");
                self.reply_error(format!("identify failed: {e}")).await;
                return;
            }
        };
        match response.encode() {
            Ok(bytes) => self.reply(MessageKind::ResponseIdentify, bytes).await,
            Err(e) => error!(error = %e, "failed to encode identify response"),
        }
    }
}
