use tracing::{error, info};

use super::connection::RemoteConnection;
use super::error::RemoteError;
use crate::wire::MessageKind;

impl RemoteConnection {
    /// Asks the relay to link this card with `card_id`.
    ///
    /// Waits first for the relay to acknowledge this card, then for the
    /// link confirmation, each bounded by the card-link timeout. A missing
    /// confirmation closes the connection: the relay's view of it is
    /// unknown from then on. Closing the connection ends either wait with
    /// [`RemoteError::ConnectionClosed`].
    pub async fn connect_to_card(&self, card_id: &str) -> Result<(), RemoteError> {
        let _guard = self.locks.card_link.lock().await;
        let timeout = self.config.card_link_timeout();

        if self.is_closed() {
            return Err(RemoteError::ConnectionClosed);
        }

        if !self.is_identified_with_server() {
            let mut identified = self.server_identified.subscribe();
            let mut shutdown = self.shutdown_signal();
            let waited = tokio::time::timeout(timeout, async {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|closed| *closed) => false,
                    seen = identified.wait_for(|done| *done) => seen.is_ok(),
                }
            })
            .await;
            match waited {
                Ok(true) => {}
                Ok(false) => return Err(RemoteError::ConnectionClosed),
                Err(_) => {
                    return Err(RemoteError::Timeout {
                        awaiting: MessageKind::MessageIdentifiedWithServer,
                        after: timeout,
                    })
                }
            }
        }

        let result = self
            .exchange(
                MessageKind::RequestConnectCard2Card,
                card_id.as_bytes().to_vec(),
                MessageKind::MessageConnectedToCard,
                timeout,
            )
            .await;

        match result {
            Ok(_) => {
                info!(card_id, "relay linked peer card");
                Ok(())
            }
            Err(e) => {
                if e.is_timeout() {
                    error!(card_id, "relay never linked peer card; closing connection");
                    self.close().await;
                }
                Err(e)
            }
        }
    }
}
