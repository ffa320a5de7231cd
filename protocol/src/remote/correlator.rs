//! Pending-exchange slots.
//!
//! One slot per response kind. The dispatch task fills a slot when the
//! matching envelope arrives; the requester waits on it with a deadline.
//! Once the connection closes every waiter is released and no new slot can
//! be opened.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::connection::RemoteConnection;
use super::error::RemoteError;
use crate::wire::MessageKind;

#[derive(Default)]
struct Slots {
    closed: bool,
    waiting: HashMap<MessageKind, oneshot::Sender<Vec<u8>>>,
}

#[derive(Default)]
pub(crate) struct PendingExchanges {
    inner: Mutex<Slots>,
}

impl PendingExchanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the slot for `kind`.
    pub fn register(&self, kind: MessageKind) -> Result<oneshot::Receiver<Vec<u8>>, RemoteError> {
        let mut slots = self.inner.lock();
        if slots.closed {
            return Err(RemoteError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        if slots.waiting.insert(kind, tx).is_some() {
            // Callers hold the class lock, so this only happens if a
            // previous waiter was dropped without cancelling.
            warn!(%kind, "replaced a stale pending exchange");
        }
        Ok(rx)
    }

    /// Fills the slot for `kind`. Returns false if nobody was waiting.
    pub fn deliver(&self, kind: MessageKind, payload: Vec<u8>) -> bool {
        let sender = self.inner.lock().waiting.remove(&kind);
        match sender {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, kind: MessageKind) {
        self.inner.lock().waiting.remove(&kind);
    }

    /// Releases every waiter with a closed-channel error and refuses new
    /// registrations.
    pub fn fail_all(&self) {
        let mut slots = self.inner.lock();
        slots.closed = true;
        slots.waiting.clear();
    }

    pub fn is_waiting(&self, kind: MessageKind) -> bool {
        self.inner.lock().waiting.contains_key(&kind)
    }
}

impl RemoteConnection {
    /// Sends `request` and waits up to `timeout` for `response`.
    ///
    /// On timeout the slot is cancelled and no connection state changes; a
    /// late reply is then dropped by the dispatcher.
    pub(crate) async fn exchange(
        &self,
        request: MessageKind,
        payload: Vec<u8>,
        response: MessageKind,
        timeout: Duration,
    ) -> Result<Vec<u8>, RemoteError> {
        let rx = self.pending.register(response)?;
        if let Err(e) = self.send(request, payload).await {
            self.pending.cancel(response);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(RemoteError::ConnectionClosed),
            Err(_) => {
                self.pending.cancel(response);
                debug!(%request, awaiting = %response, ?timeout, "exchange timed out");
                Err(RemoteError::Timeout {
                    awaiting: response,
                    after: timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_fills_the_matching_slot() {
        let pending = PendingExchanges::new();
        let rx = pending.register(MessageKind::ResponseCardPair1).unwrap();
        assert!(pending.is_waiting(MessageKind::ResponseCardPair1));

        assert!(!pending.deliver(MessageKind::MessagePhononAck, vec![1]));
        assert!(pending.deliver(MessageKind::ResponseCardPair1, vec![2]));
        assert_eq!(rx.await.unwrap(), vec![2]);
        assert!(!pending.is_waiting(MessageKind::ResponseCardPair1));
    }

    #[tokio::test]
    async fn unsolicited_delivery_is_dropped() {
        let pending = PendingExchanges::new();
        assert!(!pending.deliver(MessageKind::ResponseIdentify, vec![]));
    }

    #[tokio::test]
    async fn fail_all_releases_waiters_and_blocks_new_ones() {
        let pending = PendingExchanges::new();
        let rx = pending.register(MessageKind::MessagePhononAck).unwrap();
        pending.fail_all();

        assert!(rx.await.is_err());
        assert!(matches!(
            pending.register(MessageKind::ResponseIdentify),
            Err(RemoteError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn cancelled_slot_ignores_late_reply() {
        let pending = PendingExchanges::new();
        let _rx = pending.register(MessageKind::ResponseCertificate).unwrap();
        pending.cancel(MessageKind::ResponseCertificate);
        assert!(!pending.deliver(MessageKind::ResponseCertificate, vec![9]));
    }
}
