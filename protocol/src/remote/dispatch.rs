//! Inbound dispatch.
//!
//! A single task per connection reads frames in order and routes each
//! envelope by kind. Responses fill pending exchanges; requests are answered
//! inline through the local session. Handlers run one at a time, so a peer's
//! requests are answered in the order they arrived.

use std::sync::Weak;

use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use super::connection::RemoteConnection;
use crate::session::CardCertificate;
use crate::wire::{read_frame, Envelope, MessageKind};

/// Reads until shutdown, end of stream, or a framing error.
///
/// Undecodable bodies are skipped: the length prefix keeps the reader
/// aligned. An oversized or truncated frame ends the loop since nothing
/// after it can be trusted.
pub(crate) async fn run<R>(
    conn: Weak<RemoteConnection>,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
    max_frame_len: usize,
) where
    R: AsyncRead + Unpin + Send,
{
    debug!("dispatch loop started");

    let reason = loop {
        if *shutdown.borrow() {
            break "shutdown requested";
        }

        let frame = tokio::select! {
            _ = shutdown.changed() => break "shutdown requested",
            frame = read_frame(&mut reader, max_frame_len) => frame,
        };

        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => break "relay closed the stream",
            Err(e) => {
                warn!(error = %e, "relay stream unusable");
                break "relay stream unusable";
            }
        };

        let envelope = match Envelope::decode(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = body.len(), "skipping undecodable envelope");
                continue;
            }
        };

        let Some(conn) = conn.upgrade() else {
            break "connection dropped";
        };
        conn.route(envelope).await;
    };

    if let Some(conn) = conn.upgrade() {
        conn.shut_down(reason);
    }
    debug!(reason, "dispatch loop stopped");
}

impl RemoteConnection {
    pub(crate) async fn route(&self, envelope: Envelope) {
        let Some(kind) = envelope.kind() else {
            warn!(tag = envelope.tag, "dropping envelope with unknown tag");
            return;
        };
        trace!(%kind, len = envelope.payload.len(), "received envelope");
        let payload = envelope.payload;

        match kind {
            MessageKind::RequestIdentify => self.answer_identify(payload).await,
            MessageKind::RequestCertificate => self.answer_certificate().await,
            MessageKind::RequestCardPair1 => self.answer_card_pair(payload).await,
            MessageKind::RequestFinalizeCardPair => self.answer_finalize_card_pair(payload).await,
            MessageKind::RequestReceivePhonon => self.answer_receive_phonons(payload).await,

            MessageKind::ResponseCertificate => self.accept_certificate(payload),
            MessageKind::ResponseIdentify
            | MessageKind::ResponseCardPair1
            | MessageKind::ResponseFinalizeCardPair
            | MessageKind::MessagePhononAck
            | MessageKind::MessageConnectedToCard => self.deliver(kind, payload),

            MessageKind::MessageIdentifiedWithServer => self.mark_identified_with_server(),
            MessageKind::MessageError => {
                error!(peer_error = %String::from_utf8_lossy(&payload), "peer reported an error");
            }
            MessageKind::RequestConnectCard2Card => {
                warn!("relay-bound request arrived at a card; dropping");
            }
        }
    }

    fn deliver(&self, kind: MessageKind, payload: Vec<u8>) {
        if !self.pending.deliver(kind, payload) {
            debug!(%kind, "no exchange waiting; dropping reply");
        }
    }

    /// Caches the first well-formed certificate the peer presents, whether
    /// or not it was asked for, then hands the raw payload to any waiter.
    fn accept_certificate(&self, payload: Vec<u8>) {
        match CardCertificate::parse(&payload) {
            Ok(cert) => {
                let mut state = self.state.write();
                if state.peer_certificate.is_none() {
                    debug!(permissions = cert.permissions, "cached peer certificate");
                    state.peer_certificate = Some(cert);
                }
            }
            Err(e) => warn!(error = %e, "peer sent a malformed certificate"),
        }
        self.deliver(MessageKind::ResponseCertificate, payload);
    }

    fn mark_identified_with_server(&self) {
        self.state.write().identified_with_server = true;
        self.server_identified.send_replace(true);
        debug!("relay identified this card");
    }
}
