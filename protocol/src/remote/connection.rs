use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::correlator::PendingExchanges;
use super::dispatch;
use super::error::RemoteError;
use super::pairing::PairingState;
use crate::config::{RemoteConfig, CLOSE_GRACE, NONCE_LENGTH};
use crate::session::{CardCertificate, CardSession, Counterparty};
use crate::transport::{self, RelayStream, RelayUrl};
use crate::wire::{write_envelope, Envelope, MessageKind, WireError};

/// Snapshot of what a connection knows about its peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// The relay has acknowledged this card.
    pub identified_with_server: bool,
    /// The peer answered our most recent identify challenge correctly.
    pub verified: bool,
    pub pairing: PairingState,
    pub closed: bool,
    /// The nonce of the most recent identify challenge we issued.
    pub challenge_nonce: Option<[u8; NONCE_LENGTH]>,
    /// First certificate the peer presented. Never replaced.
    pub peer_certificate: Option<CardCertificate>,
    /// Key that passed the most recent identify challenge.
    pub peer_public_key: Option<Vec<u8>>,
}

impl ConnectionState {
    pub fn pair_finalized(&self) -> bool {
        self.pairing == PairingState::Finalized
    }
}

/// Serializes requests of the same class so replies can be matched by kind.
#[derive(Default)]
pub(crate) struct ExchangeLocks {
    pub identify: AsyncMutex<()>,
    pub certificate: AsyncMutex<()>,
    pub pair: AsyncMutex<()>,
    pub finalize: AsyncMutex<()>,
    pub transfer: AsyncMutex<()>,
    pub card_link: AsyncMutex<()>,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One card's connection to one peer card through a relay.
///
/// Always held in an `Arc`: the dispatch task keeps a `Weak` to it, and the
/// finalized pairing hands the local session another.
pub struct RemoteConnection {
    pub(crate) session: Arc<dyn CardSession>,
    pub(crate) config: RemoteConfig,
    writer: AsyncMutex<BoxedWriter>,
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) pending: PendingExchanges,
    pub(crate) locks: ExchangeLocks,
    pub(crate) server_identified: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    self_ref: Weak<RemoteConnection>,
}

impl RemoteConnection {
    /// Dials the relay at `url` and starts the dispatch task.
    pub async fn connect(
        session: Arc<dyn CardSession>,
        url: &str,
        config: RemoteConfig,
    ) -> Result<Arc<Self>, RemoteError> {
        let relay = RelayUrl::parse(url)?;
        let stream = transport::connect(&relay, config.ignore_tls).await?;
        info!(relay = %relay.authority(), secure = relay.secure, "connected to relay");
        Ok(Self::from_stream(session, stream, config))
    }

    /// Runs the protocol over an already-open stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(session: Arc<dyn CardSession>, stream: S, config: RemoteConfig) -> Arc<Self>
    where
        S: RelayStream + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (server_identified, _) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let max_frame_len = config.frame_limit();

        let conn = Arc::new_cyclic(|self_ref| Self {
            session,
            config,
            writer: AsyncMutex::new(Box::new(writer)),
            state: RwLock::new(ConnectionState::default()),
            pending: PendingExchanges::new(),
            locks: ExchangeLocks::default(),
            server_identified,
            shutdown,
            self_ref: self_ref.clone(),
        });

        tokio::spawn(dispatch::run(
            Arc::downgrade(&conn),
            reader,
            shutdown_rx,
            max_frame_len,
        ));
        conn
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn is_verified(&self) -> bool {
        self.state.read().verified
    }

    pub fn is_pair_finalized(&self) -> bool {
        self.state.read().pair_finalized()
    }

    pub fn is_identified_with_server(&self) -> bool {
        self.state.read().identified_with_server
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    pub fn pairing_state(&self) -> PairingState {
        self.state.read().pairing
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub(crate) fn require_verified(&self) -> Result<(), RemoteError> {
        if self.is_verified() {
            Ok(())
        } else {
            Err(RemoteError::PeerNotVerified)
        }
    }

    /// Hands the local session a weak handle to this connection.
    pub(crate) fn bind_remote_card(&self) {
        let remote: Weak<dyn Counterparty> = self.self_ref.clone();
        self.session.set_remote_card(remote);
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Writes one envelope. Writes are serialized so frames never interleave.
    pub(crate) async fn send(&self, kind: MessageKind, payload: Vec<u8>) -> Result<(), RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::ConnectionClosed);
        }
        let envelope = Envelope::new(kind, payload);
        debug!(%kind, len = envelope.payload.len(), "sending envelope");

        let mut shutdown = self.shutdown_signal();
        let result = {
            let mut writer = self.writer.lock().await;
            // A write stalled on a full pipe is abandoned once the
            // connection closes, freeing the writer for `close`.
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|closed| *closed) => return Err(RemoteError::ConnectionClosed),
                result = write_envelope(&mut *writer, &envelope) => result,
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(WireError::Io(e)) => {
                warn!(%kind, error = %e, "relay write failed");
                self.shut_down("relay write failed");
                Err(RemoteError::ConnectionClosed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort answer to a peer request.
    pub(crate) async fn reply(&self, kind: MessageKind, payload: Vec<u8>) {
        if let Err(e) = self.send(kind, payload).await {
            warn!(%kind, error = %e, "failed to answer peer");
        }
    }

    /// Reports a failure to the peer as an error notification.
    pub(crate) async fn reply_error(&self, text: String) {
        self.reply(MessageKind::MessageError, text.into_bytes()).await;
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Closes the connection: stops the dispatch task, fails every pending
    /// exchange with [`RemoteError::ConnectionClosed`] and shuts the stream.
    /// Idempotent.
    pub async fn close(&self) {
        self.shut_down("closed locally");
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "relay stream already gone"),
            Err(_) => warn!("relay stream did not accept shutdown in time"),
        }
    }

    /// A watch that flips to `true` once the connection has closed.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn shut_down(&self, reason: &str) {
        let newly_closed = {
            let mut state = self.state.write();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            info!(reason, "remote connection closed");
        }
        self.shutdown.send_replace(true);
        self.pending.fail_all();
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl Counterparty for RemoteConnection {
    async fn identify(&self) -> Result<(), RemoteError> {
        RemoteConnection::identify(self).await
    }

    async fn get_certificate(&self) -> Result<CardCertificate, RemoteError> {
        RemoteConnection::get_certificate(self).await
    }

    async fn card_pair(&self, init_payload: &[u8]) -> Result<Vec<u8>, RemoteError> {
        RemoteConnection::card_pair(self, init_payload).await
    }

    async fn finalize_card_pair(&self, final_payload: &[u8]) -> Result<(), RemoteError> {
        RemoteConnection::finalize_card_pair(self, final_payload).await
    }

    async fn receive_phonons(&self, transfer: &[u8]) -> Result<(), RemoteError> {
        RemoteConnection::receive_phonons(self, transfer).await
    }
}
