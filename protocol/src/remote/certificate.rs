use tracing::{debug, error};

use super::connection::RemoteConnection;
use super::error::RemoteError;
use crate::session::CardCertificate;
use crate::wire::MessageKind;

impl RemoteConnection {
    /// The peer's certificate, fetched once and cached for the life of the
    /// connection. Concurrent callers share a single request.
    pub async fn get_certificate(&self) -> Result<CardCertificate, RemoteError> {
        if let Some(cert) = self.peer_certificate() {
            return Ok(cert);
        }

        let _guard = self.locks.certificate.lock().await;
        // Filled while we queued behind another caller.
        if let Some(cert) = self.peer_certificate() {
            return Ok(cert);
        }

        let payload = self
            .exchange(
                MessageKind::RequestCertificate,
                Vec::new(),
                MessageKind::ResponseCertificate,
                self.config.certificate_timeout(),
            )
            .await?;
        let cert = CardCertificate::parse(&payload)
            .map_err(|e| RemoteError::malformed(MessageKind::ResponseCertificate, e))?;

        let mut state = self.state.write();
        let cached = state.peer_certificate.get_or_insert(cert).clone();
        Ok(cached)
    }

    pub fn peer_certificate(&self) -> Option<CardCertificate> {
        self.state.read().peer_certificate.clone()
    }

    pub(crate) async fn answer_certificate(&self) {
        let cert = match self.session.get_certificate().await {
            Ok(cert) => cert,
            Err(e) => {
                error!(error = %e, "local card has no certificate to offer");
                self.reply_error(format!("certificate unavailable: {e}")).await;
                return;
            }
        };
        match cert.serialize() {
            Ok(bytes) => {
                debug!("sending local certificate");
                self.reply(MessageKind::ResponseCertificate, bytes).await;
            }
            Err(e) => error!(error = %e, "failed to encode local certificate"),
        }
    }
}
