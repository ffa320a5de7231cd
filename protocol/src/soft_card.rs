//! # Software Card
//!
//! An in-memory [`CardSession`] backed by a secp256k1 key. Stands in for a
//! hardware card in tests, demos and the CLI.
//!
//! ## Pairing
//!
//! Payloads are plain public keys, with a transcript digest as proof:
//!
//! ```text
//! initiator                                   responder
//!   card_pair(pubkey_I)          ───────►     records pubkey_I, answers pubkey_R
//!   final = SHA-256(I || R)      ───────►     checks final against its own transcript
//! ```
//!
//! The initiator drives the flow with [`SoftCard::pair_with`]. This is a
//! stand-in, not the card applet's key agreement.
//!
//! ## Receiving
//!
//! Without a validator any transfer from the paired peer lands in the inbox
//! as opaque bytes. With one (see [`SoftCard::with_validator`]) a transfer
//! must decode as a [`PhononClaim`] batch and every claim must be backed.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{MAX_PUBLIC_KEY_LENGTH, NONCE_LENGTH};
use crate::crypto;
use crate::remote::RemoteError;
use crate::session::{
    CardCertificate, CardSession, Counterparty, IdentifyResponse, SessionError,
};
use crate::validator::{PhononClaim, PhononValidator};

/// Permission bits on certificates issued by [`SoftCard::generate`].
pub const SOFT_CARD_PERMISSIONS: u8 = 0x03;

#[derive(Debug, Default)]
enum Pairing {
    #[default]
    Idle,
    /// Answered phase one for this initiator key.
    Answered { initiator: Vec<u8> },
    Paired { peer: Vec<u8> },
}

pub struct SoftCard {
    key: SigningKey,
    certificate: Option<CardCertificate>,
    pairing: Mutex<Pairing>,
    inbox: Mutex<Vec<Vec<u8>>>,
    remote: Mutex<Option<Weak<dyn Counterparty>>>,
    validator: Option<Arc<dyn PhononValidator>>,
}

impl SoftCard {
    /// A card with a fresh key and a certificate issued by `ca`.
    pub fn issued_by(ca: &SigningKey) -> Result<Self, SessionError> {
        let key = SigningKey::random(&mut OsRng);
        let certificate =
            CardCertificate::issue(ca, SOFT_CARD_PERMISSIONS, crypto::public_key_bytes(&key))?;
        Ok(Self::with_parts(key, Some(certificate)))
    }

    /// A card with a fresh key and a self-signed certificate.
    pub fn generate() -> Result<Self, SessionError> {
        let key = SigningKey::random(&mut OsRng);
        let certificate =
            CardCertificate::issue(&key, SOFT_CARD_PERMISSIONS, crypto::public_key_bytes(&key))?;
        Ok(Self::with_parts(key, Some(certificate)))
    }

    /// Builds a card from an existing key and optional certificate.
    pub fn with_parts(key: SigningKey, certificate: Option<CardCertificate>) -> Self {
        Self {
            key,
            certificate,
            pairing: Mutex::new(Pairing::Idle),
            inbox: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            validator: None,
        }
    }

    /// Only accept transfers whose phonons `validator` finds backed.
    pub fn with_validator(mut self, validator: Arc<dyn PhononValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn public_key(&self) -> Vec<u8> {
        crypto::public_key_bytes(&self.key)
    }

    pub fn is_paired(&self) -> bool {
        matches!(*self.pairing.lock(), Pairing::Paired { .. })
    }

    /// The key this card is paired with, if any.
    pub fn paired_peer(&self) -> Option<Vec<u8>> {
        match &*self.pairing.lock() {
            Pairing::Paired { peer } => Some(peer.clone()),
            _ => None,
        }
    }

    /// Transfers received so far, oldest first.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.inbox.lock().clone()
    }

    /// The connection bound at pairing, while it is still alive.
    pub fn remote_card(&self) -> Option<Arc<dyn Counterparty>> {
        self.remote.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Runs the initiator side of pairing against `remote`.
    pub async fn pair_with(&self, remote: &dyn Counterparty) -> Result<(), RemoteError> {
        let own = self.public_key();
        let answer = remote.card_pair(&own).await?;
        check_key(&answer).map_err(RemoteError::Session)?;

        let proof = transcript(&own, &answer);
        remote.finalize_card_pair(&proof).await?;

        *self.pairing.lock() = Pairing::Paired { peer: answer };
        debug!("soft card paired as initiator");
        Ok(())
    }

    /// Checks every claim in `transfer`. The first unbacked one refuses the
    /// whole batch.
    async fn check_backing(
        validator: &dyn PhononValidator,
        transfer: &[u8],
    ) -> Result<(), SessionError> {
        let claims = PhononClaim::decode_batch(transfer)
            .map_err(|e| SessionError::Rejected(format!("unreadable phonon batch: {e}")))?;
        if claims.is_empty() {
            return Err(SessionError::Rejected("transfer carries no phonons".into()));
        }
        for claim in &claims {
            if !validator.validate(&claim.public_key, claim.value).await? {
                warn!(key = %claim.short_key(), value = claim.value, "unbacked phonon refused");
                return Err(SessionError::Rejected(format!(
                    "phonon {} is not backed for {}",
                    claim.short_key(),
                    claim.value
                )));
            }
        }
        debug!(phonons = claims.len(), "transfer validated");
        Ok(())
    }

    /// Sends phonons through the remote card bound at pairing.
    pub async fn send_phonons(&self, transfer: &[u8]) -> Result<(), RemoteError> {
        let remote = self
            .remote_card()
            .ok_or(RemoteError::Session(SessionError::NotPaired))?;
        remote.receive_phonons(transfer).await
    }
}

fn transcript(initiator: &[u8], responder: &[u8]) -> [u8; NONCE_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(initiator);
    hasher.update(responder);
    hasher.finalize().into()
}

fn check_key(bytes: &[u8]) -> Result<(), SessionError> {
    if bytes.is_empty() || bytes.len() > MAX_PUBLIC_KEY_LENGTH {
        return Err(SessionError::Rejected(format!(
            "pairing key of {} bytes",
            bytes.len()
        )));
    }
    if !crypto::is_valid_public_key(bytes) {
        return Err(SessionError::Rejected("pairing key is not a curve point".into()));
    }
    Ok(())
}

#[async_trait]
impl CardSession for SoftCard {
    async fn get_certificate(&self) -> Result<CardCertificate, SessionError> {
        self.certificate.clone().ok_or(SessionError::NoCertificate)
    }

    async fn identify_card(&self, nonce: &[u8]) -> Result<IdentifyResponse, SessionError> {
        Ok(IdentifyResponse::sign(&self.key, nonce)?)
    }

    async fn card_pair(&self, peer_payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        check_key(peer_payload)?;
        let mut pairing = self.pairing.lock();
        if matches!(*pairing, Pairing::Paired { .. }) {
            return Err(SessionError::Rejected("card is already paired".into()));
        }
        *pairing = Pairing::Answered {
            initiator: peer_payload.to_vec(),
        };
        Ok(self.public_key())
    }

    async fn finalize_card_pair(&self, peer_payload: &[u8]) -> Result<(), SessionError> {
        let mut pairing = self.pairing.lock();
        let Pairing::Answered { initiator } = &*pairing else {
            return Err(SessionError::Rejected("no pairing in progress".into()));
        };
        if peer_payload != transcript(initiator, &self.public_key()).as_slice() {
            return Err(SessionError::Rejected("pairing transcript mismatch".into()));
        }
        let peer = initiator.clone();
        *pairing = Pairing::Paired { peer };
        debug!("soft card paired as responder");
        Ok(())
    }

    async fn receive_phonons(&self, transfer: &[u8]) -> Result<(), SessionError> {
        if !self.is_paired() {
            return Err(SessionError::NotPaired);
        }
        if let Some(validator) = &self.validator {
            Self::check_backing(validator.as_ref(), transfer).await?;
        }
        self.inbox.lock().push(transfer.to_vec());
        Ok(())
    }

    fn set_remote_card(&self, remote: Weak<dyn Counterparty>) {
        *self.remote.lock() = Some(remote);
    }
}
