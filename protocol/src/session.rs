//! # Card Sessions
//!
//! The seam between the remote protocol and whatever holds the local card.
//!
//! A [`CardSession`] is the local side: the remote connection calls into it
//! when the peer asks this card to identify itself, hand over its
//! certificate, take part in pairing or accept phonons. A [`Counterparty`]
//! is the other direction: a handle through which the local side drives the
//! remote card. `RemoteConnection` implements it, and once pairing is
//! finalized the connection hands the session a weak [`Counterparty`]
//! reference to itself.
//!
//! The connection owns its session through an `Arc`. The session only ever
//! gets a `Weak` back-reference via [`CardSession::set_remote_card`], so the
//! pair never keeps itself alive.

use std::sync::Weak;

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{MAX_PUBLIC_KEY_LENGTH, NONCE_LENGTH, SIGNATURE_LENGTH};
use crate::crypto::{self, SignatureError};
use crate::remote::RemoteError;
use crate::validator::ValidatorError;
use crate::wire::{decode_payload, encode_payload, WireError};

/// Failures reported by the local card.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("card has no certificate")]
    NoCertificate,

    #[error("card is not paired")]
    NotPaired,

    #[error("card rejected the request: {0}")]
    Rejected(String),

    #[error("card signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("payload encoding: {0}")]
    Encoding(#[from] WireError),

    #[error("phonon validation: {0}")]
    Validation(#[from] ValidatorError),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The local card, as seen by a remote connection.
///
/// Pairing payloads are opaque here: the card produces and consumes them,
/// the connection only carries them.
#[async_trait]
pub trait CardSession: Send + Sync {
    /// The card's CA-issued certificate.
    async fn get_certificate(&self) -> Result<CardCertificate, SessionError>;

    /// Signs the peer's identify nonce with the card's identity key.
    async fn identify_card(&self, nonce: &[u8]) -> Result<IdentifyResponse, SessionError>;

    /// Responder side of pairing phase one. Takes the initiator's payload and
    /// returns this card's answer.
    async fn card_pair(&self, peer_payload: &[u8]) -> Result<Vec<u8>, SessionError>;

    /// Responder side of pairing phase two.
    async fn finalize_card_pair(&self, peer_payload: &[u8]) -> Result<(), SessionError>;

    /// Accepts an opaque phonon transfer packet from the paired peer.
    async fn receive_phonons(&self, transfer: &[u8]) -> Result<(), SessionError>;

    /// Called once pairing is finalized with the connection that did it.
    fn set_remote_card(&self, remote: Weak<dyn Counterparty>);
}

/// A remote card reachable through some transport.
#[async_trait]
pub trait Counterparty: Send + Sync {
    /// Challenges the remote card to prove its identity key.
    async fn identify(&self) -> Result<(), RemoteError>;

    /// Fetches (or returns the cached) remote certificate.
    async fn get_certificate(&self) -> Result<CardCertificate, RemoteError>;

    /// Initiator side of pairing phase one.
    async fn card_pair(&self, init_payload: &[u8]) -> Result<Vec<u8>, RemoteError>;

    /// Initiator side of pairing phase two.
    async fn finalize_card_pair(&self, final_payload: &[u8]) -> Result<(), RemoteError>;

    /// Delivers a phonon transfer packet to the remote card.
    async fn receive_phonons(&self, transfer: &[u8]) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// Certificate
// ---------------------------------------------------------------------------

/// A card certificate: the card's identity key plus a CA signature over it.
///
/// The remote core caches whatever the peer presents and compares its key
/// against the identify response. Chain validation against a CA key is
/// available through [`CardCertificate::verify_issuer`] but is left to
/// callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardCertificate {
    /// Card permission bits, as issued.
    pub permissions: u8,
    /// SEC1-encoded card identity key.
    pub public_key: Vec<u8>,
    /// CA signature over [`CardCertificate::signed_digest`].
    pub ca_signature: Vec<u8>,
}

impl CardCertificate {
    /// Issues a certificate for `public_key` signed by `ca`.
    pub fn issue(
        ca: &SigningKey,
        permissions: u8,
        public_key: Vec<u8>,
    ) -> Result<Self, SignatureError> {
        let digest = Self::digest(permissions, &public_key);
        let ca_signature = crypto::sign_digest(ca, &digest)?;
        Ok(Self {
            permissions,
            public_key,
            ca_signature,
        })
    }

    /// The 32-byte digest the CA signs.
    pub fn signed_digest(&self) -> [u8; NONCE_LENGTH] {
        Self::digest(self.permissions, &self.public_key)
    }

    fn digest(permissions: u8, public_key: &[u8]) -> [u8; NONCE_LENGTH] {
        let mut hasher = Sha256::new();
        hasher.update([permissions]);
        hasher.update(public_key);
        hasher.finalize().into()
    }

    /// Checks the CA signature against a known CA key.
    pub fn verify_issuer(&self, ca_public_key: &[u8]) -> Result<(), SignatureError> {
        crypto::verify_digest(ca_public_key, &self.signed_digest(), &self.ca_signature)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        encode_payload(self)
    }

    /// Parses a certificate payload. Only structure is checked here.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let cert: Self = decode_payload(bytes)?;
        if cert.public_key.is_empty() || cert.public_key.len() > MAX_PUBLIC_KEY_LENGTH {
            return Err(WireError::Malformed(format!(
                "certificate public key of {} bytes",
                cert.public_key.len()
            )));
        }
        Ok(cert)
    }
}

// ---------------------------------------------------------------------------
// Identify
// ---------------------------------------------------------------------------

/// A card's answer to an identify challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    /// SEC1-encoded identity key.
    pub public_key: Vec<u8>,
    /// `r || s` over the challenge nonce.
    pub signature: Vec<u8>,
}

impl IdentifyResponse {
    /// Answers a challenge with `key`.
    pub fn sign(key: &SigningKey, nonce: &[u8]) -> Result<Self, SignatureError> {
        Ok(Self {
            public_key: crypto::public_key_bytes(key),
            signature: crypto::sign_digest(key, nonce)?,
        })
    }

    /// Succeeds only if the signature is valid for exactly `nonce` under the
    /// embedded key.
    pub fn verify(&self, nonce: &[u8]) -> Result<(), SignatureError> {
        crypto::verify_digest(&self.public_key, nonce, &self.signature)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let response: Self = decode_payload(bytes)?;
        if response.signature.len() != SIGNATURE_LENGTH {
            return Err(WireError::Malformed(format!(
                "identify signature of {} bytes",
                response.signature.len()
            )));
        }
        if response.public_key.len() > MAX_PUBLIC_KEY_LENGTH {
            return Err(WireError::Malformed(format!(
                "identify public key of {} bytes",
                response.public_key.len()
            )));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn certificate_issuer_check() {
        let ca = SigningKey::random(&mut OsRng);
        let card = SigningKey::random(&mut OsRng);
        let cert = CardCertificate::issue(&ca, 0x03, crypto::public_key_bytes(&card)).unwrap();

        assert!(cert.verify_issuer(&crypto::public_key_bytes(&ca)).is_ok());
        assert!(cert.verify_issuer(&crypto::public_key_bytes(&card)).is_err());

        let mut forged = cert.clone();
        forged.permissions = 0xFF;
        assert!(forged.verify_issuer(&crypto::public_key_bytes(&ca)).is_err());
    }

    #[test]
    fn certificate_parse_checks_key_length() {
        let cert = CardCertificate {
            permissions: 0,
            public_key: vec![],
            ca_signature: vec![1; 64],
        };
        let bytes = cert.serialize().unwrap();
        assert!(CardCertificate::parse(&bytes).is_err());
        assert!(CardCertificate::parse(b"\x01\x02").is_err());
    }

    #[test]
    fn identify_response_verifies_only_its_nonce() {
        let card = SigningKey::random(&mut OsRng);
        let nonce = crypto::fresh_nonce();
        let response = IdentifyResponse::sign(&card, &nonce).unwrap();

        let decoded = IdentifyResponse::decode(&response.encode().unwrap()).unwrap();
        assert!(decoded.verify(&nonce).is_ok());

        let mut other = nonce;
        other[31] ^= 0x01;
        assert!(decoded.verify(&other).is_err());
    }

    #[test]
    fn identify_decode_rejects_short_signature() {
        let response = IdentifyResponse {
            public_key: vec![4; 65],
            signature: vec![0; 63],
        };
        assert!(IdentifyResponse::decode(&response.encode().unwrap()).is_err());
    }
}
