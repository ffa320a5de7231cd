//! # Card Signatures
//!
//! secp256k1 ECDSA, the curve the cards sign with. Two uses:
//!
//! 1. **Identify challenges.** The card signs the 32-byte nonce directly as
//!    the message digest (no extra hashing), so a verifier needs exactly the
//!    nonce it issued. Anything else fails.
//! 2. **Certificate issuance.** A CA signs `SHA-256(permissions || key)`.
//!
//! Signatures travel as fixed-width `r || s` (64 bytes). Cards are free to
//! return either S form; verification normalizes to low-S first.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::config::NONCE_LENGTH;

/// Errors during signature operations.
///
/// Intentionally coarse: callers treat every variant as "not this card".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid signature bytes: expected 64-byte r||s")]
    InvalidSignatureBytes,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("challenge digest has the wrong length")]
    InvalidChallenge,
}

/// A fresh random identify challenge from the OS RNG.
pub fn fresh_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Uncompressed SEC1 encoding of a key's public half (65 bytes).
pub fn public_key_bytes(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_encoded_point(false).as_bytes().to_vec()
}

/// Signs a 32-byte digest as-is.
pub fn sign_digest(key: &SigningKey, digest: &[u8]) -> Result<Vec<u8>, SignatureError> {
    if digest.len() != NONCE_LENGTH {
        return Err(SignatureError::InvalidChallenge);
    }
    let signature: Signature = key
        .sign_prehash(digest)
        .map_err(|_| SignatureError::InvalidChallenge)?;
    Ok(signature.to_bytes().to_vec())
}

/// Verifies an `r || s` signature over a 32-byte digest.
pub fn verify_digest(
    public_key: &[u8],
    digest: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if digest.len() != NONCE_LENGTH {
        return Err(SignatureError::InvalidChallenge);
    }
    let key =
        VerifyingKey::from_sec1_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| SignatureError::InvalidSignatureBytes)?;
    let signature = signature.normalize_s().unwrap_or(signature);
    key.verify_prehash(digest, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// True when `bytes` is a SEC1 encoding of a secp256k1 point.
pub fn is_valid_public_key(bytes: &[u8]) -> bool {
    VerifyingKey::from_sec1_bytes(bytes).is_ok()
}

/// True when both byte strings encode the same point, regardless of
/// compressed or uncompressed form.
pub fn same_public_key(a: &[u8], b: &[u8]) -> bool {
    match (
        VerifyingKey::from_sec1_bytes(a),
        VerifyingKey::from_sec1_bytes(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
