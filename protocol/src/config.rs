//! # Protocol Configuration & Constants
//!
//! Every constant the remote pairing protocol depends on lives here, next to
//! the [`RemoteConfig`] struct that lets callers override the ones that are
//! policy rather than wire format.
//!
//! Wire-format constants (frame limits, nonce length) must match on both
//! ends of a relay. Timeouts are local policy and may differ per side.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire Format
// ---------------------------------------------------------------------------

/// Length of the identify challenge nonce in bytes.
pub const NONCE_LENGTH: usize = 32;

/// Size of the big-endian length prefix in front of every frame.
pub const FRAME_HEADER_LENGTH: usize = 4;

/// Largest frame body we are willing to buffer. Phonon transfers are a few
/// hundred bytes per phonon; 1 MiB leaves room for large batches.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Uncompressed SEC1 secp256k1 public keys are 65 bytes, compressed are 33.
pub const MAX_PUBLIC_KEY_LENGTH: usize = 65;

/// ECDSA signatures travel as fixed-width `r || s`.
pub const SIGNATURE_LENGTH: usize = 64;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Uniform response window for every exchange unless overridden.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Same value as milliseconds, for the serde-facing config fields.
pub const DEFAULT_EXCHANGE_TIMEOUT_MS: u64 = 10_000;

/// How long `close` waits for the relay stream to accept its shutdown.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Port assumed for `tls://` relay URLs that omit one.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Port assumed for `tcp://` relay URLs that omit one.
pub const DEFAULT_TCP_PORT: u16 = 8080;

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Page size when walking an address's transaction history. A full page
/// means there may be more.
pub const TRANSACTION_PAGE_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Connection Configuration
// ---------------------------------------------------------------------------

/// Per-connection settings.
///
/// Timeouts are grouped by exchange class so identification, pairing and
/// transfer can be tuned independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Skip TLS certificate verification. Development relays only.
    pub ignore_tls: bool,
    /// Window for the identify challenge-response.
    pub identify_timeout_ms: u64,
    /// Window for a certificate fetch.
    pub certificate_timeout_ms: u64,
    /// Window for each of the two pairing phases.
    pub pairing_timeout_ms: u64,
    /// Window for a phonon transfer acknowledgment.
    pub transfer_timeout_ms: u64,
    /// Window for each of the two relay-level waits in `connect_to_card`.
    pub card_link_timeout_ms: u64,
    /// Largest inbound frame body accepted before the stream is abandoned.
    /// Capped at [`MAX_FRAME_LENGTH`], the most an envelope body can decode.
    pub max_frame_len: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ignore_tls: false,
            identify_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT_MS,
            certificate_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT_MS,
            pairing_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT_MS,
            transfer_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT_MS,
            card_link_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT_MS,
            max_frame_len: MAX_FRAME_LENGTH,
        }
    }
}

impl RemoteConfig {
    /// Sets every exchange timeout to the same value.
    pub fn with_uniform_timeout(mut self, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        self.identify_timeout_ms = ms;
        self.certificate_timeout_ms = ms;
        self.pairing_timeout_ms = ms;
        self.transfer_timeout_ms = ms;
        self.card_link_timeout_ms = ms;
        self
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn certificate_timeout(&self) -> Duration {
        Duration::from_millis(self.certificate_timeout_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn card_link_timeout(&self) -> Duration {
        Duration::from_millis(self.card_link_timeout_ms)
    }

    /// The inbound frame limit actually enforced.
    pub fn frame_limit(&self) -> usize {
        self.max_frame_len.min(MAX_FRAME_LENGTH)
    }
}
