//! # Wire Envelope
//!
//! Every message between a client and the relay is an [`Envelope`]: a
//! numeric tag plus an opaque payload. Envelopes travel as length-prefixed
//! frames:
//!
//! ```text
//! ┌────────────────────┬───────────────────────────────────────────┐
//! │ len: u32 (BE)      │ body: bincode { tag: u16, payload: [u8] } │
//! └────────────────────┴───────────────────────────────────────────┘
//! ```
//!
//! The tag is carried as a raw integer rather than a serde enum so that a
//! body with a tag this build does not know still decodes; the dispatcher
//! decides what to do with it. The length prefix is what lets a reader skip
//! a body it cannot decode and stay aligned on the next frame.

use std::fmt;

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{FRAME_HEADER_LENGTH, MAX_FRAME_LENGTH};

/// Errors produced while framing or parsing envelopes.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Message Taxonomy
// ---------------------------------------------------------------------------

/// The fixed set of envelope kinds.
///
/// Requests are answered by the matching response; notifications are
/// pushed without a request (or, for acknowledgments and the relay's
/// card-link confirmation, in place of a response).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    RequestIdentify = 1,
    ResponseIdentify = 2,
    RequestCertificate = 3,
    ResponseCertificate = 4,
    RequestCardPair1 = 5,
    ResponseCardPair1 = 6,
    RequestFinalizeCardPair = 7,
    ResponseFinalizeCardPair = 8,
    RequestConnectCard2Card = 9,
    MessageConnectedToCard = 10,
    RequestReceivePhonon = 11,
    MessagePhononAck = 12,
    MessageError = 13,
    MessageIdentifiedWithServer = 14,
}

impl MessageKind {
    /// Every known kind, in tag order.
    pub const ALL: [MessageKind; 14] = [
        Self::RequestIdentify,
        Self::ResponseIdentify,
        Self::RequestCertificate,
        Self::ResponseCertificate,
        Self::RequestCardPair1,
        Self::ResponseCardPair1,
        Self::RequestFinalizeCardPair,
        Self::ResponseFinalizeCardPair,
        Self::RequestConnectCard2Card,
        Self::MessageConnectedToCard,
        Self::RequestReceivePhonon,
        Self::MessagePhononAck,
        Self::MessageError,
        Self::MessageIdentifiedWithServer,
    ];

    /// The numeric tag written on the wire.
    pub fn tag(self) -> u16 {
        self as u16
    }

    /// Maps a wire tag back to a kind. Unknown tags yield `None`.
    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Stable protocol name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::RequestIdentify => "requestIdentify",
            Self::ResponseIdentify => "responseIdentify",
            Self::RequestCertificate => "requestCertificate",
            Self::ResponseCertificate => "responseCertificate",
            Self::RequestCardPair1 => "requestCardPair1",
            Self::ResponseCardPair1 => "responseCardPair1",
            Self::RequestFinalizeCardPair => "requestFinalizeCardPair",
            Self::ResponseFinalizeCardPair => "responseFinalizeCardPair",
            Self::RequestConnectCard2Card => "requestConnectCard2Card",
            Self::MessageConnectedToCard => "messageConnectedToCard",
            Self::RequestReceivePhonon => "requestReceivePhonon",
            Self::MessagePhononAck => "messagePhononAck",
            Self::MessageError => "messageError",
            Self::MessageIdentifiedWithServer => "messageIdentifiedWithServer",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Raw message tag. See [`MessageKind::from_tag`].
    pub tag: u16,
    /// Opaque payload. Any inner structure is encoded independently.
    pub payload: Vec<u8>,
}

/// Fixed-width integers, no trailing garbage, bounded allocations.
fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .with_limit(MAX_FRAME_LENGTH as u64)
}

/// Encodes a structured payload with the same options as envelope bodies.
pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    body_options()
        .serialize(value)
        .map_err(|e| WireError::Malformed(e.to_string()))
}

/// Decodes a structured payload, rejecting trailing bytes.
pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    body_options()
        .deserialize(bytes)
        .map_err(|e| WireError::Malformed(e.to_string()))
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: kind.tag(),
            payload: payload.into(),
        }
    }

    /// The known kind of this envelope, or `None` for a foreign tag.
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_tag(self.tag)
    }

    /// Serializes the frame body (without the length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode_payload(self)
    }

    /// Parses a frame body.
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        decode_payload(body)
    }

    /// Serializes the complete frame, length prefix included.
    pub fn to_frame(&self) -> Result<Bytes, WireError> {
        let body = self.encode()?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LENGTH + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }
}

// ---------------------------------------------------------------------------
// Stream I/O
// ---------------------------------------------------------------------------

/// Reads one frame body from the stream.
///
/// Returns `Ok(None)` only when the stream ends cleanly on a frame
/// boundary; ending inside a header or body is an I/O error. A length above
/// `max_len` is an error too: the bytes that follow cannot be trusted to
/// realign, so the caller should abandon the stream.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LENGTH];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;
    let len = u32::from_be_bytes(header) as usize;

    if len > max_len {
        return Err(WireError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes one envelope as a frame and flushes.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = envelope.to_frame()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
