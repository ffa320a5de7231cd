//! Shared harness: an in-process relay over duplex pipes, and a raw peer
//! that speaks envelopes directly for scripted misbehaviour.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use k256::ecdsa::{Signature, SigningKey};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use phonon_remote::config::{RemoteConfig, MAX_FRAME_LENGTH};
use phonon_remote::remote::RemoteConnection;
use phonon_remote::session::{CardSession, IdentifyResponse};
use phonon_remote::soft_card::SoftCard;
use phonon_remote::wire::{read_frame, write_envelope, Envelope, MessageKind};

const PIPE_CAPACITY: usize = 64 * 1024;

type SharedWriter = Arc<AsyncMutex<WriteHalf<DuplexStream>>>;

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Routes envelopes between two cards the way the real relay does: it
/// announces `identifiedWithServer`, answers `connectCard2Card` itself and
/// forwards everything else. Kinds can be dropped on demand.
#[derive(Clone, Default)]
pub struct Relay {
    dropped: Arc<Mutex<HashSet<MessageKind>>>,
    seen: Arc<Mutex<HashMap<MessageKind, usize>>>,
}

impl Relay {
    fn start(a: DuplexStream, b: DuplexStream) -> Self {
        let relay = Relay::default();
        let (a_read, a_write) = split(a);
        let (b_read, b_write) = split(b);
        let a_write: SharedWriter = Arc::new(AsyncMutex::new(a_write));
        let b_write: SharedWriter = Arc::new(AsyncMutex::new(b_write));

        tokio::spawn(relay.clone().forward(a_read, a_write.clone(), b_write.clone()));
        tokio::spawn(relay.clone().forward(b_read, b_write, a_write));
        relay
    }

    async fn forward(self, mut from: ReadHalf<DuplexStream>, back: SharedWriter, to: SharedWriter) {
        let hello = Envelope::new(MessageKind::MessageIdentifiedWithServer, Vec::new());
        if write_envelope(&mut *back.lock().await, &hello).await.is_err() {
            return;
        }

        while let Ok(Some(body)) = read_frame(&mut from, MAX_FRAME_LENGTH).await {
            let Ok(envelope) = Envelope::decode(&body) else {
                continue;
            };
            if let Some(kind) = envelope.kind() {
                *self.seen.lock().entry(kind).or_default() += 1;
                if kind == MessageKind::RequestConnectCard2Card {
                    let linked = Envelope::new(MessageKind::MessageConnectedToCard, Vec::new());
                    let _ = write_envelope(&mut *back.lock().await, &linked).await;
                    continue;
                }
                if self.dropped.lock().contains(&kind) {
                    continue;
                }
            }
            if write_envelope(&mut *to.lock().await, &envelope).await.is_err() {
                break;
            }
        }
    }

    pub fn drop_kind(&self, kind: MessageKind) {
        self.dropped.lock().insert(kind);
    }

    pub fn allow_kind(&self, kind: MessageKind) {
        self.dropped.lock().remove(&kind);
    }

    /// How many envelopes of `kind` the relay has received from either card.
    pub fn seen(&self, kind: MessageKind) -> usize {
        self.seen.lock().get(&kind).copied().unwrap_or(0)
    }
}

/// Two cards connected through a [`Relay`].
pub struct Linked {
    pub a: Arc<RemoteConnection>,
    pub b: Arc<RemoteConnection>,
    pub card_a: Arc<SoftCard>,
    pub card_b: Arc<SoftCard>,
    pub relay: Relay,
}

pub fn card() -> Arc<SoftCard> {
    Arc::new(SoftCard::generate().unwrap())
}

pub fn link(config: RemoteConfig) -> Linked {
    link_cards(card(), card(), config)
}

pub fn link_cards(card_a: Arc<SoftCard>, card_b: Arc<SoftCard>, config: RemoteConfig) -> Linked {
    let (a_client, a_relay) = tokio::io::duplex(PIPE_CAPACITY);
    let (b_client, b_relay) = tokio::io::duplex(PIPE_CAPACITY);
    let relay = Relay::start(a_relay, b_relay);

    let session_a: Arc<dyn CardSession> = card_a.clone();
    let session_b: Arc<dyn CardSession> = card_b.clone();
    Linked {
        a: RemoteConnection::from_stream(session_a, a_client, config.clone()),
        b: RemoteConnection::from_stream(session_b, b_client, config),
        card_a,
        card_b,
        relay,
    }
}

/// Linked through the relay and mutually identified.
pub async fn verified(config: RemoteConfig) -> Linked {
    verified_cards(card(), card(), config).await
}

pub async fn verified_cards(
    card_a: Arc<SoftCard>,
    card_b: Arc<SoftCard>,
    config: RemoteConfig,
) -> Linked {
    let net = link_cards(card_a, card_b, config);
    net.a.connect_to_card("card-b").await.unwrap();
    net.b.connect_to_card("card-a").await.unwrap();
    net.a.identify().await.unwrap();
    net.b.identify().await.unwrap();
    net
}

/// Verified, with card A having paired as initiator.
pub async fn paired(config: RemoteConfig) -> Linked {
    paired_cards(card(), card(), config).await
}

pub async fn paired_cards(
    card_a: Arc<SoftCard>,
    card_b: Arc<SoftCard>,
    config: RemoteConfig,
) -> Linked {
    let net = verified_cards(card_a, card_b, config).await;
    net.card_a.pair_with(&*net.a).await.unwrap();
    net
}

/// The finalize proof a soft card expects from an initiator.
pub fn transcript(initiator: &[u8], responder: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(initiator);
    hasher.update(responder);
    hasher.finalize().to_vec()
}

/// True if `card` holds a back-reference to exactly `conn`.
pub fn bound_to(card: &SoftCard, conn: &Arc<RemoteConnection>) -> bool {
    card.remote_card()
        .map(|remote| Arc::as_ptr(&remote) as *const () == Arc::as_ptr(conn) as *const ())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Raw peer
// ---------------------------------------------------------------------------

/// The far end of a single connection, driven envelope by envelope.
pub struct RawPeer {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    pub key: SigningKey,
}

pub fn raw(config: RemoteConfig) -> (Arc<RemoteConnection>, Arc<SoftCard>, RawPeer) {
    raw_with_capacity(config, PIPE_CAPACITY)
}

/// Like [`raw`], with a pipe that holds only `capacity` unread bytes in
/// each direction.
pub fn raw_with_capacity(
    config: RemoteConfig,
    capacity: usize,
) -> (Arc<RemoteConnection>, Arc<SoftCard>, RawPeer) {
    let (client, far) = tokio::io::duplex(capacity);
    let local = card();
    let session: Arc<dyn CardSession> = local.clone();
    let conn = RemoteConnection::from_stream(session, client, config);
    let (read, write) = split(far);
    let peer = RawPeer {
        read,
        write,
        key: SigningKey::random(&mut rand::rngs::OsRng),
    };
    (conn, local, peer)
}

impl RawPeer {
    pub async fn send(&mut self, kind: MessageKind, payload: impl Into<Vec<u8>>) {
        write_envelope(&mut self.write, &Envelope::new(kind, payload))
            .await
            .unwrap();
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) {
        write_envelope(&mut self.write, envelope).await.unwrap();
    }

    /// Writes bytes straight onto the stream, framing included.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.unwrap();
        self.write.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> Envelope {
        let body = read_frame(&mut self.read, MAX_FRAME_LENGTH)
            .await
            .unwrap()
            .expect("connection closed its stream");
        Envelope::decode(&body).unwrap()
    }

    /// Drains the stream until the connection shuts its side.
    pub async fn read_until_closed(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        self.read.read_to_end(&mut rest).await.unwrap();
        rest
    }

    pub async fn expect(&mut self, kind: MessageKind) -> Vec<u8> {
        let envelope = self.recv().await;
        assert_eq!(envelope.kind(), Some(kind), "unexpected envelope");
        envelope.payload
    }

    /// Answers the next identify challenge, altered as `tamper` says.
    pub async fn answer_identify(&mut self, tamper: Tamper) {
        let mut nonce = self.expect(MessageKind::RequestIdentify).await;
        if let Tamper::Nonce(bit) = tamper {
            flip_bit(&mut nonce, bit);
        }
        let mut response = IdentifyResponse::sign(&self.key, &nonce).unwrap();
        match tamper {
            Tamper::Signature(bit) => flip_bit(&mut response.signature, bit),
            Tamper::Key(bit) => flip_bit(&mut response.public_key, bit),
            Tamper::HighS => response.signature = with_high_s(&response.signature),
            Tamper::None | Tamper::Nonce(_) => {}
        }
        self.send(MessageKind::ResponseIdentify, response.encode().unwrap())
            .await;
    }

    pub async fn answer_identify_honestly(&mut self) {
        self.answer_identify(Tamper::None).await;
    }
}

/// Ways the raw peer can alter an identify answer.
#[derive(Debug, Clone, Copy)]
pub enum Tamper {
    None,
    /// Sign a nonce differing in this bit from the one received.
    Nonce(usize),
    Signature(usize),
    Key(usize),
    /// Still valid: the same signature in its high-S form, as a card that
    /// does not normalize would send it.
    HighS,
}

/// Replaces `s` with `n - s`.
pub fn with_high_s(signature: &[u8]) -> Vec<u8> {
    use k256::elliptic_curve::{scalar::IsHigh, PrimeField};

    let low = Signature::from_slice(signature).unwrap();
    let high = Signature::from_scalars((*low.r()).to_repr(), (-*low.s()).to_repr()).unwrap();
    assert!(bool::from(high.s().is_high()));
    high.to_bytes().to_vec()
}

pub fn flip_bit(bytes: &mut [u8], bit: usize) {
    bytes[bit / 8] ^= 1 << (bit % 8);
}
