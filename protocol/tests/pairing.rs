//! Identification, certificate exchange and two-phase pairing between two
//! software cards talking through the in-process relay.

mod common;

use std::sync::Arc;
use std::time::Duration;

use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;

use phonon_remote::config::RemoteConfig;
use phonon_remote::crypto;
use phonon_remote::remote::{PairingState, RemoteError};
use phonon_remote::session::CardCertificate;
use phonon_remote::soft_card::SoftCard;
use phonon_remote::wire::MessageKind;

use common::{bound_to, transcript};

fn short_timeouts() -> RemoteConfig {
    RemoteConfig::default().with_uniform_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn both_sides_identify_through_the_relay() {
    let net = common::verified(RemoteConfig::default()).await;

    assert!(net.a.is_identified_with_server());
    assert!(net.a.is_verified());
    assert!(net.b.is_verified());
    assert_eq!(net.a.state().peer_public_key, Some(net.card_b.public_key()));
    assert_eq!(net.b.state().peer_public_key, Some(net.card_a.public_key()));
}

#[tokio::test]
async fn initiator_pairs_and_responder_finalizes_first() {
    let net = common::verified(RemoteConfig::default()).await;

    let answer = net.a.card_pair(&net.card_a.public_key()).await.unwrap();
    assert_eq!(answer, net.card_b.public_key());
    assert_eq!(net.a.pairing_state(), PairingState::Pair1Sent);
    assert_eq!(net.b.pairing_state(), PairingState::Pair1Answered);

    let proof = transcript(&net.card_a.public_key(), &answer);
    net.a.finalize_card_pair(&proof).await.unwrap();

    assert!(net.a.is_pair_finalized());
    assert!(net.b.is_pair_finalized());
    assert!(net.card_b.is_paired());
    assert!(bound_to(&net.card_a, &net.a));
    assert!(bound_to(&net.card_b, &net.b));
}

#[tokio::test]
async fn responder_finalize_after_peer_completes_immediately() {
    let net = common::paired(RemoteConfig::default()).await;
    assert!(net.b.is_pair_finalized());

    // B already finalized as responder; its own finalize must not wait.
    net.b.finalize_card_pair(b"anything").await.unwrap();
    assert!(bound_to(&net.card_b, &net.b));

    // A round trip behind it guarantees the relay and A have handled it.
    net.b.identify().await.unwrap();
    assert!(net.a.is_pair_finalized());
    assert_eq!(net.relay.seen(MessageKind::RequestFinalizeCardPair), 2);
    assert_eq!(net.relay.seen(MessageKind::ResponseFinalizeCardPair), 2);
}

#[tokio::test]
async fn soft_cards_pair_end_to_end() {
    let net = common::paired(RemoteConfig::default()).await;

    assert_eq!(net.card_a.paired_peer(), Some(net.card_b.public_key()));
    assert_eq!(net.card_b.paired_peer(), Some(net.card_a.public_key()));
    assert!(bound_to(&net.card_a, &net.a));
    assert!(bound_to(&net.card_b, &net.b));
}

#[tokio::test]
async fn rejected_finalize_carries_peer_text_and_reverts() {
    let net = common::verified(RemoteConfig::default()).await;
    net.a.card_pair(&net.card_a.public_key()).await.unwrap();

    let err = net.a.finalize_card_pair(b"not the transcript").await.unwrap_err();
    match err {
        RemoteError::PeerRejected(text) => assert!(text.contains("transcript"), "{text}"),
        other => panic!("expected PeerRejected, got {other:?}"),
    }
    assert_eq!(net.a.pairing_state(), PairingState::Pair1Sent);
    assert!(!net.b.is_pair_finalized());
    assert!(net.card_b.remote_card().is_none());
}

#[tokio::test]
async fn pairing_requires_a_verified_peer() {
    let net = common::link(RemoteConfig::default());
    net.a.connect_to_card("card-b").await.unwrap();

    let err = net.a.card_pair(&net.card_a.public_key()).await.unwrap_err();
    assert!(matches!(err, RemoteError::PeerNotVerified));
    let err = net.a.finalize_card_pair(b"proof").await.unwrap_err();
    assert!(matches!(err, RemoteError::PeerNotVerified));
    assert_eq!(net.relay.seen(MessageKind::RequestCardPair1), 0);
}

#[tokio::test(start_paused = true)]
async fn responder_refuses_pairing_from_unverified_initiator() {
    let net = common::link(short_timeouts());
    net.a.connect_to_card("card-b").await.unwrap();
    net.b.connect_to_card("card-a").await.unwrap();
    // Only A checks B; B never verifies A.
    net.a.identify().await.unwrap();

    let err = net.a.card_pair(&net.card_a.public_key()).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(net.a.pairing_state(), PairingState::Unpaired);
    assert_eq!(net.b.pairing_state(), PairingState::Unpaired);
    assert_eq!(net.relay.seen(MessageKind::MessageError), 1);
}

#[tokio::test]
async fn finalize_without_phase_one_is_refused_locally() {
    let net = common::verified(RemoteConfig::default()).await;
    let err = net.a.finalize_card_pair(b"proof").await.unwrap_err();
    assert!(matches!(
        err,
        RemoteError::InvalidPairingState {
            state: PairingState::Unpaired,
            ..
        }
    ));
}

#[tokio::test]
async fn certificate_is_fetched_once() {
    let net = common::verified(RemoteConfig::default()).await;

    let (first, second) = tokio::join!(net.a.get_certificate(), net.a.get_certificate());
    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(first.public_key, net.card_b.public_key());

    let third = net.a.get_certificate().await.unwrap();
    assert_eq!(third, first);
    assert_eq!(net.relay.seen(MessageKind::RequestCertificate), 1);
}

#[tokio::test]
async fn identify_key_must_match_cached_certificate() {
    // B presents a certificate for some other key.
    let ca = SigningKey::random(&mut OsRng);
    let impostor_key = crypto::public_key_bytes(&SigningKey::random(&mut OsRng));
    let cert = CardCertificate::issue(&ca, 0x03, impostor_key).unwrap();
    let card_b = Arc::new(SoftCard::with_parts(SigningKey::random(&mut OsRng), Some(cert)));

    let net = common::link_cards(common::card(), card_b, RemoteConfig::default());
    net.a.connect_to_card("card-b").await.unwrap();
    net.a.get_certificate().await.unwrap();

    let err = net.a.identify().await.unwrap_err();
    assert!(matches!(err, RemoteError::VerificationFailed));
    assert!(!net.a.is_verified());
}

#[tokio::test(start_paused = true)]
async fn missing_certificate_times_out_without_caching() {
    let card_b = Arc::new(SoftCard::with_parts(SigningKey::random(&mut OsRng), None));
    let net = common::link_cards(common::card(), card_b, short_timeouts());
    net.a.connect_to_card("card-b").await.unwrap();

    let err = net.a.get_certificate().await.unwrap_err();
    assert!(matches!(
        err,
        RemoteError::Timeout {
            awaiting: MessageKind::ResponseCertificate,
            ..
        }
    ));
    assert!(net.a.peer_certificate().is_none());
    assert_eq!(net.relay.seen(MessageKind::MessageError), 1);
}

#[tokio::test(start_paused = true)]
async fn phase_one_timeout_reverts_and_keeps_verification() {
    let net = common::verified(short_timeouts()).await;
    net.relay.drop_kind(MessageKind::ResponseCardPair1);

    let err = net.a.card_pair(&net.card_a.public_key()).await.unwrap_err();
    assert!(matches!(
        err,
        RemoteError::Timeout {
            awaiting: MessageKind::ResponseCardPair1,
            ..
        }
    ));
    assert_eq!(net.a.pairing_state(), PairingState::Unpaired);
    assert!(net.a.is_verified());
    assert_eq!(net.a.state().peer_public_key, Some(net.card_b.public_key()));
    assert!(!net.a.is_closed());

    // The responder answered; a fresh attempt goes through.
    net.relay.allow_kind(MessageKind::ResponseCardPair1);
    net.card_a.pair_with(&*net.a).await.unwrap();
    assert!(net.a.is_pair_finalized());
    assert!(net.b.is_pair_finalized());
}

#[tokio::test(start_paused = true)]
async fn finalize_timeout_reverts_and_retry_completes() {
    let net = common::verified(short_timeouts()).await;
    let answer = net.a.card_pair(&net.card_a.public_key()).await.unwrap();
    let proof = transcript(&net.card_a.public_key(), &answer);

    net.relay.drop_kind(MessageKind::ResponseFinalizeCardPair);
    let err = net.a.finalize_card_pair(&proof).await.unwrap_err();
    assert!(matches!(
        err,
        RemoteError::Timeout {
            awaiting: MessageKind::ResponseFinalizeCardPair,
            ..
        }
    ));
    assert_eq!(net.a.pairing_state(), PairingState::Pair1Sent);
    assert!(net.a.is_verified());
    assert!(net.card_a.remote_card().is_none());
    // Only the answer was lost: the responder did finalize.
    assert!(net.b.is_pair_finalized());

    net.relay.allow_kind(MessageKind::ResponseFinalizeCardPair);
    net.a.finalize_card_pair(&proof).await.unwrap();
    assert!(net.a.is_pair_finalized());
    assert!(bound_to(&net.card_a, &net.a));
}
