//! Integration tests for transfers that do not end in receipt-ok

mod common;

use ::common::anomaly::AnomalyKind;
use ::common::crypto::{KeyStore, PublishedKeyBundle, KEY_BUNDLE_NAME};
use ::common::pipeline::StepEvent;
use ::common::status::{ReceiverState, SenderState, Severity, StatusCode};
use ::common::store::{Document, DocumentStore};

use crate::common::{
    receiver_keys, Network, Options, FHIR_JSON, PAYLOAD, PROJECT, RECEIVER_ORG, SENDER_ORG,
};

#[tokio::test]
async fn test_wrong_receiver_identity_fails_decryption() {
    let net = Network::new(Options {
        receiver_org: "DMS9",
        ..Options::default()
    })
    .await;
    net.seed(&[(FHIR_JSON, PAYLOAD)]).await;

    let (sender, receiver) = net.transfer().await;

    assert_eq!(receiver.tracker().state(), ReceiverState::ReceiveError);
    assert_eq!(sender.tracker().state(), SenderState::ReceiptError);
    let status = sender.tracker().status().unwrap();
    assert_eq!(status.code, StatusCode::ReceiptError);
    assert_eq!(status.error.as_deref(), Some("decryption failed"));
    assert!(net.stored().await.is_empty());
    assert_eq!(net.destination.binary_count(), 0);
}

#[tokio::test]
async fn test_streamed_decryption_failure_releases_streams() {
    let net = Network::new(Options {
        stream: true,
        receiver_org: "DMS9",
        ..Options::default()
    })
    .await;
    let large = vec![b'x'; 300 * 1024];
    net.seed(&[("text/plain", &large)]).await;

    let (sender, receiver) = net.transfer().await;

    assert_eq!(receiver.tracker().state(), ReceiverState::ReceiveError);
    assert_eq!(sender.tracker().state(), SenderState::ReceiptError);
    assert_eq!(net.intermediary.open_streams(), 0);
    assert_eq!(net.source.open_streams(), 0);
    assert!(net.stored().await.is_empty());
}

#[tokio::test]
async fn test_tampered_key_aborts_before_dispatch() {
    let net = Network::new(Options::default()).await;
    net.seed(&[(FHIR_JSON, PAYLOAD)]).await;

    let published = KeyStore::from_pair(receiver_keys().clone())
        .publish()
        .unwrap();
    let tampered = PublishedKeyBundle {
        public_key_bytes: published.public_key_bytes,
        sha256: "00".repeat(32),
    };
    net.endpoint
        .publish_bundle(KEY_BUNDLE_NAME, tampered.to_bundle(RECEIVER_ORG))
        .await
        .unwrap();

    let (sender, event) = net.send().await;

    assert_eq!(event, StepEvent::Finished);
    assert_eq!(sender.tracker().state(), SenderState::Aborted);
    assert_eq!(net.messenger.pending(RECEIVER_ORG), 0);
    assert_eq!(net.intermediary.document_count(), 0);

    let notifications = net.sender_notifier.notifications();
    let last = notifications.last().unwrap();
    assert_eq!(last.severity, Severity::Failure);
    assert_eq!(last.code, None);
}

#[tokio::test]
async fn test_receipt_missing() {
    let net = Network::new(Options::default()).await;
    net.seed(&[(FHIR_JSON, PAYLOAD)]).await;

    let (mut sender, event) = net.send().await;
    assert_eq!(event, StepEvent::Await);

    // the receiver never answers
    sender.complete();
    let (sender, event) = net.sender.drive(sender).await;

    assert_eq!(event, StepEvent::Finished);
    assert_eq!(sender.tracker().state(), SenderState::ReceiptMissing);
    let start = sender.start_message().unwrap();
    assert_eq!(start.status_output().unwrap().code, StatusCode::ReceiptMissing);
    assert_eq!(net.intermediary.document_count(), 0);
}

#[tokio::test]
async fn test_receipt_after_completion_is_ignored() {
    let net = Network::new(Options::default()).await;
    net.seed(&[(FHIR_JSON, PAYLOAD)]).await;

    let (mut sender, _) = net.send().await;
    sender.complete();
    let (sender, _) = net.sender.drive(sender).await;

    net.receive().await;
    let (sender, event) = net.settle(sender).await;

    assert_eq!(event, StepEvent::Finished);
    assert_eq!(sender.tracker().state(), SenderState::ReceiptMissing);
}

#[tokio::test]
async fn test_recipient_refuses_message() {
    let net = Network::new(Options::default()).await;
    net.seed(&[(FHIR_JSON, PAYLOAD)]).await;
    net.messenger.deny(RECEIVER_ORG);

    let (sender, event) = net.send().await;

    assert_eq!(event, StepEvent::Finished);
    assert_eq!(sender.tracker().state(), SenderState::NotAllowed);
    let start = sender.start_message().unwrap();
    assert_eq!(start.status_output().unwrap().code, StatusCode::NotAllowed);
    assert_eq!(net.intermediary.document_count(), 0);
    assert_eq!(net.intermediary.binary_count(), 0);
}

#[tokio::test]
async fn test_recipient_unreachable_after_retries() {
    let net = Network::new(Options::default()).await;
    net.seed(&[(FHIR_JSON, PAYLOAD)]).await;
    net.messenger.fail_next(RECEIVER_ORG, 5);

    let (sender, event) = net.send().await;

    assert_eq!(event, StepEvent::Finished);
    assert_eq!(sender.tracker().state(), SenderState::NotReachable);
    assert_eq!(net.intermediary.document_count(), 0);
}

#[tokio::test]
async fn test_recipient_recovers_within_retries() {
    let net = Network::new(Options::default()).await;
    net.seed(&[(FHIR_JSON, PAYLOAD)]).await;
    net.messenger.fail_next(RECEIVER_ORG, 1);

    let (sender, _) = net.transfer().await;

    assert_eq!(sender.tracker().state(), SenderState::ReceiptOk);
}

#[tokio::test]
async fn test_duplicate_destination_records_use_the_first() {
    let net = Network::new(Options::default()).await;
    net.seed(&[(FHIR_JSON, PAYLOAD)]).await;
    let first = net
        .destination
        .create_document(Document::new(PROJECT, SENDER_ORG))
        .await
        .unwrap();
    net.destination
        .create_document(Document::new(PROJECT, SENDER_ORG))
        .await
        .unwrap();

    let (sender, receiver) = net.transfer().await;

    assert_eq!(sender.tracker().state(), SenderState::ReceiptOk);
    let outcome = receiver.outcome().unwrap();
    assert_eq!(Some(&outcome.document_id), first.id.as_ref());
    let anomaly = outcome.anomaly.as_ref().unwrap();
    assert_eq!(anomaly.kind, AnomalyKind::StoredDocument);
    assert_eq!(anomaly.candidates, 2);

    let stored = net.stored().await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].attachments.len(), 1);
    assert!(stored[1].attachments.is_empty());
}
