//! Shared test utilities for end-to-end transfer tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use common::config::{KeyConfig, PackageMode, RetryPolicy, TransferConfig};
use common::crypto::{KeyPair, KeyStore};
use common::pipeline::{Receiver, ReceiverContext, Sender, SenderContext, StepEvent};
use common::protocol::{
    MemoryMessenger, MessageKind, Parameter, TaskMessage, DMS_IDENTIFIER, PROJECT_IDENTIFIER,
};
use common::status::MemoryNotifier;
use common::store::{
    binary_location, AttachmentRef, Binary, Document, DocumentStore, MemoryDocumentStore,
};

pub const SENDER_ORG: &str = "DIC1";
pub const RECEIVER_ORG: &str = "DMS1";
pub const PROJECT: &str = "PROJ-7";
pub const FHIR_JSON: &str = "application/fhir+json";

/// 42 bytes of FHIR JSON
pub const PAYLOAD: &[u8] = br#"{"resourceType":"Bundle","type":"message"}"#;

/// Key generation is slow, every test in a binary shares one pair
pub fn receiver_keys() -> &'static KeyPair {
    static PAIR: OnceLock<KeyPair> = OnceLock::new();
    PAIR.get_or_init(|| KeyPair::generate(2048).unwrap())
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub mode: PackageMode,
    pub stream: bool,
    /// Local organization the receiver believes it is
    pub receiver_org: &'static str,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: PackageMode::Attachments,
            stream: false,
            receiver_org: RECEIVER_ORG,
        }
    }
}

/// A sender and a receiver wired through in-memory stores and a messenger
pub struct Network {
    pub source: MemoryDocumentStore,
    pub intermediary: MemoryDocumentStore,
    pub destination: MemoryDocumentStore,
    /// Where the receiver's public key is published
    pub endpoint: MemoryDocumentStore,
    pub messenger: MemoryMessenger,
    pub sender_notifier: MemoryNotifier,
    pub receiver_notifier: MemoryNotifier,
    pub sender: Sender,
    pub receiver: Receiver,
}

fn config(organization: &str, options: Options) -> TransferConfig {
    let mut config = TransferConfig::new(organization, KeyConfig::in_dir(Path::new(".")));
    config.mode = options.mode;
    config.stream.read_source_binaries = options.stream;
    config.stream.read_transfer_binaries = options.stream;
    config.retry = RetryPolicy {
        attempts: 2,
        interval: Duration::from_millis(1),
    };
    config
}

impl Network {
    pub async fn new(options: Options) -> Self {
        let source = MemoryDocumentStore::new();
        let intermediary = MemoryDocumentStore::new();
        let destination = MemoryDocumentStore::new();
        let endpoint = MemoryDocumentStore::new();
        let messenger = MemoryMessenger::new();
        let sender_notifier = MemoryNotifier::new();
        let receiver_notifier = MemoryNotifier::new();

        let keys = Arc::new(KeyStore::from_pair(receiver_keys().clone()));
        keys.publish_to(&endpoint, RECEIVER_ORG).await.unwrap();

        let sender = Sender::new(
            &config(SENDER_ORG, options),
            Arc::new(source.clone()),
            Arc::new(intermediary.clone()),
            Arc::new(messenger.clone()),
            Arc::new(sender_notifier.clone()),
        )
        .with_endpoint(RECEIVER_ORG, Arc::new(endpoint.clone()));

        let receiver = Receiver::new(
            &config(options.receiver_org, options),
            keys,
            Arc::new(intermediary.clone()),
            Arc::new(destination.clone()),
            Arc::new(messenger.clone()),
            Arc::new(receiver_notifier.clone()),
        );

        Self {
            source,
            intermediary,
            destination,
            endpoint,
            messenger,
            sender_notifier,
            receiver_notifier,
            sender,
            receiver,
        }
    }

    /// Put a data set for `PROJECT` into the source store
    pub async fn seed(&self, attachments: &[(&str, &[u8])]) {
        let mut document = Document::new(PROJECT, SENDER_ORG);
        for (mime_type, data) in attachments {
            let id = self
                .source
                .create_binary(Binary::new(*mime_type, Bytes::copy_from_slice(data)))
                .await
                .unwrap();
            document.attachments.push(AttachmentRef {
                location: binary_location(&id),
                mime_type: mime_type.to_string(),
                hash: None,
            });
        }
        self.source.create_document(document).await.unwrap();
    }

    /// Replace the attachments of the seeded data set for `PROJECT`
    pub async fn reseed(&self, attachments: &[(&str, &[u8])]) {
        let mut documents = self.source.search_documents(PROJECT, None).await.unwrap();
        assert_eq!(documents.len(), 1);
        let mut document = documents.remove(0);
        document.attachments.clear();
        for (mime_type, data) in attachments {
            let id = self
                .source
                .create_binary(Binary::new(*mime_type, Bytes::copy_from_slice(data)))
                .await
                .unwrap();
            document.attachments.push(AttachmentRef {
                location: binary_location(&id),
                mime_type: mime_type.to_string(),
                hash: None,
            });
        }
        self.source.update_document(document).await.unwrap();
    }

    pub fn start_message(&self) -> TaskMessage {
        TaskMessage::new(
            MessageKind::DataSendStart,
            SENDER_ORG,
            SENDER_ORG,
            Uuid::new_v4(),
        )
        .with_input(Parameter::text(PROJECT_IDENTIFIER, PROJECT))
        .with_input(Parameter::text(DMS_IDENTIFIER, RECEIVER_ORG))
    }

    /// Run the sender until it waits for the receipt
    pub async fn send(&self) -> (SenderContext, StepEvent) {
        let ctx = self.sender.start(self.start_message()).unwrap();
        self.sender.drive(ctx).await
    }

    /// Hand every pending data-send message to the receiver
    pub async fn receive(&self) -> Vec<ReceiverContext> {
        let mut contexts = Vec::new();
        for message in self.messenger.take(RECEIVER_ORG) {
            let (ctx, event) = self.receiver.drive(self.receiver.accept(message)).await;
            assert_eq!(event, StepEvent::Finished);
            contexts.push(ctx);
        }
        contexts
    }

    /// Deliver pending receipts to the sender and run it to completion
    pub async fn settle(&self, mut ctx: SenderContext) -> (SenderContext, StepEvent) {
        for receipt in self.messenger.take(SENDER_ORG) {
            ctx.deliver_receipt(receipt);
        }
        self.sender.drive(ctx).await
    }

    /// A full round: send, receive, deliver the receipt
    pub async fn transfer(&self) -> (SenderContext, ReceiverContext) {
        let (ctx, event) = self.send().await;
        assert_eq!(event, StepEvent::Await);
        let mut received = self.receive().await;
        assert_eq!(received.len(), 1);
        let (ctx, event) = self.settle(ctx).await;
        assert_eq!(event, StepEvent::Finished);
        (ctx, received.remove(0))
    }

    /// Data set stored at the destination for `PROJECT`
    pub async fn stored(&self) -> Vec<Document> {
        self.destination
            .search_documents(PROJECT, Some(SENDER_ORG))
            .await
            .unwrap()
    }
}
