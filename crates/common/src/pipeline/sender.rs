use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;
use uuid::Uuid;

use super::{Pipeline, StepEvent};
use crate::anomaly::{pick_first, AnomalyKind, MergeAnomaly};
use crate::config::{PackageMode, RetryPolicy, TransferConfig};
use crate::crypto::{HybridCipher, KeyResolver, PublicKey, ResolveError};
use crate::error::TransferError;
use crate::package::{
    self, AttachmentContent, PackageError, PackageShape, Resource, TransferPackage,
    PACKAGE_MIME_TYPE,
};
use crate::protocol::{
    send_with_retry, MessageError, MessageKind, Messenger, Parameter, TaskMessage,
    TransportError, DMS_IDENTIFIER, DOCUMENT_REFERENCE_LOCATION, PROJECT_IDENTIFIER,
};
use crate::status::{Notifier, SenderEvent, SenderTracker, StatusCode};
use crate::store::{
    binary_location, document_location, parse_location, AttachmentRef, Binary, Document,
    DocumentStatus, DocumentStore, StoreError, BINARY_PREFIX,
};

/// Content type of every encrypted binary on the intermediary store
pub const TRANSFER_CONTENT_TYPE: &str = "application/octet-stream";

/// Sender steps, each carrying the data the step works on
#[derive(Debug)]
pub enum SenderStep {
    ReadData,
    Validate(Vec<Resource>),
    Build(Vec<Resource>),
    ResolveKey(TransferPackage),
    EncryptAndStore(TransferPackage, PublicKey),
    /// Carries the transfer descriptor's location
    Send(String),
    AwaitReceipt,
    DeleteData,
    Done,
}

impl SenderStep {
    pub fn name(&self) -> &'static str {
        match self {
            SenderStep::ReadData => "read-data",
            SenderStep::Validate(_) => "validate",
            SenderStep::Build(_) => "build",
            SenderStep::ResolveKey(_) => "resolve-key",
            SenderStep::EncryptAndStore(..) => "encrypt-and-store",
            SenderStep::Send(_) => "send",
            SenderStep::AwaitReceipt => "await-receipt",
            SenderStep::DeleteData => "delete-data",
            SenderStep::Done => "done",
        }
    }
}

/// State of one outgoing transfer
#[derive(Debug)]
pub struct SenderContext {
    pub business_key: Uuid,
    pub project_identifier: String,
    pub recipient: String,
    next: SenderStep,
    tracker: SenderTracker,
    /// The data-send-start message this transfer was started from
    start: Option<TaskMessage>,
    receipt: Option<TaskMessage>,
    scheduler_completed: bool,
    transfer_document: Option<String>,
    transfer_binaries: Vec<String>,
    anomalies: Vec<MergeAnomaly>,
}

impl SenderContext {
    pub fn new(project_identifier: &str, recipient: &str, business_key: Uuid) -> Self {
        Self {
            business_key,
            project_identifier: project_identifier.to_string(),
            recipient: recipient.to_string(),
            next: SenderStep::ReadData,
            tracker: SenderTracker::new(project_identifier, recipient),
            start: None,
            receipt: None,
            scheduler_completed: false,
            transfer_document: None,
            transfer_binaries: Vec::new(),
            anomalies: Vec::new(),
        }
    }

    pub fn next_step(&self) -> &SenderStep {
        &self.next
    }

    pub fn tracker(&self) -> &SenderTracker {
        &self.tracker
    }

    pub fn start_message(&self) -> Option<&TaskMessage> {
        self.start.as_ref()
    }

    /// Id of the transfer descriptor on the intermediary store, while it exists
    pub fn transfer_document(&self) -> Option<&str> {
        self.transfer_document.as_deref()
    }

    pub fn anomalies(&self) -> &[MergeAnomaly] {
        &self.anomalies
    }

    /// Hand a `data-receive` message to this transfer. Messages for other
    /// transfers or from other organizations are ignored.
    pub fn deliver_receipt(&mut self, message: TaskMessage) -> bool {
        if message.kind != MessageKind::DataReceive
            || message.business_key != self.business_key
            || message.requester != self.recipient
        {
            tracing::debug!(
                business_key = %message.business_key,
                requester = %message.requester,
                "ignoring message for another transfer"
            );
            return false;
        }
        if let Err(e) = message.status_input() {
            tracing::warn!(requester = %message.requester, "ignoring receipt: {}", e);
            return false;
        }
        self.receipt = Some(message);
        true
    }

    /// Signal that the scheduler completed the transfer
    pub fn complete(&mut self) {
        self.scheduler_completed = true;
    }

    fn has_transfer_data(&self) -> bool {
        self.transfer_document.is_some() || !self.transfer_binaries.is_empty()
    }
}

/// Sending side of the transfer protocol
#[derive(Debug, Clone)]
pub struct Sender {
    local_organization: String,
    mode: PackageMode,
    stream_source: bool,
    retry: RetryPolicy,
    source: Arc<dyn DocumentStore>,
    source_base: Option<Url>,
    intermediary: Arc<dyn DocumentStore>,
    intermediary_base: Option<Url>,
    /// Stores recipients publish their key bundles on
    endpoints: HashMap<String, Arc<dyn DocumentStore>>,
    resolver: KeyResolver,
    messenger: Arc<dyn Messenger>,
    notifier: Arc<dyn Notifier>,
}

impl Sender {
    pub fn new(
        config: &TransferConfig,
        source: Arc<dyn DocumentStore>,
        intermediary: Arc<dyn DocumentStore>,
        messenger: Arc<dyn Messenger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            local_organization: config.local_organization.clone(),
            mode: config.mode,
            stream_source: config.stream.read_source_binaries,
            retry: config.retry,
            source,
            source_base: config.stores.source.clone(),
            intermediary,
            intermediary_base: config.stores.intermediary.clone(),
            endpoints: HashMap::new(),
            resolver: KeyResolver::new(),
            messenger,
            notifier,
        }
    }

    /// Register the store `organization` publishes its public key on
    pub fn with_endpoint(mut self, organization: &str, store: Arc<dyn DocumentStore>) -> Self {
        self.endpoints.insert(organization.to_string(), store);
        self
    }

    /// Start a transfer from a `data-send-start` message
    pub fn start(&self, message: TaskMessage) -> Result<SenderContext, MessageError> {
        message.expect_kind(MessageKind::DataSendStart)?;
        let project_identifier = message.text_input(PROJECT_IDENTIFIER)?.to_string();
        let recipient = message.text_input(DMS_IDENTIFIER)?.to_string();

        let mut ctx = SenderContext::new(&project_identifier, &recipient, message.business_key);
        ctx.start = Some(message);
        Ok(ctx)
    }

    pub async fn drive(&self, ctx: SenderContext) -> (SenderContext, StepEvent) {
        super::drive(self, ctx).await
    }

    async fn read_data(&self, ctx: &mut SenderContext) -> Result<Vec<Resource>, TransferError> {
        let documents = self
            .source
            .search_documents(&ctx.project_identifier, None)
            .await?;
        let (document, anomaly) =
            pick_first(documents, AnomalyKind::SourceDocument, &ctx.project_identifier);
        ctx.anomalies.extend(anomaly);
        let document = document.ok_or(PackageError::Empty)?;

        // a whole-package envelope needs every byte in memory anyway
        let stream = self.stream_source && self.mode == PackageMode::Attachments;

        let mut resources = Vec::with_capacity(document.attachments.len());
        for attachment in document.attachments {
            let id = parse_location(&attachment.location, BINARY_PREFIX, self.source_base.as_ref())?;
            let resource = if stream {
                Resource::Remote {
                    content_type: attachment.mime_type,
                    location: binary_location(&id),
                }
            } else {
                let binary = self.source.read_binary(&id).await?;
                tracing::debug!(binary = %id, len = binary.data.len(), "read source binary");
                Resource::Binary {
                    content_type: attachment.mime_type,
                    data: binary.data,
                }
            };
            resources.push(resource);
        }

        tracing::info!(
            project = %ctx.project_identifier,
            attachments = resources.len(),
            stream,
            "read data for transfer"
        );
        Ok(resources)
    }

    /// Inline content is checked here, streamed content while it is encrypted
    fn validate(resources: &[Resource]) -> Result<(), TransferError> {
        for resource in resources {
            if let Resource::Binary { content_type, data } = resource {
                package::validate(content_type, data)?;
            }
        }
        Ok(())
    }

    async fn resolve_key(&self, ctx: &SenderContext) -> Result<PublicKey, TransferError> {
        let endpoint = self.endpoints.get(&ctx.recipient).ok_or_else(|| {
            TransportError::Unreachable(format!("no endpoint known for {}", ctx.recipient))
        })?;
        let key = self
            .resolver
            .resolve(endpoint.as_ref())
            .await
            .map_err(|e| match e {
                // the endpoint belongs to the recipient
                ResolveError::Store(e) => TransferError::Transport(e.into()),
                e => e.into(),
            })?;
        tracing::info!(recipient = %ctx.recipient, "resolved recipient key");
        Ok(key)
    }

    async fn encrypt_and_store(
        &self,
        ctx: &mut SenderContext,
        package: TransferPackage,
        key: PublicKey,
    ) -> Result<String, TransferError> {
        let mut document = Document::new(&package.project_identifier, &self.local_organization);
        document.status = DocumentStatus::Preliminary;
        document.readable_by = Some(ctx.recipient.clone());
        let mut document = self.intermediary.create_document(document).await?;
        let document_id = document
            .id
            .clone()
            .ok_or_else(|| StoreError::Malformed("created document has no id".into()))?;
        ctx.transfer_document = Some(document_id.clone());

        let attachments = match self.mode {
            PackageMode::Bundle => {
                let shape = PackageShape::for_attachments(package.attachments.len());
                let encoded = package.encode(shape)?;
                let envelope =
                    HybridCipher::encrypt(&key, &encoded, &self.local_organization, &ctx.recipient)?;
                let id = self.store_envelope(ctx, envelope).await?;
                vec![AttachmentRef {
                    location: binary_location(&id),
                    mime_type: PACKAGE_MIME_TYPE.to_string(),
                    hash: None,
                }]
            }
            PackageMode::Attachments => {
                let mut attachments = Vec::with_capacity(package.attachments.len());
                for attachment in package.attachments {
                    let id = match attachment.content {
                        AttachmentContent::Inline(data) => {
                            let envelope = HybridCipher::encrypt(
                                &key,
                                &data,
                                &self.local_organization,
                                &ctx.recipient,
                            )?;
                            self.store_envelope(ctx, envelope).await?
                        }
                        AttachmentContent::Remote(location) => {
                            self.stream_envelope(ctx, &key, &attachment.mime_type, &location)
                                .await?
                        }
                    };
                    attachments.push(AttachmentRef {
                        location: binary_location(&id),
                        mime_type: attachment.mime_type,
                        hash: None,
                    });
                }
                attachments
            }
        };

        document.status = DocumentStatus::Final;
        document.attachments = attachments;
        self.intermediary.update_document(document).await?;

        let location = match &self.intermediary_base {
            Some(base) => format!(
                "{}/{}",
                base.as_str().trim_end_matches('/'),
                document_location(&document_id)
            ),
            None => document_location(&document_id),
        };
        tracing::info!(
            project = %ctx.project_identifier,
            document = %document_id,
            binaries = ctx.transfer_binaries.len(),
            "stored encrypted transfer data"
        );
        Ok(location)
    }

    async fn store_envelope(
        &self,
        ctx: &mut SenderContext,
        envelope: Bytes,
    ) -> Result<String, TransferError> {
        let mut binary = Binary::new(TRANSFER_CONTENT_TYPE, envelope);
        binary.readable_by = Some(ctx.recipient.clone());
        let id = self.intermediary.create_binary(binary).await?;
        ctx.transfer_binaries.push(id.clone());
        Ok(id)
    }

    /// Source stream, validated, encrypted and written without buffering
    async fn stream_envelope(
        &self,
        ctx: &mut SenderContext,
        key: &PublicKey,
        mime_type: &str,
        location: &str,
    ) -> Result<String, TransferError> {
        let source_id = parse_location(location, BINARY_PREFIX, self.source_base.as_ref())?;
        let (_, stream) = self.source.read_binary_stream(&source_id).await?;
        let validated = package::validate_stream(mime_type, stream)?;
        let encrypted =
            HybridCipher::encrypt_stream(key, validated, &self.local_organization, &ctx.recipient)?;
        let id = self
            .intermediary
            .create_binary_stream(TRANSFER_CONTENT_TYPE, Some(&ctx.recipient), encrypted)
            .await?;
        ctx.transfer_binaries.push(id.clone());
        Ok(id)
    }

    async fn send(&self, ctx: &mut SenderContext, location: String) -> Result<(), TransferError> {
        let message = TaskMessage::new(
            MessageKind::DataSend,
            &self.local_organization,
            &ctx.recipient,
            ctx.business_key,
        )
        .with_input(Parameter::text(PROJECT_IDENTIFIER, &ctx.project_identifier))
        .with_input(Parameter::text(DOCUMENT_REFERENCE_LOCATION, location));

        self.record(ctx, SenderEvent::Dispatched).await;
        send_with_retry(self.messenger.as_ref(), &self.retry, &message).await?;
        self.record(ctx, SenderEvent::Delivered).await;
        tracing::info!(
            project = %ctx.project_identifier,
            recipient = %ctx.recipient,
            "sent data-send message"
        );
        Ok(())
    }

    async fn await_receipt(&self, mut ctx: SenderContext) -> (SenderContext, StepEvent) {
        if let Some(receipt) = ctx.receipt.take() {
            if let Ok(status) = receipt.status_input() {
                self.record(&mut ctx, SenderEvent::Receipt(status.clone())).await;
            }
            if let Some(start) = ctx.start.as_mut() {
                start.copy_status_inputs_to_outputs(&receipt);
            }
        } else if ctx.scheduler_completed {
            self.record(&mut ctx, SenderEvent::SchedulerCompleted).await;
            record_on_start(&mut ctx);
        } else {
            ctx.next = SenderStep::AwaitReceipt;
            return (ctx, StepEvent::Await);
        }

        ctx.next = SenderStep::DeleteData;
        (ctx, StepEvent::Continue)
    }

    /// Remove the transfer descriptor and its binaries. Failures are
    /// logged, the outcome of the transfer is already decided.
    async fn delete_data(&self, ctx: &mut SenderContext) {
        for id in std::mem::take(&mut ctx.transfer_binaries) {
            if let Err(e) = self.intermediary.delete_binary(&id).await {
                tracing::warn!(binary = %id, "failed to delete transfer binary: {}", e);
            }
        }
        if let Some(id) = ctx.transfer_document.take() {
            if let Err(e) = self.intermediary.delete_document(&id).await {
                tracing::warn!(document = %id, "failed to delete transfer document: {}", e);
            }
        }
        tracing::debug!(project = %ctx.project_identifier, "deleted transfer data");
    }

    async fn record(&self, ctx: &mut SenderContext, event: SenderEvent) {
        match ctx.tracker.apply(event) {
            Ok(outcome) => {
                if let Some(notification) = outcome.notification {
                    self.notifier.notify(&notification).await;
                }
            }
            Err(e) => tracing::error!(project = %ctx.project_identifier, "{}", e),
        }
    }

    async fn fail(
        &self,
        mut ctx: SenderContext,
        step: &'static str,
        e: TransferError,
    ) -> (SenderContext, StepEvent) {
        tracing::warn!(
            project = %ctx.project_identifier,
            recipient = %ctx.recipient,
            step,
            "transfer failed: {}",
            e
        );
        let diagnostic = e.diagnostic();
        let event = match e.transport_code() {
            Some(code) => SenderEvent::TransportFailed {
                forbidden: code == StatusCode::NotAllowed,
                diagnostic,
            },
            None => SenderEvent::Aborted { diagnostic },
        };
        self.record(&mut ctx, event).await;
        record_on_start(&mut ctx);

        if ctx.has_transfer_data() {
            ctx.next = SenderStep::DeleteData;
            (ctx, StepEvent::Continue)
        } else {
            ctx.next = SenderStep::Done;
            (ctx, StepEvent::Finished)
        }
    }
}

fn record_on_start(ctx: &mut SenderContext) {
    if let (Some(start), Some(status)) = (ctx.start.as_mut(), ctx.tracker.status()) {
        start.record_status(status.clone());
    }
}

#[async_trait]
impl Pipeline for Sender {
    type Context = SenderContext;

    async fn step(&self, mut ctx: SenderContext) -> (SenderContext, StepEvent) {
        let step = std::mem::replace(&mut ctx.next, SenderStep::Done);
        let name = step.name();
        tracing::debug!(project = %ctx.project_identifier, step = name, "sender step");

        let result = match step {
            SenderStep::ReadData => self.read_data(&mut ctx).await.map(SenderStep::Validate),
            SenderStep::Validate(resources) => {
                Self::validate(&resources).map(|_| SenderStep::Build(resources))
            }
            SenderStep::Build(resources) => {
                TransferPackage::build(&ctx.project_identifier, &self.local_organization, resources)
                    .map(SenderStep::ResolveKey)
                    .map_err(TransferError::from)
            }
            SenderStep::ResolveKey(package) => self
                .resolve_key(&ctx)
                .await
                .map(|key| SenderStep::EncryptAndStore(package, key)),
            SenderStep::EncryptAndStore(package, key) => self
                .encrypt_and_store(&mut ctx, package, key)
                .await
                .map(SenderStep::Send),
            SenderStep::Send(location) => self
                .send(&mut ctx, location)
                .await
                .map(|_| SenderStep::AwaitReceipt),
            SenderStep::AwaitReceipt => return self.await_receipt(ctx).await,
            SenderStep::DeleteData => {
                self.delete_data(&mut ctx).await;
                Ok(SenderStep::Done)
            }
            SenderStep::Done => return (ctx, StepEvent::Finished),
        };

        match result {
            Ok(SenderStep::Done) => (ctx, StepEvent::Finished),
            Ok(next) => {
                ctx.next = next;
                (ctx, StepEvent::Continue)
            }
            Err(e) => self.fail(ctx, name, e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::KeyConfig;
    use crate::crypto::{test_keys, KeyStore};
    use crate::protocol::MemoryMessenger;
    use crate::status::{DataSetStatus, MemoryNotifier, SenderState};
    use crate::store::MemoryDocumentStore;

    struct Fixture {
        source: MemoryDocumentStore,
        intermediary: MemoryDocumentStore,
        messenger: MemoryMessenger,
        notifier: MemoryNotifier,
        sender: Sender,
    }

    async fn fixture(mode: PackageMode) -> Fixture {
        let source = MemoryDocumentStore::new();
        let data = Bytes::from_static(br#"{"resourceType":"Bundle","type":"batch"}"#);
        let id = source
            .create_binary(Binary::new("application/fhir+json", data))
            .await
            .unwrap();
        let mut document = Document::new("PROJ-7", "DIC1");
        document.attachments.push(AttachmentRef {
            location: binary_location(&id),
            mime_type: "application/fhir+json".into(),
            hash: None,
        });
        source.create_document(document).await.unwrap();

        let endpoint = MemoryDocumentStore::new();
        KeyStore::from_pair(test_keys::recipient().clone())
            .publish_to(&endpoint, "DMS1")
            .await
            .unwrap();

        let mut config = TransferConfig::new("DIC1", KeyConfig::in_dir(std::path::Path::new(".")));
        config.mode = mode;
        config.retry = RetryPolicy {
            attempts: 2,
            interval: Duration::from_millis(1),
        };

        let intermediary = MemoryDocumentStore::new();
        let messenger = MemoryMessenger::new();
        let notifier = MemoryNotifier::new();
        let sender = Sender::new(
            &config,
            Arc::new(source.clone()),
            Arc::new(intermediary.clone()),
            Arc::new(messenger.clone()),
            Arc::new(notifier.clone()),
        )
        .with_endpoint("DMS1", Arc::new(endpoint));

        Fixture {
            source,
            intermediary,
            messenger,
            notifier,
            sender,
        }
    }

    fn start_message() -> TaskMessage {
        TaskMessage::new(MessageKind::DataSendStart, "DIC1", "DIC1", Uuid::new_v4())
            .with_input(Parameter::text(PROJECT_IDENTIFIER, "PROJ-7"))
            .with_input(Parameter::text(DMS_IDENTIFIER, "DMS1"))
    }

    #[tokio::test]
    async fn test_stores_final_descriptor_and_sends() {
        let f = fixture(PackageMode::Attachments).await;
        let ctx = f.sender.start(start_message()).unwrap();
        let (ctx, event) = f.sender.drive(ctx).await;

        assert_eq!(event, StepEvent::Await);
        assert_eq!(ctx.tracker().state(), SenderState::AwaitingReceipt);

        let document_id = ctx.transfer_document().unwrap();
        let document = f.intermediary.read_document(document_id).await.unwrap();
        assert_eq!(document.status, DocumentStatus::Final);
        assert_eq!(document.readable_by.as_deref(), Some("DMS1"));
        assert_eq!(document.attachments.len(), 1);
        assert_eq!(document.attachments[0].mime_type, "application/fhir+json");

        let id = parse_location(&document.attachments[0].location, BINARY_PREFIX, None).unwrap();
        let binary = f.intermediary.read_binary(&id).await.unwrap();
        assert_eq!(binary.content_type, TRANSFER_CONTENT_TYPE);
        let plaintext =
            HybridCipher::decrypt(&test_keys::recipient().private, &binary.data, "DIC1", "DMS1")
                .unwrap();
        assert!(plaintext.starts_with(b"{\"resourceType\""));

        let sent = f.messenger.take("DMS1");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::DataSend);
        assert_eq!(
            sent[0].text_input(DOCUMENT_REFERENCE_LOCATION).unwrap(),
            document_location(document_id)
        );
    }

    #[tokio::test]
    async fn test_bundle_mode_stores_one_envelope() {
        let f = fixture(PackageMode::Bundle).await;
        let ctx = f.sender.start(start_message()).unwrap();
        let (ctx, _) = f.sender.drive(ctx).await;

        let document = f
            .intermediary
            .read_document(ctx.transfer_document().unwrap())
            .await
            .unwrap();
        assert_eq!(document.attachments.len(), 1);
        assert_eq!(document.attachments[0].mime_type, PACKAGE_MIME_TYPE);
    }

    #[tokio::test]
    async fn test_receipt_missing_cleans_up() {
        let f = fixture(PackageMode::Attachments).await;
        let ctx = f.sender.start(start_message()).unwrap();
        let (mut ctx, _) = f.sender.drive(ctx).await;
        assert_eq!(f.intermediary.document_count(), 1);

        // still waiting without input
        let (again, event) = f.sender.drive(ctx).await;
        assert_eq!(event, StepEvent::Await);
        ctx = again;

        ctx.complete();
        let (ctx, event) = f.sender.drive(ctx).await;
        assert_eq!(event, StepEvent::Finished);
        assert_eq!(ctx.tracker().state(), SenderState::ReceiptMissing);
        assert_eq!(
            ctx.start_message().unwrap().status_output().unwrap().code,
            StatusCode::ReceiptMissing
        );
        assert_eq!(f.intermediary.document_count(), 0);
        assert_eq!(f.intermediary.binary_count(), 0);
        assert_eq!(f.notifier.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_receipt_is_ignored() {
        let f = fixture(PackageMode::Attachments).await;
        let ctx = f.sender.start(start_message()).unwrap();
        let (mut ctx, _) = f.sender.drive(ctx).await;

        let stranger = TaskMessage::new(MessageKind::DataReceive, "DMS1", "DIC1", Uuid::new_v4())
            .with_input(Parameter::status(DataSetStatus::ok(StatusCode::ReceiptOk)));
        assert!(!ctx.deliver_receipt(stranger));
        let (_, event) = f.sender.drive(ctx).await;
        assert_eq!(event, StepEvent::Await);
    }

    #[tokio::test]
    async fn test_forbidden_send_is_not_allowed() {
        let f = fixture(PackageMode::Attachments).await;
        f.messenger.deny("DMS1");
        let ctx = f.sender.start(start_message()).unwrap();
        let (ctx, event) = f.sender.drive(ctx).await;

        assert_eq!(event, StepEvent::Finished);
        assert_eq!(ctx.tracker().state(), SenderState::NotAllowed);
        assert_eq!(f.intermediary.document_count(), 0);
        assert_eq!(f.intermediary.binary_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_after_retries() {
        let f = fixture(PackageMode::Attachments).await;
        f.messenger.fail_next("DMS1", 5);
        let ctx = f.sender.start(start_message()).unwrap();
        let (ctx, _) = f.sender.drive(ctx).await;
        assert_eq!(ctx.tracker().state(), SenderState::NotReachable);
    }

    #[tokio::test]
    async fn test_invalid_source_content_aborts() {
        let f = fixture(PackageMode::Attachments).await;
        let id = f
            .source
            .create_binary(Binary::new("application/pdf", Bytes::from_static(b"nope")))
            .await
            .unwrap();
        let mut document = Document::new("PROJ-9", "DIC1");
        document.attachments.push(AttachmentRef {
            location: binary_location(&id),
            mime_type: "application/pdf".into(),
            hash: None,
        });
        f.source.create_document(document).await.unwrap();

        let ctx = SenderContext::new("PROJ-9", "DMS1", Uuid::new_v4());
        let (ctx, event) = f.sender.drive(ctx).await;
        assert_eq!(event, StepEvent::Finished);
        assert_eq!(ctx.tracker().state(), SenderState::Aborted);
        assert_eq!(f.intermediary.document_count(), 0);
        assert!(f.messenger.take("DMS1").is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_binary_aborts() {
        let f = fixture(PackageMode::Attachments).await;
        let mut document = Document::new("PROJ-9", "DIC1");
        document.attachments.push(AttachmentRef {
            location: "Binary/does-not-exist".into(),
            mime_type: "application/fhir+json".into(),
            hash: None,
        });
        f.source.create_document(document).await.unwrap();

        let ctx = SenderContext::new("PROJ-9", "DMS1", Uuid::new_v4());
        let (ctx, event) = f.sender.drive(ctx).await;
        assert_eq!(event, StepEvent::Finished);
        assert_eq!(ctx.tracker().state(), SenderState::Aborted);
        assert_eq!(f.intermediary.document_count(), 0);
        assert_eq!(f.messenger.pending("DMS1"), 0);
    }

    #[tokio::test]
    async fn test_intermediary_write_failure_aborts() {
        let f = fixture(PackageMode::Attachments).await;
        f.intermediary.inject_failures(1);
        let ctx = f.sender.start(start_message()).unwrap();
        let (ctx, event) = f.sender.drive(ctx).await;

        assert_eq!(event, StepEvent::Finished);
        assert_eq!(ctx.tracker().state(), SenderState::Aborted);
        assert_eq!(f.intermediary.document_count(), 0);
        assert_eq!(f.messenger.pending("DMS1"), 0);
    }

    #[tokio::test]
    async fn test_endpoint_without_key_is_unreachable() {
        let f = fixture(PackageMode::Attachments).await;
        let sender = f
            .sender
            .with_endpoint("DMS2", Arc::new(MemoryDocumentStore::new()));

        let ctx = SenderContext::new("PROJ-7", "DMS2", Uuid::new_v4());
        let (ctx, _) = sender.drive(ctx).await;
        assert_eq!(ctx.tracker().state(), SenderState::NotReachable);
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_unreachable() {
        let f = fixture(PackageMode::Attachments).await;
        let ctx = SenderContext::new("PROJ-7", "DMS9", Uuid::new_v4());
        let (ctx, _) = f.sender.drive(ctx).await;
        assert_eq!(ctx.tracker().state(), SenderState::NotReachable);
        assert_eq!(f.intermediary.document_count(), 0);
    }
}
