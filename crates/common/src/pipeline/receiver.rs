use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::{Pipeline, StepEvent};
use crate::config::{RetryPolicy, TransferConfig};
use crate::crypto::{HybridCipher, KeyStore};
use crate::error::TransferError;
use crate::ingest::{IncomingAttachment, IngestOutcome, Ingestor};
use crate::package::{self, AttachmentContent, PackageError, PackageShape, TransferPackage, PACKAGE_MIME_TYPE};
use crate::protocol::{
    send_with_retry, MessageKind, Messenger, Parameter, TaskMessage, DOCUMENT_REFERENCE_LOCATION,
    PROJECT_IDENTIFIER,
};
use crate::status::{Notifier, ReceiverEvent, ReceiverState, ReceiverTracker};
use crate::store::{
    parse_location, Body, DocumentStatus, DocumentStore, BINARY_PREFIX, DOCUMENT_PREFIX,
};

/// Receiver steps, each carrying the attachments it works on
#[derive(Debug)]
pub enum ReceiverStep {
    Download,
    Decrypt(Vec<IncomingAttachment>),
    Validate(Vec<IncomingAttachment>),
    Insert(Vec<IncomingAttachment>),
    Receipt,
    Done,
}

impl ReceiverStep {
    pub fn name(&self) -> &'static str {
        match self {
            ReceiverStep::Download => "download",
            ReceiverStep::Decrypt(_) => "decrypt",
            ReceiverStep::Validate(_) => "validate",
            ReceiverStep::Insert(_) => "insert",
            ReceiverStep::Receipt => "receipt",
            ReceiverStep::Done => "done",
        }
    }
}

/// State of one incoming transfer
#[derive(Debug)]
pub struct ReceiverContext {
    /// The data-send message that started this transfer
    pub message: TaskMessage,
    pub project_identifier: String,
    next: ReceiverStep,
    tracker: ReceiverTracker,
    outcome: Option<IngestOutcome>,
    receipt_sent: bool,
}

impl ReceiverContext {
    pub fn next_step(&self) -> &ReceiverStep {
        &self.next
    }

    pub fn tracker(&self) -> &ReceiverTracker {
        &self.tracker
    }

    /// Where the data set was stored, once ingested
    pub fn outcome(&self) -> Option<&IngestOutcome> {
        self.outcome.as_ref()
    }

    pub fn receipt_sent(&self) -> bool {
        self.receipt_sent
    }
}

/// Receiving side of the transfer protocol
#[derive(Debug, Clone)]
pub struct Receiver {
    local_organization: String,
    stream_transfer: bool,
    retry: RetryPolicy,
    intermediary: Arc<dyn DocumentStore>,
    intermediary_base: Option<Url>,
    keys: Arc<KeyStore>,
    ingestor: Ingestor,
    messenger: Arc<dyn Messenger>,
    notifier: Arc<dyn Notifier>,
}

impl Receiver {
    pub fn new(
        config: &TransferConfig,
        keys: Arc<KeyStore>,
        intermediary: Arc<dyn DocumentStore>,
        destination: Arc<dyn DocumentStore>,
        messenger: Arc<dyn Messenger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            local_organization: config.local_organization.clone(),
            stream_transfer: config.stream.read_transfer_binaries,
            retry: config.retry,
            intermediary,
            intermediary_base: config.stores.intermediary.clone(),
            keys,
            ingestor: Ingestor::new(destination),
            messenger,
            notifier,
        }
    }

    /// Begin handling a received `data-send` message
    pub fn accept(&self, message: TaskMessage) -> ReceiverContext {
        let project_identifier = message
            .text_input(PROJECT_IDENTIFIER)
            .map(str::to_string)
            .unwrap_or_default();
        let tracker = ReceiverTracker::new(&project_identifier, &message.requester);
        ReceiverContext {
            message,
            project_identifier,
            next: ReceiverStep::Download,
            tracker,
            outcome: None,
            receipt_sent: false,
        }
    }

    pub async fn drive(&self, ctx: ReceiverContext) -> (ReceiverContext, StepEvent) {
        super::drive(self, ctx).await
    }

    async fn download(
        &self,
        ctx: &mut ReceiverContext,
    ) -> Result<Vec<IncomingAttachment>, TransferError> {
        ctx.message.expect_kind(MessageKind::DataSend)?;
        ctx.message.text_input(PROJECT_IDENTIFIER)?;
        let location = ctx.message.text_input(DOCUMENT_REFERENCE_LOCATION)?.to_string();
        let id = parse_location(&location, DOCUMENT_PREFIX, self.intermediary_base.as_ref())?;

        let document = self.intermediary.read_document(&id).await?;
        if document.project_identifier != ctx.project_identifier
            || document.author != ctx.message.requester
        {
            return Err(PackageError::Shape(
                "transfer descriptor does not belong to this message".into(),
            )
            .into());
        }
        if document.status != DocumentStatus::Final {
            return Err(PackageError::Shape("transfer descriptor is not final".into()).into());
        }

        let mut attachments = Vec::with_capacity(document.attachments.len());
        for attachment in document.attachments {
            let binary_id =
                parse_location(&attachment.location, BINARY_PREFIX, self.intermediary_base.as_ref())?;
            let body = if self.stream_transfer {
                let (_, stream) = self.intermediary.read_binary_stream(&binary_id).await?;
                Body::Stream(stream)
            } else {
                Body::Full(self.intermediary.read_binary(&binary_id).await?.data)
            };
            attachments.push(IncomingAttachment {
                mime_type: attachment.mime_type,
                body,
            });
        }
        if attachments.is_empty() {
            return Err(PackageError::Empty.into());
        }

        tracing::info!(
            project = %ctx.project_identifier,
            sender = %ctx.message.requester,
            attachments = attachments.len(),
            stream = self.stream_transfer,
            "downloaded transfer data"
        );
        Ok(attachments)
    }

    async fn decrypt(
        &self,
        ctx: &mut ReceiverContext,
        attachments: Vec<IncomingAttachment>,
    ) -> Result<Vec<IncomingAttachment>, TransferError> {
        let pair = self.keys.local_key_pair()?;
        let sender = ctx.message.requester.clone();
        let receiver = self.local_organization.as_str();

        let mut decrypted = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let body = match attachment.body {
                Body::Full(envelope) => Body::Full(HybridCipher::decrypt(
                    &pair.private,
                    &envelope,
                    &sender,
                    receiver,
                )?),
                Body::Stream(stream) => Body::Stream(HybridCipher::decrypt_stream(
                    &pair.private,
                    stream,
                    &sender,
                    receiver,
                )),
            };
            if attachment.mime_type == PACKAGE_MIME_TYPE {
                decrypted.extend(self.unpack(ctx, body).await?);
            } else {
                decrypted.push(IncomingAttachment {
                    mime_type: attachment.mime_type,
                    body,
                });
            }
        }
        Ok(decrypted)
    }

    /// Expand a whole-package envelope into its attachments
    async fn unpack(
        &self,
        ctx: &mut ReceiverContext,
        body: Body,
    ) -> Result<Vec<IncomingAttachment>, TransferError> {
        let bytes = body.collect().await?;
        let package = TransferPackage::decode(&bytes, PackageShape::Multi)?;
        if package.project_identifier != ctx.project_identifier
            || package.author != ctx.message.requester
        {
            return Err(PackageError::Shape("package does not belong to this message".into()).into());
        }

        let (_, _, attachments) = package.parse()?;
        attachments
            .into_iter()
            .map(|a| match a.content {
                AttachmentContent::Inline(data) => Ok(IncomingAttachment {
                    mime_type: a.mime_type,
                    body: Body::Full(data),
                }),
                AttachmentContent::Remote(_) => Err(PackageError::Unresolvable(a.id).into()),
            })
            .collect()
    }

    /// Buffered content is checked now, streamed content as it is stored
    fn validate(
        attachments: Vec<IncomingAttachment>,
    ) -> Result<Vec<IncomingAttachment>, TransferError> {
        attachments
            .into_iter()
            .map(|attachment| {
                let body = match attachment.body {
                    Body::Full(data) => {
                        package::validate(&attachment.mime_type, &data)?;
                        Body::Full(data)
                    }
                    Body::Stream(stream) => {
                        Body::Stream(package::validate_stream(&attachment.mime_type, stream)?)
                    }
                };
                Ok(IncomingAttachment {
                    mime_type: attachment.mime_type,
                    body,
                })
            })
            .collect()
    }

    async fn insert(
        &self,
        ctx: &mut ReceiverContext,
        attachments: Vec<IncomingAttachment>,
    ) -> Result<(), TransferError> {
        let outcome = self
            .ingestor
            .ingest_attachments(&ctx.project_identifier, &ctx.message.requester, attachments)
            .await?;
        ctx.outcome = Some(outcome);
        Ok(())
    }

    async fn receipt(&self, ctx: &mut ReceiverContext) {
        if ctx.tracker.state() == ReceiverState::Received {
            self.record(ctx, ReceiverEvent::Succeeded).await;
        }
        if let Some(status) = ctx.tracker.status().cloned() {
            ctx.message.record_status(status);
        }

        let mut receipt = TaskMessage::new(
            MessageKind::DataReceive,
            &self.local_organization,
            &ctx.message.requester,
            ctx.message.business_key,
        );
        if let Some(status) = ctx.tracker.receipt() {
            receipt = receipt.with_input(Parameter::status(status));
        }

        match send_with_retry(self.messenger.as_ref(), &self.retry, &receipt).await {
            Ok(()) => {
                ctx.receipt_sent = true;
                tracing::info!(
                    project = %ctx.project_identifier,
                    sender = %ctx.message.requester,
                    "sent receipt"
                );
            }
            // the sender ends up with receipt-missing
            Err(e) => tracing::warn!(
                project = %ctx.project_identifier,
                sender = %ctx.message.requester,
                "failed to deliver receipt: {}",
                e
            ),
        }
    }

    async fn record(&self, ctx: &mut ReceiverContext, event: ReceiverEvent) {
        match ctx.tracker.apply(event) {
            Ok(outcome) => {
                if let Some(notification) = outcome.notification {
                    self.notifier.notify(&notification).await;
                }
            }
            Err(e) => tracing::error!(project = %ctx.project_identifier, "{}", e),
        }
    }
}

#[async_trait]
impl Pipeline for Receiver {
    type Context = ReceiverContext;

    async fn step(&self, mut ctx: ReceiverContext) -> (ReceiverContext, StepEvent) {
        // attachments not handed on are dropped with the replaced step,
        // which releases any stream they hold
        let step = std::mem::replace(&mut ctx.next, ReceiverStep::Done);
        let name = step.name();
        tracing::debug!(project = %ctx.project_identifier, step = name, "receiver step");

        let result = match step {
            ReceiverStep::Download => self.download(&mut ctx).await.map(ReceiverStep::Decrypt),
            ReceiverStep::Decrypt(attachments) => self
                .decrypt(&mut ctx, attachments)
                .await
                .map(ReceiverStep::Validate),
            ReceiverStep::Validate(attachments) => {
                Self::validate(attachments).map(ReceiverStep::Insert)
            }
            ReceiverStep::Insert(attachments) => self
                .insert(&mut ctx, attachments)
                .await
                .map(|_| ReceiverStep::Receipt),
            ReceiverStep::Receipt => {
                self.receipt(&mut ctx).await;
                return (ctx, StepEvent::Finished);
            }
            ReceiverStep::Done => return (ctx, StepEvent::Finished),
        };

        match result {
            Ok(next) => ctx.next = next,
            Err(e) => {
                tracing::warn!(
                    project = %ctx.project_identifier,
                    sender = %ctx.message.requester,
                    step = name,
                    "receive failed: {}",
                    e
                );
                let diagnostic = e.diagnostic();
                self.record(&mut ctx, ReceiverEvent::Failed { diagnostic })
                    .await;
                ctx.next = ReceiverStep::Receipt;
            }
        }
        (ctx, StepEvent::Continue)
    }
}
