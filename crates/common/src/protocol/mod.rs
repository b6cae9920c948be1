//! Coordination messages exchanged between the two participants
//!
//! Three message kinds drive a transfer:
//!
//! | kind              | from      | to        | inputs                                                  |
//! |-------------------|-----------|-----------|---------------------------------------------------------|
//! | `data-send-start` | scheduler | sender    | `project-identifier`, `dms-identifier`                  |
//! | `data-send`       | sender    | receiver  | `project-identifier`, `document-reference-location`     |
//! | `data-receive`    | receiver  | sender    | `data-set-status` (receipt code)                        |
//!
//! Outputs record a participant's own view of the transfer, such as the
//! receiver's local `data-set-status`. All messages of one transfer share a
//! business key.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anomaly::{pick_first, AnomalyKind};
use crate::config::RetryPolicy;
use crate::status::{DataSetStatus, StatusCode};
use crate::store::{with_retry, StoreError};

pub use memory::MemoryMessenger;

/// Identifier of the receiving organization
pub const DMS_IDENTIFIER: &str = "dms-identifier";
/// Master identifier of the data set
pub const PROJECT_IDENTIFIER: &str = "project-identifier";
/// Reference to the transferred data set on the intermediary store
pub const DATA_SET_REFERENCE: &str = "data-set-reference";
/// Location of the transfer descriptor on the intermediary store
pub const DOCUMENT_REFERENCE_LOCATION: &str = "document-reference-location";
pub const DATA_SET_STATUS: &str = "data-set-status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    DataSendStart,
    DataSend,
    DataReceive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Status(DataSetStatus),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub code: String,
    pub value: ParameterValue,
}

impl Parameter {
    pub fn text(code: &str, value: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            value: ParameterValue::Text(value.into()),
        }
    }

    pub fn status(status: DataSetStatus) -> Self {
        Self {
            code: DATA_SET_STATUS.to_string(),
            value: ParameterValue::Status(status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message is missing parameter {0}")]
    Missing(&'static str),
    #[error("parameter {0} has an unexpected value type")]
    WrongType(&'static str),
    #[error("expected a {expected:?} message, got {actual:?}")]
    WrongKind {
        expected: MessageKind,
        actual: MessageKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: Uuid,
    pub kind: MessageKind,
    /// Organization that issued the message
    pub requester: String,
    /// Organization the message is addressed to
    pub recipient: String,
    /// Shared by every message of one transfer
    pub business_key: Uuid,
    #[serde(default)]
    pub inputs: Vec<Parameter>,
    #[serde(default)]
    pub outputs: Vec<Parameter>,
}

impl TaskMessage {
    pub fn new(
        kind: MessageKind,
        requester: impl Into<String>,
        recipient: impl Into<String>,
        business_key: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            requester: requester.into(),
            recipient: recipient.into(),
            business_key,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, parameter: Parameter) -> Self {
        self.inputs.push(parameter);
        self
    }

    pub fn expect_kind(&self, expected: MessageKind) -> Result<(), MessageError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(MessageError::WrongKind {
                expected,
                actual: self.kind,
            })
        }
    }

    /// First input with the given code. Repeated codes are logged as an
    /// anomaly and the first one wins.
    pub fn input(&self, code: &'static str) -> Result<&ParameterValue, MessageError> {
        first(&self.inputs, code)
    }

    pub fn text_input(&self, code: &'static str) -> Result<&str, MessageError> {
        match self.input(code)? {
            ParameterValue::Text(text) => Ok(text),
            ParameterValue::Status(_) => Err(MessageError::WrongType(code)),
        }
    }

    pub fn status_input(&self) -> Result<&DataSetStatus, MessageError> {
        match self.input(DATA_SET_STATUS)? {
            ParameterValue::Status(status) => Ok(status),
            ParameterValue::Text(_) => Err(MessageError::WrongType(DATA_SET_STATUS)),
        }
    }

    pub fn status_output(&self) -> Result<&DataSetStatus, MessageError> {
        match first(&self.outputs, DATA_SET_STATUS)? {
            ParameterValue::Status(status) => Ok(status),
            ParameterValue::Text(_) => Err(MessageError::WrongType(DATA_SET_STATUS)),
        }
    }

    /// Record a status as an output of this message
    pub fn record_status(&mut self, status: DataSetStatus) {
        self.outputs.push(Parameter::status(status));
    }

    /// Copy every `data-set-status` input of `other` into this message's
    /// outputs, keeping diagnostics
    pub fn copy_status_inputs_to_outputs(&mut self, other: &TaskMessage) {
        self.outputs.extend(status_parameters(&other.inputs));
    }

    /// Copy every `data-set-status` output of `other` into this message's
    /// inputs, keeping diagnostics
    pub fn copy_status_outputs_to_inputs(&mut self, other: &TaskMessage) {
        self.inputs.extend(status_parameters(&other.outputs));
    }
}

fn first<'a>(
    parameters: &'a [Parameter],
    code: &'static str,
) -> Result<&'a ParameterValue, MessageError> {
    let matches: Vec<&Parameter> = parameters.iter().filter(|p| p.code == code).collect();
    let (parameter, _) = pick_first(matches, AnomalyKind::MessageParameter, code);
    parameter.map(|p| &p.value).ok_or(MessageError::Missing(code))
}

fn status_parameters(parameters: &[Parameter]) -> impl Iterator<Item = Parameter> + '_ {
    parameters
        .iter()
        .filter(|p| p.code == DATA_SET_STATUS && matches!(p.value, ParameterValue::Status(_)))
        .cloned()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("message refused by the recipient: {0}")]
    Forbidden(String),
    #[error("recipient unreachable: {0}")]
    Unreachable(String),
}

impl TransportError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, TransportError::Forbidden(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }

    /// 403 means not allowed, anything else not reachable
    pub fn status_code(&self) -> StatusCode {
        if self.is_forbidden() {
            StatusCode::NotAllowed
        } else {
            StatusCode::NotReachable
        }
    }
}

impl From<StoreError> for TransportError {
    fn from(e: StoreError) -> Self {
        if e.is_forbidden() {
            TransportError::Forbidden(e.to_string())
        } else {
            TransportError::Unreachable(e.to_string())
        }
    }
}

/// Delivers coordination messages to other participants
#[async_trait]
pub trait Messenger: Send + Sync + std::fmt::Debug + 'static {
    async fn send(&self, message: TaskMessage) -> Result<(), TransportError>;
}

/// Send with the transport retry policy. Only unreachable recipients are
/// retried; the last error is terminal.
pub async fn send_with_retry(
    messenger: &dyn Messenger,
    policy: &RetryPolicy,
    message: &TaskMessage,
) -> Result<(), TransportError> {
    let operation = format!("send {:?} to {}", message.kind, message.recipient);
    with_retry(policy, &operation, TransportError::is_retryable, || {
        messenger.send(message.clone())
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn send_message() -> TaskMessage {
        TaskMessage::new(MessageKind::DataSend, "DIC1", "DMS1", Uuid::new_v4())
            .with_input(Parameter::text(PROJECT_IDENTIFIER, "PROJ-7"))
            .with_input(Parameter::text(
                DOCUMENT_REFERENCE_LOCATION,
                "DocumentReference/1",
            ))
    }

    #[test]
    fn test_text_inputs() {
        let message = send_message();
        assert_eq!(message.text_input(PROJECT_IDENTIFIER).unwrap(), "PROJ-7");
        assert_eq!(
            message.text_input(DMS_IDENTIFIER),
            Err(MessageError::Missing(DMS_IDENTIFIER))
        );
        assert_eq!(
            message.status_input(),
            Err(MessageError::Missing(DATA_SET_STATUS))
        );
        assert!(message.expect_kind(MessageKind::DataSend).is_ok());
        assert!(message.expect_kind(MessageKind::DataReceive).is_err());
    }

    #[test]
    fn test_repeated_parameter_uses_first() {
        let message = send_message().with_input(Parameter::text(PROJECT_IDENTIFIER, "PROJ-8"));
        assert_eq!(message.text_input(PROJECT_IDENTIFIER).unwrap(), "PROJ-7");
    }

    #[test]
    fn test_status_copies() {
        let mut received = send_message();
        received.record_status(DataSetStatus::error(StatusCode::ReceiveError, "bad"));
        received.outputs.push(Parameter::text(DATA_SET_STATUS, "not a status"));

        let mut receipt =
            TaskMessage::new(MessageKind::DataReceive, "DMS1", "DIC1", received.business_key);
        receipt.copy_status_outputs_to_inputs(&received);
        assert_eq!(receipt.inputs.len(), 1);
        assert_eq!(
            receipt.status_input().unwrap(),
            &DataSetStatus::error(StatusCode::ReceiveError, "bad")
        );

        let mut start = TaskMessage::new(MessageKind::DataSendStart, "DIC1", "DIC1", received.business_key);
        start.copy_status_inputs_to_outputs(&receipt);
        assert_eq!(start.status_output().unwrap().error.as_deref(), Some("bad"));
    }

    #[test]
    fn test_wire_form() {
        let message = TaskMessage::new(MessageKind::DataReceive, "DMS1", "DIC1", Uuid::new_v4())
            .with_input(Parameter::status(DataSetStatus::ok(StatusCode::ReceiptOk)));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["kind"], "data-receive");
        assert_eq!(json["inputs"][0]["code"], "data-set-status");
        assert_eq!(json["inputs"][0]["value"]["code"], "receipt-ok");

        let parsed: TaskMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_transport_classification() {
        let forbidden = TransportError::from(StoreError::Forbidden("403".into()));
        assert_eq!(forbidden.status_code(), StatusCode::NotAllowed);
        let down = TransportError::from(StoreError::Status(502, "bad gateway".into()));
        assert_eq!(down.status_code(), StatusCode::NotReachable);
    }

    #[tokio::test]
    async fn test_send_with_retry() {
        let messenger = MemoryMessenger::new();
        messenger.fail_next("DMS1", 2);
        let policy = RetryPolicy {
            attempts: 3,
            interval: Duration::from_millis(1),
        };

        send_with_retry(&messenger, &policy, &send_message()).await.unwrap();
        assert_eq!(messenger.take("DMS1").len(), 1);

        messenger.deny("DMS1");
        let result = send_with_retry(&messenger, &policy, &send_message()).await;
        assert!(matches!(result, Err(TransportError::Forbidden(_))));
        assert!(messenger.take("DMS1").is_empty());
    }
}
