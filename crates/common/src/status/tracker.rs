use super::{DataSetStatus, Notification, Severity, StatusCode};

#[derive(Debug, thiserror::Error)]
#[error("invalid transition: {event} in state {state}")]
pub struct TransitionError {
    pub state: String,
    pub event: String,
}

impl TransitionError {
    fn new(state: impl std::fmt::Debug, event: &str) -> Self {
        Self {
            state: format!("{:?}", state),
            event: event.to_string(),
        }
    }
}

/// Result of a successful transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<S> {
    pub state: S,
    /// Operator notification to emit, set when a terminal state is entered
    pub notification: Option<Notification>,
}

/// Sender-side transfer states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Pending,
    Sent,
    AwaitingReceipt,
    NotAllowed,
    NotReachable,
    ReceiptOk,
    ReceiptError,
    ReceiptMissing,
    /// A local failure ended the transfer before anything was dispatched
    Aborted,
}

impl SenderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            SenderState::Pending | SenderState::Sent | SenderState::AwaitingReceipt
        )
    }

    /// Status code of a terminal state
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            SenderState::NotAllowed => Some(StatusCode::NotAllowed),
            SenderState::NotReachable => Some(StatusCode::NotReachable),
            SenderState::ReceiptOk => Some(StatusCode::ReceiptOk),
            SenderState::ReceiptError => Some(StatusCode::ReceiptError),
            SenderState::ReceiptMissing => Some(StatusCode::ReceiptMissing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    /// The data-send message is being handed to the transport
    Dispatched,
    /// The transport accepted the message
    Delivered,
    /// The transport gave up, after its own retries
    TransportFailed { forbidden: bool, diagnostic: String },
    /// A local failure before dispatch
    Aborted { diagnostic: String },
    /// The receiver's acknowledgment
    Receipt(DataSetStatus),
    /// The scheduler completed or timed out the transfer
    SchedulerCompleted,
}

impl SenderEvent {
    fn name(&self) -> &'static str {
        match self {
            SenderEvent::Dispatched => "dispatched",
            SenderEvent::Delivered => "delivered",
            SenderEvent::TransportFailed { .. } => "transport-failed",
            SenderEvent::Aborted { .. } => "aborted",
            SenderEvent::Receipt(_) => "receipt",
            SenderEvent::SchedulerCompleted => "scheduler-completed",
        }
    }
}

/// Tracks one transfer from the sender's point of view
#[derive(Debug, Clone)]
pub struct SenderTracker {
    context: String,
    state: SenderState,
    status: Option<DataSetStatus>,
}

impl SenderTracker {
    pub fn new(project_identifier: &str, recipient: &str) -> Self {
        Self {
            context: format!("{} to {}", project_identifier, recipient),
            state: SenderState::Pending,
            status: None,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Terminal status, with diagnostic if one was reported
    pub fn status(&self) -> Option<&DataSetStatus> {
        self.status.as_ref()
    }

    pub fn apply(&mut self, event: SenderEvent) -> Result<Outcome<SenderState>, TransitionError> {
        use SenderState::*;

        let name = event.name();
        let status = match (self.state, event) {
            (Pending, SenderEvent::Dispatched) => {
                self.state = Sent;
                None
            }
            (Sent, SenderEvent::Delivered) => {
                self.state = AwaitingReceipt;
                None
            }
            (Pending | Sent, SenderEvent::TransportFailed { forbidden, diagnostic }) => {
                let code = if forbidden {
                    StatusCode::NotAllowed
                } else {
                    StatusCode::NotReachable
                };
                self.state = if forbidden { NotAllowed } else { NotReachable };
                Some(DataSetStatus::error(code, diagnostic))
            }
            (Pending, SenderEvent::Aborted { diagnostic }) => {
                self.state = Aborted;
                let notification = Notification::new(
                    Severity::Failure,
                    None,
                    &self.context,
                    Some(diagnostic.as_str()),
                );
                return Ok(Outcome {
                    state: self.state,
                    notification: Some(notification),
                });
            }
            (AwaitingReceipt, SenderEvent::Receipt(receipt)) => {
                let status = match receipt.code.as_receipt() {
                    Some(code) => DataSetStatus {
                        code,
                        error: receipt.error,
                    },
                    None => DataSetStatus::error(
                        StatusCode::ReceiptError,
                        format!("unexpected receipt code {}", receipt),
                    ),
                };
                self.state = if status.code == StatusCode::ReceiptOk {
                    ReceiptOk
                } else {
                    ReceiptError
                };
                Some(status)
            }
            (AwaitingReceipt, SenderEvent::SchedulerCompleted) => {
                self.state = ReceiptMissing;
                Some(DataSetStatus::error(
                    StatusCode::ReceiptMissing,
                    "no receipt received before the transfer completed",
                ))
            }
            // a completed transfer ignores the scheduler's completion
            (state, SenderEvent::SchedulerCompleted) if state.is_terminal() => None,
            (state, _) => return Err(TransitionError::new(state, name)),
        };

        tracing::debug!(context = %self.context, state = ?self.state, "sender transition");
        let notification = status.as_ref().map(|s| Notification::for_status(&self.context, s));
        if status.is_some() {
            self.status = status;
        }
        Ok(Outcome {
            state: self.state,
            notification,
        })
    }
}

/// Receiver-side transfer states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Received,
    ReceiveOk,
    ReceiveError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// The data set was decrypted, validated and stored
    Succeeded,
    /// Decryption, validation or storage failed
    Failed { diagnostic: String },
}

/// Tracks one received transfer
#[derive(Debug, Clone)]
pub struct ReceiverTracker {
    context: String,
    state: ReceiverState,
    status: Option<DataSetStatus>,
}

impl ReceiverTracker {
    pub fn new(project_identifier: &str, sender: &str) -> Self {
        Self {
            context: format!("{} from {}", project_identifier, sender),
            state: ReceiverState::Received,
            status: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Local status, `receive-ok` or `receive-error`
    pub fn status(&self) -> Option<&DataSetStatus> {
        self.status.as_ref()
    }

    /// Status to echo back to the sender
    pub fn receipt(&self) -> Option<DataSetStatus> {
        self.status.as_ref().and_then(|s| s.to_receipt())
    }

    pub fn apply(
        &mut self,
        event: ReceiverEvent,
    ) -> Result<Outcome<ReceiverState>, TransitionError> {
        let status = match (self.state, event) {
            (ReceiverState::Received, ReceiverEvent::Succeeded) => {
                self.state = ReceiverState::ReceiveOk;
                DataSetStatus::ok(StatusCode::ReceiveOk)
            }
            (ReceiverState::Received, ReceiverEvent::Failed { diagnostic }) => {
                self.state = ReceiverState::ReceiveError;
                DataSetStatus::error(StatusCode::ReceiveError, diagnostic)
            }
            (state, ReceiverEvent::Succeeded) => {
                return Err(TransitionError::new(state, "succeeded"))
            }
            (state, ReceiverEvent::Failed { .. }) => {
                return Err(TransitionError::new(state, "failed"))
            }
        };

        let notification = Notification::for_status(&self.context, &status);
        self.status = Some(status);
        Ok(Outcome {
            state: self.state,
            notification: Some(notification),
        })
    }
}
