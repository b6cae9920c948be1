//! Transfer status codes and the acknowledgment state machines
//!
//! Every transfer ends in exactly one terminal state. The receiver records
//! `receive-ok` or `receive-error` locally and echoes the fixed receipt code
//! (`receipt-ok` / `receipt-error`) back to the sender together with an
//! opaque diagnostic. The sender turns that receipt, a transport failure, or
//! the scheduler giving up into its own terminal state.
//!
//! Trackers never retry. They only classify the final outcome of an attempt
//! and tell the caller which operator notification to emit.

mod notify;
mod tracker;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use notify::{LogNotifier, MemoryNotifier, Notification, Notifier, Severity};
pub use tracker::{
    Outcome, ReceiverEvent, ReceiverState, ReceiverTracker, SenderEvent, SenderState,
    SenderTracker, TransitionError,
};

/// Closed set of status codes exchanged between participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    /// The counterpart refused the request (HTTP 403)
    NotAllowed,
    /// The counterpart could not be reached after all retries
    NotReachable,
    ReceiveOk,
    ReceiveError,
    ReceiptOk,
    ReceiptError,
    /// No receipt arrived before the scheduler completed the transfer
    ReceiptMissing,
}

impl StatusCode {
    pub const ALL: [StatusCode; 7] = [
        StatusCode::NotAllowed,
        StatusCode::NotReachable,
        StatusCode::ReceiveOk,
        StatusCode::ReceiveError,
        StatusCode::ReceiptOk,
        StatusCode::ReceiptError,
        StatusCode::ReceiptMissing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::NotAllowed => "not-allowed",
            StatusCode::NotReachable => "not-reachable",
            StatusCode::ReceiveOk => "receive-ok",
            StatusCode::ReceiveError => "receive-error",
            StatusCode::ReceiptOk => "receipt-ok",
            StatusCode::ReceiptError => "receipt-error",
            StatusCode::ReceiptMissing => "receipt-missing",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, StatusCode::ReceiveOk | StatusCode::ReceiptOk)
    }

    /// The code echoed to the sender for a receiver-side outcome
    pub fn as_receipt(&self) -> Option<StatusCode> {
        match self {
            StatusCode::ReceiveOk | StatusCode::ReceiptOk => Some(StatusCode::ReceiptOk),
            StatusCode::ReceiveError | StatusCode::ReceiptError => Some(StatusCode::ReceiptError),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status code: {0}")]
pub struct UnknownStatusCode(pub String);

impl FromStr for StatusCode {
    type Err = UnknownStatusCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StatusCode::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownStatusCode(s.to_string()))
    }
}

/// Value of a `data-set-status` parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetStatus {
    pub code: StatusCode,
    /// Diagnostic for human operators, never interpreted by machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataSetStatus {
    pub fn ok(code: StatusCode) -> Self {
        Self { code, error: None }
    }

    pub fn error(code: StatusCode, diagnostic: impl Into<String>) -> Self {
        Self {
            code,
            error: Some(diagnostic.into()),
        }
    }

    /// The receipt the receiver sends back for this local status. Only the
    /// fixed code and the diagnostic text cross the boundary.
    pub fn to_receipt(&self) -> Option<DataSetStatus> {
        self.code.as_receipt().map(|code| DataSetStatus {
            code,
            error: self.error.clone(),
        })
    }
}

impl fmt::Display for DataSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "{} - error: {}", self.code, error),
            None => write!(f, "{}", self.code),
        }
    }
}
