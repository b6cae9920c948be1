use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DataSetStatus, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Failure,
}

/// A human-facing message about a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    /// Terminal status code, absent for local aborts
    pub code: Option<StatusCode>,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        severity: Severity,
        code: Option<StatusCode>,
        context: &str,
        diagnostic: Option<&str>,
    ) -> Self {
        let outcome = match severity {
            Severity::Success => "succeeded",
            Severity::Failure => "failed",
        };
        let mut body = match code {
            Some(code) => format!("Data transfer {} {} with status {}", context, outcome, code),
            None => format!("Data transfer {} {} before dispatch", context, outcome),
        };
        if let Some(diagnostic) = diagnostic {
            body.push_str(" - error: ");
            body.push_str(diagnostic);
        }

        Self {
            severity,
            code,
            subject: format!("Data transfer {} {}", context, outcome),
            body,
        }
    }

    pub(crate) fn for_status(context: &str, status: &DataSetStatus) -> Self {
        let severity = if status.code.is_failure() {
            Severity::Failure
        } else {
            Severity::Success
        };
        Self::new(severity, Some(status.code), context, status.error.as_deref())
    }
}

/// Delivers operator notifications (e-mail or similar)
#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug + 'static {
    async fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) {
        match notification.severity {
            Severity::Success => tracing::info!(subject = %notification.subject, "{}", notification.body),
            Severity::Failure => tracing::warn!(subject = %notification.subject, "{}", notification.body),
        }
    }
}

/// Keeps every notification in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) {
        self.sent.lock().push(notification.clone());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_failure_body_carries_code_and_diagnostic() {
        let status = DataSetStatus::error(StatusCode::ReceiptError, "validation failed");
        let notification = Notification::for_status("PROJ-7 to DMS1", &status);
        assert_eq!(notification.severity, Severity::Failure);
        assert_eq!(notification.subject, "Data transfer PROJ-7 to DMS1 failed");
        assert_eq!(
            notification.body,
            "Data transfer PROJ-7 to DMS1 failed with status receipt-error - error: validation failed"
        );
    }

    #[tokio::test]
    async fn test_memory_notifier() {
        let notifier = MemoryNotifier::new();
        let status = DataSetStatus::ok(StatusCode::ReceiveOk);
        notifier
            .notify(&Notification::for_status("PROJ-7 from DIC1", &status))
            .await;
        let sent = notifier.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Success);
        assert_eq!(sent[0].code, Some(StatusCode::ReceiveOk));
    }
}
