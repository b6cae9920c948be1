use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Messenger, TaskMessage, TransportError};

/// In-process messenger with one inbox per organization
#[derive(Debug, Clone, Default)]
pub struct MemoryMessenger {
    inner: Arc<Mutex<MemoryMessengerInner>>,
}

#[derive(Debug, Default)]
struct MemoryMessengerInner {
    inboxes: HashMap<String, VecDeque<TaskMessage>>,
    /// Recipients that refuse every message
    denied: HashSet<String>,
    /// Recipients that are unreachable for the next n sends
    failures: HashMap<String, usize>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every message to `recipient`, as a 403 would
    pub fn deny(&self, recipient: &str) {
        self.inner.lock().denied.insert(recipient.to_string());
    }

    /// Make `recipient` unreachable for the next `count` sends
    pub fn fail_next(&self, recipient: &str, count: usize) {
        self.inner
            .lock()
            .failures
            .insert(recipient.to_string(), count);
    }

    /// Drain the inbox of `recipient`
    pub fn take(&self, recipient: &str) -> Vec<TaskMessage> {
        self.inner
            .lock()
            .inboxes
            .remove(recipient)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn pending(&self, recipient: &str) -> usize {
        self.inner
            .lock()
            .inboxes
            .get(recipient)
            .map(|inbox| inbox.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn send(&self, message: TaskMessage) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.denied.contains(&message.recipient) {
            return Err(TransportError::Forbidden(format!(
                "{} refused the message",
                message.recipient
            )));
        }
        if let Some(remaining) = inner.failures.get_mut(&message.recipient) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Unreachable(format!(
                    "{} did not answer",
                    message.recipient
                )));
            }
        }

        tracing::debug!(
            kind = ?message.kind,
            requester = %message.requester,
            recipient = %message.recipient,
            "delivered message"
        );
        inner
            .inboxes
            .entry(message.recipient.clone())
            .or_default()
            .push_back(message);
        Ok(())
    }
}
