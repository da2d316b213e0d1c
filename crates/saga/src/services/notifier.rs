//! User notification trait and in-memory implementation.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::ChatId;
use serde::{Deserialize, Serialize};

use super::ServiceError;

/// The message sent to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// The SMS code arrived.
    Delivered,
    /// The purchase was refunded.
    Refunded,
    /// A cancel request arrived after the refund had already been made.
    AlreadyRefunded,
}

impl NotificationKind {
    /// Returns the kind as a stable string.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Delivered => "delivered",
            NotificationKind::Refunded => "refunded",
            NotificationKind::AlreadyRefunded => "already_refunded",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for delivering chat messages to users.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a notification to a chat.
    async fn send(&self, chat_id: ChatId, kind: NotificationKind) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryNotifierState {
    sent: Vec<(ChatId, NotificationKind)>,
    fail_on_send: bool,
}

/// In-memory notifier for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<RwLock<InMemoryNotifierState>>,
}

impl InMemoryNotifier {
    /// Creates a new in-memory notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures every send to fail.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.state.write().unwrap().fail_on_send = fail;
    }

    /// Returns every notification sent to a chat, oldest first.
    pub fn sent_to(&self, chat_id: ChatId) -> Vec<NotificationKind> {
        self.state
            .read()
            .unwrap()
            .sent
            .iter()
            .filter(|(chat, _)| *chat == chat_id)
            .map(|(_, kind)| *kind)
            .collect()
    }

    /// Returns the total number of notifications sent.
    pub fn sent_count(&self) -> usize {
        self.state.read().unwrap().sent.len()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, chat_id: ChatId, kind: NotificationKind) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_send {
            return Err(ServiceError::Transient("chat api unavailable".to_string()));
        }

        state.sent.push((chat_id, kind));
        tracing::debug!(%chat_id, %kind, "notification sent");
        Ok(())
    }
}
