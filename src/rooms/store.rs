//! # Room Store
//!
//! The realtime message store behind chat rooms.
//!
//! ## Contract:
//! - `subscribe` calls the listener right away with the current messages of
//!   the room, then again after every change, always with the full list in
//!   insertion order.
//! - `publish` appends a message with a server-assigned id and timestamp.
//! - Dropping the returned [`Subscription`] detaches the listener.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
}

/// A stored chat message, as the browser renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
    /// Epoch milliseconds, assigned by the store
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// A message as submitted by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(default)]
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl NewMessage {
    #[cfg(test)]
    pub fn text(sender_id: &str, sender_name: &str, text: &str) -> Self {
        Self {
            text: text.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            kind: MessageKind::Text,
            image_url: None,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.sender_id.trim().is_empty() {
            return Err(StoreError::InvalidMessage("sender id cannot be empty".to_string()));
        }
        match self.kind {
            MessageKind::Text if self.text.trim().is_empty() => {
                Err(StoreError::InvalidMessage("message text cannot be empty".to_string()))
            }
            MessageKind::Image
                if self.image_url.as_deref().map_or(true, |url| url.trim().is_empty()) =>
            {
                Err(StoreError::InvalidMessage("image messages need an image URL".to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    InvalidRoom(String),
    InvalidMessage(String),
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidRoom(msg) => write!(f, "invalid room: {}", msg),
            StoreError::InvalidMessage(msg) => write!(f, "invalid message: {}", msg),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Called with the full message list of a room.
pub type ChangeListener = Arc<dyn Fn(&[RoomMessage]) + Send + Sync>;

/// A live listener registration. Detaches on drop.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A subscription that was never attached.
    pub fn inert() -> Self {
        Self { detach: None }
    }

    pub fn is_attached(&self) -> bool {
        self.detach.is_some()
    }

    pub fn cancel(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.is_attached())
            .finish()
    }
}

pub trait RoomStore: Send + Sync {
    fn subscribe(&self, room_id: &str, listener: ChangeListener) -> Subscription;

    fn publish(
        &self,
        room_id: &str,
        message: NewMessage,
    ) -> BoxFuture<'static, Result<RoomMessage, StoreError>>;

    /// Change how many messages a room keeps.
    fn set_max_messages_per_room(&self, max: usize);
}

/// Longest wait for the first snapshot of a room.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot read of a room through `subscribe`.
pub async fn fetch_messages(
    store: &dyn RoomStore,
    room_id: &str,
) -> Result<Vec<RoomMessage>, StoreError> {
    if room_id.trim().is_empty() {
        return Err(StoreError::InvalidRoom("room id cannot be empty".to_string()));
    }

    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    let listener: ChangeListener = Arc::new(move |messages: &[RoomMessage]| {
        let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(messages.to_vec());
        }
    });

    let subscription = store.subscribe(room_id, listener);
    let snapshot = tokio::time::timeout(SNAPSHOT_TIMEOUT, rx).await;
    drop(subscription);

    match snapshot {
        Ok(Ok(messages)) => Ok(messages),
        Ok(Err(_)) => Err(StoreError::Unavailable("subscription closed".to_string())),
        Err(_) => Err(StoreError::Unavailable("timed out waiting for room".to_string())),
    }
}
