//! In-process [`RoomStore`]: per-room history plus listeners.
//!
//! Every change bumps the room's version. Listeners are called outside the
//! store lock, one delivery at a time per listener, and a snapshot older than
//! the last one a listener received is skipped. A listener that publishes from
//! inside its callback gets the newer snapshot once the callback returns.

use crate::rooms::store::{
    ChangeListener, NewMessage, RoomMessage, RoomStore, StoreError, Subscription,
};
use futures_util::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::debug;
use uuid::Uuid;

type Snapshot = Arc<Vec<RoomMessage>>;

/// One listener plus its delivery bookkeeping.
struct Delivery {
    listener: ChangeListener,
    state: Mutex<DeliveryState>,
}

#[derive(Default)]
struct DeliveryState {
    /// Newest version accepted for this listener
    latest: Option<u64>,
    pending: Option<Snapshot>,
    delivering: bool,
}

impl Delivery {
    fn new(listener: ChangeListener) -> Self {
        Self {
            listener,
            state: Mutex::new(DeliveryState::default()),
        }
    }

    /// Hand a snapshot to the listener unless a newer one already went out.
    ///
    /// If another delivery is in progress (another thread, or the listener
    /// itself publishing), the snapshot is parked and the active deliverer
    /// sends it when the current callback returns.
    fn offer(&self, version: u64, snapshot: Snapshot) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.latest.map_or(false, |latest| version <= latest) {
            return;
        }
        state.latest = Some(version);
        state.pending = Some(snapshot);
        if state.delivering {
            return;
        }

        state.delivering = true;
        loop {
            let Some(snapshot) = state.pending.take() else {
                state.delivering = false;
                return;
            };
            drop(state);
            (self.listener)(&snapshot);
            state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Default)]
struct RoomState {
    messages: VecDeque<RoomMessage>,
    listeners: BTreeMap<u64, Arc<Delivery>>,
    version: u64,
}

impl RoomState {
    fn snapshot(&self) -> Snapshot {
        Arc::new(self.messages.iter().cloned().collect())
    }

    fn is_unused(&self) -> bool {
        self.messages.is_empty() && self.listeners.is_empty()
    }
}

#[derive(Default)]
struct Rooms {
    rooms: HashMap<String, RoomState>,
    next_listener: u64,
}

#[derive(Clone)]
pub struct InMemoryRoomStore {
    inner: Arc<RwLock<Rooms>>,
    max_messages_per_room: Arc<AtomicUsize>,
}

impl InMemoryRoomStore {
    pub fn new(max_messages_per_room: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Rooms::default())),
            max_messages_per_room: Arc::new(AtomicUsize::new(max_messages_per_room.max(1))),
        }
    }

    fn append(&self, room_id: &str, message: NewMessage) -> Result<RoomMessage, StoreError> {
        if room_id.trim().is_empty() {
            return Err(StoreError::InvalidRoom("room id cannot be empty".to_string()));
        }
        message.validate()?;

        let stored = RoomMessage {
            id: Uuid::new_v4().to_string(),
            text: message.text,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind: message.kind,
            image_url: message.image_url,
        };
        let max_messages = self.max_messages_per_room.load(Ordering::Relaxed);

        let (version, snapshot, listeners) = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let room = inner.rooms.entry(room_id.to_string()).or_default();
            room.messages.push_back(stored.clone());
            while room.messages.len() > max_messages {
                room.messages.pop_front();
            }
            room.version += 1;
            let listeners: Vec<Arc<Delivery>> = room.listeners.values().cloned().collect();
            (room.version, room.snapshot(), listeners)
        };

        for delivery in listeners {
            delivery.offer(version, snapshot.clone());
        }

        debug!(room = %room_id, message_id = %stored.id, version, "Message published");
        Ok(stored)
    }
}

impl RoomStore for InMemoryRoomStore {
    fn subscribe(&self, room_id: &str, listener: ChangeListener) -> Subscription {
        if room_id.trim().is_empty() {
            return Subscription::inert();
        }

        let delivery = Arc::new(Delivery::new(listener));
        let (id, version, snapshot) = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let id = inner.next_listener;
            inner.next_listener += 1;
            let room = inner.rooms.entry(room_id.to_string()).or_default();
            room.listeners.insert(id, delivery.clone());
            (id, room.version, room.snapshot())
        };

        delivery.offer(version, snapshot);

        let weak: Weak<RwLock<Rooms>> = Arc::downgrade(&self.inner);
        let room_id = room_id.to_string();
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.write().unwrap_or_else(PoisonError::into_inner);
                let unused = match inner.rooms.get_mut(&room_id) {
                    Some(room) => {
                        room.listeners.remove(&id);
                        room.is_unused()
                    }
                    None => false,
                };
                if unused {
                    inner.rooms.remove(&room_id);
                }
            }
        })
    }

    fn publish(
        &self,
        room_id: &str,
        message: NewMessage,
    ) -> BoxFuture<'static, Result<RoomMessage, StoreError>> {
        let result = self.append(room_id, message);
        Box::pin(futures_util::future::ready(result))
    }

    /// Applies from the next publish on; longer rooms shrink then.
    fn set_max_messages_per_room(&self, max: usize) {
        self.max_messages_per_room.store(max.max(1), Ordering::Relaxed);
    }
}

#[cfg(test)]
impl InMemoryRoomStore {
    pub fn room_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rooms
            .len()
    }

    pub fn listener_count(&self, room_id: &str) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rooms
            .get(room_id)
            .map_or(0, |room| room.listeners.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::store::fetch_messages;
    use std::sync::Mutex;

    fn recorder() -> (ChangeListener, Arc<Mutex<Vec<Vec<String>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: ChangeListener = Arc::new(move |messages: &[RoomMessage]| {
            sink.lock()
                .unwrap()
                .push(messages.iter().map(|m| m.text.clone()).collect());
        });
        (listener, seen)
    }

    #[tokio::test]
    async fn test_subscribe_sees_current_then_every_change() {
        let store = InMemoryRoomStore::new(100);
        store.publish("lobby", NewMessage::text("u1", "V", "first")).await.unwrap();

        let (listener, seen) = recorder();
        let _subscription = store.subscribe("lobby", listener);
        store.publish("lobby", NewMessage::text("u2", "Judy", "second")).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], vec!["first"]);
        assert_eq!(seen[1], vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_updates() {
        let store = InMemoryRoomStore::new(100);
        let (listener, seen) = recorder();

        let subscription = store.subscribe("lobby", listener);
        assert_eq!(store.listener_count("lobby"), 1);
        drop(subscription);
        assert_eq!(store.listener_count("lobby"), 0);

        store.publish("lobby", NewMessage::text("u1", "V", "hello")).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let store = InMemoryRoomStore::new(100);
        let (listener, seen) = recorder();
        let _subscription = store.subscribe("afterlife", listener);

        store.publish("lobby", NewMessage::text("u1", "V", "hello")).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(fetch_messages(&store, "afterlife").await.unwrap().is_empty());
        assert_eq!(fetch_messages(&store, "lobby").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_input() {
        let store = InMemoryRoomStore::new(100);

        let err = store.publish("", NewMessage::text("u1", "V", "hi")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRoom(_)));

        let err = store.publish("lobby", NewMessage::text("u1", "V", "")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidMessage(_)));
        assert!(fetch_messages(&store, "lobby").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oldest_messages_evicted() {
        let store = InMemoryRoomStore::new(2);
        for text in ["one", "two", "three"] {
            store.publish("lobby", NewMessage::text("u1", "V", text)).await.unwrap();
        }

        let texts: Vec<String> = fetch_messages(&store, "lobby")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_server_assigns_id_and_timestamp() {
        let store = InMemoryRoomStore::new(10);
        let before = chrono::Utc::now().timestamp_millis();

        let a = store.publish("lobby", NewMessage::text("u1", "V", "a")).await.unwrap();
        let b = store.publish("lobby", NewMessage::text("u1", "V", "b")).await.unwrap();

        assert_ne!(a.id, b.id);
        assert!(a.timestamp >= before);
        assert!(b.timestamp >= a.timestamp);
    }

    #[test]
    fn test_empty_room_subscription_is_inert() {
        let store = InMemoryRoomStore::new(10);
        let (listener, seen) = recorder();

        let subscription = store.subscribe("", listener);

        assert!(!subscription.is_attached());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(store.room_count(), 0);
    }

    #[tokio::test]
    async fn test_limit_change_applies_to_next_publish() {
        let store = InMemoryRoomStore::new(100);
        store.set_max_messages_per_room(1);

        for text in ["one", "two", "three"] {
            store.publish("lobby", NewMessage::text("u1", "V", text)).await.unwrap();
        }

        let messages = fetch_messages(&store, "lobby").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "three");
    }

    #[test]
    fn test_listener_publishing_from_callback_sees_latest_last() {
        let store = InMemoryRoomStore::new(100);
        let replier = store.clone();
        let replied = Arc::new(Mutex::new(false));
        let replying: ChangeListener = Arc::new(move |messages: &[RoomMessage]| {
            let mut replied = replied.lock().unwrap();
            if messages.len() == 1 && !*replied {
                *replied = true;
                drop(replied);
                let _ = replier.publish("lobby", NewMessage::text("bot", "Bot", "reply"));
            }
        });
        let _replying = store.subscribe("lobby", replying);
        let (listener, seen) = recorder();
        let _watching = store.subscribe("lobby", listener);

        futures_util::FutureExt::now_or_never(
            store.publish("lobby", NewMessage::text("u1", "V", "hello")),
        )
        .unwrap()
        .unwrap();

        let seen = seen.lock().unwrap();
        let sizes: Vec<usize> = seen.iter().map(|texts| texts.len()).collect();
        assert_eq!(sizes, vec![0, 2]);
        assert_eq!(seen.last().unwrap(), &vec!["hello", "reply"]);
    }

    #[test]
    fn test_concurrent_publishers_leave_listeners_current() {
        let store = InMemoryRoomStore::new(1000);
        let (listener, seen) = recorder();
        let _subscription = store.subscribe("lobby", listener);

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let text = format!("{}-{}", worker, i);
                        let _ = store.publish("lobby", NewMessage::text("u1", "V", &text));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        let sizes: Vec<usize> = seen.iter().map(|texts| texts.len()).collect();
        assert!(sizes.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(*sizes.last().unwrap(), 100);
    }

    #[test]
    fn test_detaching_last_listener_forgets_empty_room() {
        let store = InMemoryRoomStore::new(10);
        let (listener, _seen) = recorder();

        let subscription = store.subscribe("nobody-here", listener);
        assert_eq!(store.room_count(), 1);
        drop(subscription);

        assert_eq!(store.room_count(), 0);
    }
}
