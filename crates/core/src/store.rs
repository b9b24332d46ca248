use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::message::{ChatMessage, MessageId, MessagePatch};

/// Immutable view of the conversation handed to observers.
pub type ConversationSnapshot = Arc<[ChatMessage]>;

/// Ordered, append-only conversation log with one mutable tail.
///
/// The log is the only shared mutable state in the system. All mutation goes
/// through [`append`](Self::append) and [`update`](Self::update); readers get
/// cloned snapshots and a watch subscription, never access to the live
/// sequence. Insertion order is the only ordering, used both for rendering
/// and for building outbound history.
pub struct ConversationStore {
    messages: RwLock<Vec<ChatMessage>>,
    next_message_id: AtomicU64,
    snapshot_tx: watch::Sender<ConversationSnapshot>,
}

impl ConversationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(ConversationSnapshot::from(Vec::new()));
        Self {
            messages: RwLock::new(Vec::new()),
            next_message_id: AtomicU64::new(1),
            snapshot_tx,
        }
    }

    /// Allocates the next message identifier.
    pub fn alloc_message_id(&self) -> MessageId {
        MessageId::new(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Appends a record at the tail and publishes a fresh snapshot.
    pub fn append(&self, message: ChatMessage) {
        let mut messages = self.messages.write().expect("conversation lock poisoned");

        if message.streaming
            && let Some(open) = messages.iter().find(|existing| existing.streaming)
        {
            // The submit gate serializes exchanges; a second open tail means
            // a caller bypassed it. Tolerated, but worth surfacing.
            tracing::warn!(
                open_id = open.id.0,
                appended_id = message.id.0,
                "appending a streaming record while another is still open"
            );
        }

        messages.push(message);
        self.publish(&messages);
    }

    /// Merge-patches the record with the matching id.
    ///
    /// An unknown id is a silent no-op: the only mid-stream writer targets a
    /// single id, so a miss is a stale update, not an error.
    pub fn update(&self, id: MessageId, patch: MessagePatch) {
        let mut messages = self.messages.write().expect("conversation lock poisoned");

        let Some(message) = messages.iter_mut().find(|message| message.id == id) else {
            tracing::debug!(message_id = id.0, "ignoring update for unknown message id");
            return;
        };

        patch.apply(message);
        self.publish(&messages);
    }

    /// Returns the current snapshot. Callers must not assume it tracks later
    /// mutations; it is an immutable point-in-time copy.
    pub fn messages(&self) -> ConversationSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribes to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Returns the id of the in-flight record, if one is open.
    pub fn streaming_message_id(&self) -> Option<MessageId> {
        self.messages
            .read()
            .expect("conversation lock poisoned")
            .iter()
            .find(|message| message.streaming)
            .map(|message| message.id)
    }

    pub fn len(&self) -> usize {
        self.messages
            .read()
            .expect("conversation lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, messages: &[ChatMessage]) {
        // Called under the write lock so observers see snapshots in mutation
        // order.
        let _ = self
            .snapshot_tx
            .send_replace(ConversationSnapshot::from(messages.to_vec()));
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
