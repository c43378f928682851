use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::ConversationId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::info;

use crate::{
    sync::MessageSynchronizer,
    transport::{Subscription, Transport},
};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Emitted when the counterpart acknowledges having viewed a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptUpdate {
    pub conversation_id: ConversationId,
}

/// Watermark of the last emitted seen signal for one conversation.
#[derive(Debug, Clone, Copy)]
struct SeenMark {
    newest_confirmed_at: Option<DateTime<Utc>>,
}

/// Emits seen signals for the actively open conversation and consumes the
/// counterpart's acknowledgements. A seen emission covers every confirmed
/// message up to the emission time; there is no per-message protocol.
pub struct ReceiptTracker {
    transport: Arc<Transport>,
    sync: Arc<MessageSynchronizer>,
    marks: Mutex<HashMap<ConversationId, SeenMark>>,
    updates: broadcast::Sender<ReceiptUpdate>,
    pump: std::sync::Mutex<Option<(Subscription, JoinHandle<()>)>>,
}

impl ReceiptTracker {
    pub fn new(transport: Arc<Transport>, sync: Arc<MessageSynchronizer>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            sync,
            marks: Mutex::new(HashMap::new()),
            updates,
            pump: std::sync::Mutex::new(None),
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ReceiptUpdate> {
        self.updates.subscribe()
    }

    /// Registers the inbound acknowledgement pump.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.pump.lock().expect("pump lock poisoned");
        if guard.is_some() {
            return;
        }
        let (subscription, mut events) = self.transport.subscribe("newSeen");
        let tracker = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ServerEvent::NewSeen { conversation_id } = event {
                    tracker.on_remote_seen(conversation_id).await;
                }
            }
        });
        *guard = Some((subscription, task));
    }

    pub fn shutdown(&self) {
        if let Some((subscription, task)) = self.pump.lock().expect("pump lock poisoned").take() {
            drop(subscription);
            task.abort();
        }
    }

    /// Signals that this user is viewing the conversation. Idempotent:
    /// repeated calls with no newer confirmed message emit nothing further.
    pub async fn mark_seen(&self, conversation_id: ConversationId) {
        let newest = self.sync.latest_confirmed_at(conversation_id).await;
        {
            let mut marks = self.marks.lock().await;
            if let Some(mark) = marks.get(&conversation_id) {
                if mark.newest_confirmed_at == newest {
                    return;
                }
            }
            marks.insert(
                conversation_id,
                SeenMark {
                    newest_confirmed_at: newest,
                },
            );
        }
        info!(conversation_id = conversation_id.0, "emitting seen signal");
        self.transport
            .send(ClientRequest::SeenMessage { conversation_id });
    }

    /// The counterpart viewed the conversation: flip seen flags on the
    /// sequence and notify listeners.
    pub async fn on_remote_seen(&self, conversation_id: ConversationId) {
        self.sync.mark_seen_by_peer(conversation_id).await;
        let _ = self.updates.send(ReceiptUpdate { conversation_id });
    }

    /// Forgets the watermark, e.g. when a conversation is deleted.
    pub async fn forget(&self, conversation_id: ConversationId) {
        self.marks.lock().await.remove(&conversation_id);
    }
}
