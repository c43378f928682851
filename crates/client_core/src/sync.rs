use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::{
    domain::{AttachmentRef, ConversationId, MessageId, UserId},
    protocol::{ClientRequest, MessagePayload, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    history::{FetchError, MessageHistory, SortOrder},
    transport::{Subscription, Transport, TransportStatus},
};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Optimistic,
    Confirmed,
}

/// Identity of a message slot: server-assigned once acknowledged, a local
/// temporary id before. Local ids never leave this process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKey {
    Server(MessageId),
    Local(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub attachments: Vec<AttachmentRef>,
    pub sent_at: DateTime<Utc>,
    pub seen: bool,
    pub provenance: Provenance,
    pub failed: bool,
}

impl Message {
    fn confirmed(payload: &MessagePayload) -> Self {
        Self {
            key: MessageKey::Server(payload.id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            body: payload.message.clone(),
            attachments: payload
                .attachments
                .iter()
                .map(AttachmentRef::from_path)
                .collect(),
            sent_at: payload.time,
            seen: false,
            provenance: Provenance::Confirmed,
            failed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationPhase {
    #[default]
    Uninitialized,
    Loading,
    Ready,
}

/// Per-conversation reconciliation state. The message sequence is owned
/// exclusively here; every mutation goes through the synchronizer's
/// operations.
#[derive(Debug, Default)]
struct ConversationState {
    phase: ConversationPhase,
    history_error: bool,
    fetch_generation: u64,
    messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq)]
enum MergeOutcome {
    Appended(Message),
    Confirmed(Message),
    Duplicate,
}

/// Keeps the visible sequence totally ordered by `(timestamp, identifier)`.
/// Server-keyed entries sort before local ones on a timestamp tie, so a
/// confirmed message and a straggling optimistic one keep a stable order.
fn sort_sequence(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.key.cmp(&b.key)));
}

fn contains_server_id(state: &ConversationState, id: MessageId) -> bool {
    state
        .messages
        .iter()
        .any(|message| message.key == MessageKey::Server(id))
}

/// The core deduplication rule. A confirmed payload replaces a pending
/// optimistic message with the same sender and body whose timestamp lies
/// within the tolerance window; otherwise it is appended, unless its server
/// identifier is already present.
fn reconcile_payload(
    state: &mut ConversationState,
    payload: &MessagePayload,
    tolerance: ChronoDuration,
) -> MergeOutcome {
    if contains_server_id(state, payload.id) {
        return MergeOutcome::Duplicate;
    }

    let slot = state.messages.iter_mut().find(|message| {
        message.provenance == Provenance::Optimistic
            && message.sender_id == payload.sender_id
            && message.body == payload.message
            && (message.sent_at - payload.time).abs() <= tolerance
    });

    if let Some(message) = slot {
        message.key = MessageKey::Server(payload.id);
        message.provenance = Provenance::Confirmed;
        message.sent_at = payload.time;
        message.failed = false;
        message.attachments = payload
            .attachments
            .iter()
            .map(AttachmentRef::from_path)
            .collect();
        let confirmed = message.clone();
        sort_sequence(&mut state.messages);
        return MergeOutcome::Confirmed(confirmed);
    }

    let appended = Message::confirmed(payload);
    state.messages.push(appended.clone());
    sort_sequence(&mut state.messages);
    MergeOutcome::Appended(appended)
}

/// Notifications emitted as the per-conversation sequences change.
#[derive(Debug, Clone)]
pub enum SyncUpdate {
    MessageAppended { message: Message },
    MessageConfirmed { message: Message },
    MessageFailed {
        conversation_id: ConversationId,
        key: MessageKey,
    },
    HistoryLoaded { conversation_id: ConversationId },
    HistoryFailed { conversation_id: ConversationId },
}

/// The reconciliation core: merges live channel events, history pages, and
/// locally created optimistic messages into one ordered, deduplicated
/// sequence per conversation.
pub struct MessageSynchronizer {
    transport: Arc<Transport>,
    history: Arc<dyn MessageHistory>,
    self_id: UserId,
    tolerance: ChronoDuration,
    conversations: Mutex<HashMap<ConversationId, ConversationState>>,
    updates: broadcast::Sender<SyncUpdate>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    subscriptions: std::sync::Mutex<Vec<Subscription>>,
}

impl MessageSynchronizer {
    pub fn new(
        transport: Arc<Transport>,
        history: Arc<dyn MessageHistory>,
        self_id: UserId,
        tolerance: ChronoDuration,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            history,
            self_id,
            tolerance,
            conversations: Mutex::new(HashMap::new()),
            updates,
            tasks: std::sync::Mutex::new(Vec::new()),
            subscriptions: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    /// Registers the live-event and lifecycle pumps. Call once after the
    /// transport exists; teardown with [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        let (subscription, mut inbound) = self.transport.subscribe("newMessage");
        let sync = Arc::clone(self);
        let inbound_task = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if let ServerEvent::NewMessage { message } = event {
                    sync.on_inbound_message(message).await;
                }
            }
        });

        let mut status = self.transport.subscribe_status();
        let sync = Arc::clone(self);
        let status_task = tokio::spawn(async move {
            let mut was_connected = false;
            while let Ok(change) = status.recv().await {
                match change {
                    TransportStatus::Connected => {
                        if was_connected {
                            sync.reconcile_all_after_reconnect().await;
                        }
                        was_connected = true;
                    }
                    TransportStatus::Disconnected => {}
                    TransportStatus::SendExpired(ClientRequest::SendMessage {
                        conversation_id,
                        message,
                        ..
                    }) => {
                        sync.mark_send_failed(conversation_id, &message).await;
                    }
                    TransportStatus::SendExpired(_) => {}
                }
            }
        });

        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .push(subscription);
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks.push(inbound_task);
        tasks.push(status_task);
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
            task.abort();
        }
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .clear();
    }

    /// Loads the most recent history page and merges it into the sequence.
    /// On failure the conversation stays usable for live events, flagged so
    /// the caller can offer a retry.
    pub async fn load_history(&self, conversation_id: ConversationId) -> Result<(), FetchError> {
        self.load_history_page(conversation_id, 1).await
    }

    pub async fn load_history_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
    ) -> Result<(), FetchError> {
        let generation = self.begin_history_fetch(conversation_id).await;
        let result = self
            .history
            .fetch_messages(conversation_id, page, SortOrder::NewestFirst, None)
            .await;
        self.apply_history_result(conversation_id, generation, result)
            .await
    }

    /// Recovers events missed while disconnected: the live channel cannot
    /// replay history, so the latest page is re-fetched and unioned with the
    /// in-memory sequence.
    pub async fn reconcile_after_reconnect(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), FetchError> {
        info!(conversation_id = conversation_id.0, "reconciling after reconnect");
        self.load_history(conversation_id).await
    }

    /// Inserts an optimistic message and dispatches the send, returning the
    /// inserted message immediately. Never waits for acknowledgement; the
    /// transport queues the frame while the channel is down.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        body: impl Into<String>,
        attachments: Vec<AttachmentRef>,
    ) -> Message {
        let body = body.into();
        let message = Message {
            key: MessageKey::Local(Uuid::new_v4().to_string()),
            conversation_id,
            sender_id: self.self_id,
            body: body.clone(),
            attachments: attachments.clone(),
            sent_at: Utc::now(),
            seen: false,
            provenance: Provenance::Optimistic,
            failed: false,
        };

        {
            let mut conversations = self.conversations.lock().await;
            let state = conversations.entry(conversation_id).or_default();
            state.messages.push(message.clone());
            sort_sequence(&mut state.messages);
        }
        let _ = self.updates.send(SyncUpdate::MessageAppended {
            message: message.clone(),
        });

        self.transport.send(ClientRequest::SendMessage {
            conversation_id,
            message: body,
            attachments: attachments.into_iter().map(|a| a.path).collect(),
        });
        message
    }

    /// Applies one live `newMessage` event. Merge and re-sort happen under
    /// the conversation lock, atomically with respect to every other
    /// operation on the same conversation.
    pub async fn on_inbound_message(&self, payload: MessagePayload) {
        let outcome = {
            let mut conversations = self.conversations.lock().await;
            let state = conversations.entry(payload.conversation_id).or_default();
            reconcile_payload(state, &payload, self.tolerance)
        };
        match outcome {
            MergeOutcome::Appended(message) => {
                let _ = self.updates.send(SyncUpdate::MessageAppended { message });
            }
            MergeOutcome::Confirmed(message) => {
                let _ = self.updates.send(SyncUpdate::MessageConfirmed { message });
            }
            MergeOutcome::Duplicate => {}
        }
    }

    /// Marks the matching pending optimistic message failed after its queued
    /// frame expired. The frame carries no temporary id, so the match reuses
    /// the body heuristic; the message stays visible.
    pub async fn mark_send_failed(&self, conversation_id: ConversationId, body: &str) {
        let failed_key = {
            let mut conversations = self.conversations.lock().await;
            let Some(state) = conversations.get_mut(&conversation_id) else {
                return;
            };
            let slot = state.messages.iter_mut().rev().find(|message| {
                message.provenance == Provenance::Optimistic
                    && !message.failed
                    && message.body == body
            });
            match slot {
                Some(message) => {
                    message.failed = true;
                    Some(message.key.clone())
                }
                None => None,
            }
        };
        if let Some(key) = failed_key {
            warn!(conversation_id = conversation_id.0, "optimistic send expired unacknowledged");
            let _ = self.updates.send(SyncUpdate::MessageFailed {
                conversation_id,
                key,
            });
        }
    }

    /// The counterpart viewed the conversation; flip the seen flag on every
    /// confirmed message.
    pub async fn mark_seen_by_peer(&self, conversation_id: ConversationId) {
        let mut conversations = self.conversations.lock().await;
        if let Some(state) = conversations.get_mut(&conversation_id) {
            for message in &mut state.messages {
                if message.provenance == Provenance::Confirmed {
                    message.seen = true;
                }
            }
        }
    }

    pub async fn latest_confirmed_at(
        &self,
        conversation_id: ConversationId,
    ) -> Option<DateTime<Utc>> {
        let conversations = self.conversations.lock().await;
        conversations.get(&conversation_id).and_then(|state| {
            state
                .messages
                .iter()
                .filter(|message| message.provenance == Provenance::Confirmed)
                .map(|message| message.sent_at)
                .max()
        })
    }

    pub async fn snapshot(&self, conversation_id: ConversationId) -> Vec<Message> {
        let conversations = self.conversations.lock().await;
        conversations
            .get(&conversation_id)
            .map(|state| state.messages.clone())
            .unwrap_or_default()
    }

    pub async fn phase(&self, conversation_id: ConversationId) -> ConversationPhase {
        let conversations = self.conversations.lock().await;
        conversations
            .get(&conversation_id)
            .map(|state| state.phase)
            .unwrap_or_default()
    }

    pub async fn history_error(&self, conversation_id: ConversationId) -> bool {
        let conversations = self.conversations.lock().await;
        conversations
            .get(&conversation_id)
            .map(|state| state.history_error)
            .unwrap_or(false)
    }

    /// Drops a conversation's sequence. Any in-flight history fetch for it
    /// resolves into nothing.
    pub async fn remove_conversation(&self, conversation_id: ConversationId) {
        self.conversations.lock().await.remove(&conversation_id);
    }

    pub async fn known_conversations(&self) -> Vec<ConversationId> {
        self.conversations.lock().await.keys().copied().collect()
    }

    /// Stamps a new fetch generation for the conversation. A resolution
    /// carrying an older generation is discarded, so a slow fetch can never
    /// overwrite newer state.
    async fn begin_history_fetch(&self, conversation_id: ConversationId) -> u64 {
        let mut conversations = self.conversations.lock().await;
        let state = conversations.entry(conversation_id).or_default();
        if state.phase == ConversationPhase::Uninitialized {
            state.phase = ConversationPhase::Loading;
        }
        state.fetch_generation += 1;
        state.fetch_generation
    }

    async fn apply_history_result(
        &self,
        conversation_id: ConversationId,
        generation: u64,
        result: Result<Vec<MessagePayload>, FetchError>,
    ) -> Result<(), FetchError> {
        let mut outcomes = Vec::new();
        let applied = {
            let mut conversations = self.conversations.lock().await;
            let Some(state) = conversations.get_mut(&conversation_id) else {
                // Conversation was abandoned while the fetch was in flight.
                return Ok(());
            };
            if state.fetch_generation != generation {
                info!(
                    conversation_id = conversation_id.0,
                    "discarding stale history fetch"
                );
                return Ok(());
            }
            match result {
                Ok(page) => {
                    for payload in &page {
                        outcomes.push(reconcile_payload(state, payload, self.tolerance));
                    }
                    state.phase = ConversationPhase::Ready;
                    state.history_error = false;
                    Ok(())
                }
                Err(err) => {
                    state.phase = ConversationPhase::Ready;
                    state.history_error = true;
                    Err(err)
                }
            }
        };

        match applied {
            Ok(()) => {
                // Fetched pages are not live activity: only confirmations of
                // pending optimistic messages are surfaced per message, the
                // rest of the page arrives as one history notification.
                for outcome in outcomes {
                    if let MergeOutcome::Confirmed(message) = outcome {
                        let _ = self.updates.send(SyncUpdate::MessageConfirmed { message });
                    }
                }
                let _ = self
                    .updates
                    .send(SyncUpdate::HistoryLoaded { conversation_id });
                Ok(())
            }
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    "history load failed: {err}"
                );
                let _ = self
                    .updates
                    .send(SyncUpdate::HistoryFailed { conversation_id });
                Err(err)
            }
        }
    }

    async fn reconcile_all_after_reconnect(&self) {
        let known = self.known_conversations().await;
        for conversation_id in known {
            if let Err(err) = self.reconcile_after_reconnect(conversation_id).await {
                warn!(
                    conversation_id = conversation_id.0,
                    "post-reconnect reconciliation failed: {err}"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
