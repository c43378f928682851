use std::{sync::Arc, time::Duration};

use anyhow::Result;
use shared::domain::{
    AttachmentRef, ConversationId, ListingId, UserId,
};
use shared::protocol::MessagePayload;
use tokio::{sync::broadcast, task::JoinHandle};

pub mod attachments;
pub mod config;
pub mod directory;
pub mod history;
pub mod presence;
pub mod receipts;
pub mod sync;
pub mod transport;

pub use attachments::{AttachmentError, AttachmentUpload, AttachmentUploader, UploadScope};
pub use config::{load_settings, Settings};
pub use directory::{Conversation, ConversationDirectory, DirectoryError, DirectoryUpdate};
pub use history::{FetchError, HistoryFetcher, MessageHistory, SortOrder};
pub use presence::{PresenceRecord, PresenceTracker, PresenceUpdate};
pub use receipts::{ReceiptTracker, ReceiptUpdate};
pub use sync::{
    ConversationPhase, Message, MessageKey, MessageSynchronizer, Provenance, SyncUpdate,
};
pub use transport::{ConnectionState, SendOutcome, Transport, TransportStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything a caller needs to render from, in one stream.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    MessageAppended(Message),
    MessageConfirmed(Message),
    MessageFailed {
        conversation_id: ConversationId,
        key: MessageKey,
    },
    HistoryLoaded(ConversationId),
    HistoryFailed(ConversationId),
    PresenceChanged(PresenceUpdate),
    ConversationSeen(ConversationId),
    DirectoryChanged(DirectoryUpdate),
}

/// Facade over the synchronization subsystem. Constructs every component
/// around one explicitly injected transport instance and wires their update
/// streams into a single event stream.
pub struct ChatClient {
    transport: Arc<Transport>,
    history: Arc<HistoryFetcher>,
    uploader: AttachmentUploader,
    sync: Arc<MessageSynchronizer>,
    presence: Arc<PresenceTracker>,
    receipts: Arc<ReceiptTracker>,
    directory: Arc<ConversationDirectory>,
    events: broadcast::Sender<ClientEvent>,
    wiring: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(settings: Settings) -> Result<Arc<Self>> {
        let self_id = UserId(settings.user_id);
        let transport = Transport::new(&settings)?;
        let history = Arc::new(HistoryFetcher::new(&settings)?);
        let uploader = AttachmentUploader::new(&settings)?;
        let sync = MessageSynchronizer::new(
            Arc::clone(&transport),
            Arc::clone(&history) as Arc<dyn MessageHistory>,
            self_id,
            settings.merge_tolerance(),
        );
        let presence = PresenceTracker::new(Arc::clone(&transport));
        let receipts = ReceiptTracker::new(Arc::clone(&transport), Arc::clone(&sync));
        let directory = ConversationDirectory::new(Arc::clone(&history), self_id);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            transport,
            history,
            uploader,
            sync,
            presence,
            receipts,
            directory,
            events,
            wiring: std::sync::Mutex::new(Vec::new()),
        }))
    }

    /// Starts the component pumps, wires their streams together, and brings
    /// the channel up. Idempotent per client instance.
    pub fn connect(self: &Arc<Self>) {
        {
            let wiring = self.wiring.lock().expect("wiring lock poisoned");
            if !wiring.is_empty() {
                return;
            }
        }

        self.sync.start();
        self.presence.start();
        self.receipts.start();

        let mut tasks = Vec::new();

        let mut sync_updates = self.sync.subscribe_updates();
        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Ok(update) = sync_updates.recv().await {
                match update {
                    SyncUpdate::MessageAppended { message } => {
                        client.directory.apply_live_update(&message).await;
                        let _ = client.events.send(ClientEvent::MessageAppended(message));
                    }
                    SyncUpdate::MessageConfirmed { message } => {
                        client.directory.apply_live_update(&message).await;
                        let _ = client.events.send(ClientEvent::MessageConfirmed(message));
                    }
                    SyncUpdate::MessageFailed {
                        conversation_id,
                        key,
                    } => {
                        let _ = client.events.send(ClientEvent::MessageFailed {
                            conversation_id,
                            key,
                        });
                    }
                    SyncUpdate::HistoryLoaded { conversation_id } => {
                        let _ = client.events.send(ClientEvent::HistoryLoaded(conversation_id));
                    }
                    SyncUpdate::HistoryFailed { conversation_id } => {
                        let _ = client.events.send(ClientEvent::HistoryFailed(conversation_id));
                    }
                }
            }
        }));

        let mut presence_updates = self.presence.subscribe_updates();
        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Ok(update) = presence_updates.recv().await {
                client
                    .directory
                    .set_online(update.user_id, update.online)
                    .await;
                let _ = client.events.send(ClientEvent::PresenceChanged(update));
            }
        }));

        let mut receipt_updates = self.receipts.subscribe_updates();
        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Ok(update) = receipt_updates.recv().await {
                let _ = client
                    .events
                    .send(ClientEvent::ConversationSeen(update.conversation_id));
            }
        }));

        let mut directory_updates = self.directory.subscribe_updates();
        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Ok(update) = directory_updates.recv().await {
                let _ = client.events.send(ClientEvent::DirectoryChanged(update));
            }
        }));

        let mut status = self.transport.subscribe_status();
        let client = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Ok(change) = status.recv().await {
                match change {
                    TransportStatus::Connected => {
                        let _ = client.events.send(ClientEvent::Connected);
                    }
                    TransportStatus::Disconnected => {
                        let _ = client.events.send(ClientEvent::Disconnected);
                    }
                    TransportStatus::SendExpired(_) => {}
                }
            }
        }));

        *self.wiring.lock().expect("wiring lock poisoned") = tasks;
        self.transport.connect();
    }

    /// Polls until the channel is open, for callers that want a ready client
    /// before their first send.
    pub async fn wait_until_open(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.transport.state() == ConnectionState::Open {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn list_conversations(&self, page: u32) -> Result<Vec<Conversation>, FetchError> {
        self.directory.list(page).await
    }

    pub async fn open_conversation(&self, listing_id: ListingId) -> Result<Conversation> {
        self.directory.open(listing_id).await
    }

    pub async fn load_history(&self, conversation_id: ConversationId) -> Result<(), FetchError> {
        self.sync.load_history(conversation_id).await
    }

    pub async fn load_history_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
    ) -> Result<(), FetchError> {
        self.sync.load_history_page(conversation_id, page).await
    }

    pub async fn search_messages(
        &self,
        conversation_id: ConversationId,
        term: &str,
    ) -> Result<Vec<MessagePayload>, FetchError> {
        self.history
            .fetch_messages(conversation_id, 1, SortOrder::NewestFirst, Some(term))
            .await
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        body: impl Into<String>,
        attachments: Vec<AttachmentRef>,
    ) -> Message {
        self.sync
            .send_message(conversation_id, body, attachments)
            .await
    }

    pub async fn upload_attachment(
        &self,
        scope: UploadScope,
        upload: AttachmentUpload,
    ) -> Result<AttachmentRef, AttachmentError> {
        self.uploader.upload(scope, upload).await
    }

    pub async fn download_attachment(&self, path: &str) -> Result<Vec<u8>> {
        self.uploader.download(path).await
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.sync.snapshot(conversation_id).await
    }

    pub async fn mark_seen(&self, conversation_id: ConversationId) {
        self.receipts.mark_seen(conversation_id).await;
        self.directory.mark_read(conversation_id).await;
    }

    pub async fn track_presence(&self, user_id: UserId) {
        self.presence.track(user_id).await;
    }

    pub async fn untrack_presence(&self, user_id: UserId) {
        self.presence.untrack(user_id).await;
    }

    /// Confirm-then-remove: the server delete must succeed before any local
    /// state disappears.
    pub async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), DirectoryError> {
        self.directory.delete(conversation_id).await?;
        self.sync.remove_conversation(conversation_id).await;
        self.receipts.forget(conversation_id).await;
        Ok(())
    }

    /// Tears down every pump and the channel supervisor. In-flight fetch
    /// resolutions after this are discarded.
    pub fn shutdown(&self) {
        for task in self.wiring.lock().expect("wiring lock poisoned").drain(..) {
            task.abort();
        }
        self.receipts.shutdown();
        self.presence.shutdown();
        self.sync.shutdown();
        self.transport.shutdown();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
