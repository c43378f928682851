use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ListingId, UserId},
    protocol::ConversationSummary,
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::{
    history::{FetchError, HistoryFetcher},
    sync::Message,
};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Directory entry with denormalized last-message preview, mirroring what
/// the list endpoint serves plus live state layered on top.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub counterpart_id: UserId,
    pub counterpart_name: String,
    pub counterpart_avatar: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub online: bool,
}

impl Conversation {
    fn from_summary(summary: ConversationSummary) -> Self {
        Self {
            id: summary.id,
            counterpart_id: summary.counterpart_id,
            counterpart_name: summary.counterpart_name,
            counterpart_avatar: summary.counterpart_avatar,
            last_message: summary.last_message,
            last_message_at: summary.last_message_at,
            unread_count: summary.unread_count,
            online: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Deletion rejected by the server; the entry is kept so the directory
    /// never resurrects a half-deleted conversation on the next live event.
    #[error("failed to delete conversation {conversation_id:?}: {reason}")]
    DeleteFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryUpdate {
    Refreshed,
    ConversationChanged(ConversationId),
    ConversationRemoved(ConversationId),
}

/// The ordered conversation list: populated from the paginated directory
/// endpoint, re-ordered by live message activity, presence-annotated.
pub struct ConversationDirectory {
    history: Arc<HistoryFetcher>,
    self_id: UserId,
    entries: Mutex<Vec<Conversation>>,
    updates: broadcast::Sender<DirectoryUpdate>,
}

impl ConversationDirectory {
    pub fn new(history: Arc<HistoryFetcher>, self_id: UserId) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            history,
            self_id,
            entries: Mutex::new(Vec::new()),
            updates,
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<DirectoryUpdate> {
        self.updates.subscribe()
    }

    /// Fetches one directory page and merges it into the local list,
    /// preserving live-derived state (online flag) on refreshed entries.
    pub async fn list(&self, page: u32) -> Result<Vec<Conversation>, FetchError> {
        let summaries = self.history.fetch_conversations(page).await?;
        let mut fetched = Vec::with_capacity(summaries.len());
        {
            let mut entries = self.entries.lock().await;
            for summary in summaries {
                let incoming = Conversation::from_summary(summary);
                match entries.iter_mut().find(|entry| entry.id == incoming.id) {
                    Some(existing) => {
                        let online = existing.online;
                        *existing = incoming.clone();
                        existing.online = online;
                        fetched.push(existing.clone());
                    }
                    None => {
                        entries.push(incoming.clone());
                        fetched.push(incoming);
                    }
                }
            }
            sort_entries(&mut entries);
        }
        let _ = self.updates.send(DirectoryUpdate::Refreshed);
        Ok(fetched)
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.entries.lock().await.clone()
    }

    pub async fn conversation(&self, conversation_id: ConversationId) -> Option<Conversation> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|entry| entry.id == conversation_id)
            .cloned()
    }

    /// Updates the owning entry's preview and unread state from a live
    /// message, creating a skeleton entry when the conversation is new to
    /// this session.
    pub async fn apply_live_update(&self, message: &Message) {
        {
            let mut entries = self.entries.lock().await;
            let position = match entries
                .iter()
                .position(|entry| entry.id == message.conversation_id)
            {
                Some(position) => position,
                None => {
                    entries.push(Conversation {
                        id: message.conversation_id,
                        counterpart_id: message.sender_id,
                        counterpart_name: String::new(),
                        counterpart_avatar: None,
                        last_message: None,
                        last_message_at: None,
                        unread_count: 0,
                        online: false,
                    });
                    entries.len() - 1
                }
            };
            let entry = &mut entries[position];
            entry.last_message = Some(message.body.clone());
            entry.last_message_at = Some(message.sent_at);
            if message.sender_id != self.self_id {
                entry.unread_count += 1;
            }
            sort_entries(&mut entries);
        }
        let _ = self
            .updates
            .send(DirectoryUpdate::ConversationChanged(message.conversation_id));
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|entry| entry.id == conversation_id) {
            entry.unread_count = 0;
        }
    }

    /// Mirrors the presence tracker onto matching directory entries.
    pub async fn set_online(&self, user_id: UserId, online: bool) {
        let mut entries = self.entries.lock().await;
        for entry in entries
            .iter_mut()
            .filter(|entry| entry.counterpart_id == user_id)
        {
            entry.online = online;
        }
    }

    /// Opens (or returns) the conversation for a listing counterpart and
    /// registers it locally.
    pub async fn open(&self, listing_id: ListingId) -> anyhow::Result<Conversation> {
        let summary = self.history.open_conversation(listing_id).await?;
        let conversation = Conversation::from_summary(summary);
        {
            let mut entries = self.entries.lock().await;
            if !entries.iter().any(|entry| entry.id == conversation.id) {
                entries.push(conversation.clone());
                sort_entries(&mut entries);
            }
        }
        let _ = self
            .updates
            .send(DirectoryUpdate::ConversationChanged(conversation.id));
        Ok(conversation)
    }

    /// Deletes server-side first; the local entry goes away only after the
    /// server confirms.
    pub async fn delete(&self, conversation_id: ConversationId) -> Result<(), DirectoryError> {
        self.history
            .delete_conversation(conversation_id)
            .await
            .map_err(|err| DirectoryError::DeleteFailed {
                conversation_id,
                reason: err.to_string(),
            })?;
        {
            let mut entries = self.entries.lock().await;
            entries.retain(|entry| entry.id != conversation_id);
        }
        info!(conversation_id = conversation_id.0, "conversation deleted");
        let _ = self
            .updates
            .send(DirectoryUpdate::ConversationRemoved(conversation_id));
        Ok(())
    }
}

/// Most recently active first; never-active entries keep insertion order at
/// the tail.
fn sort_entries(entries: &mut [Conversation]) {
    entries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
}
