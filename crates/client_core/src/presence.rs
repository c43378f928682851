use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::UserId,
    protocol::{presence_key, ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::info;

use crate::transport::{Subscription, Transport, TransportStatus};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Online state for one tracked counterpart. Exists only while a
/// subscription for that user is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub online: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
}

/// Maintains online/offline state for specific counterpart users over the
/// channel's per-user presence events. The tracked set is replayed on every
/// reconnect; the channel does not persist subscriptions across sessions.
pub struct PresenceTracker {
    transport: Arc<Transport>,
    records: Mutex<HashMap<UserId, PresenceRecord>>,
    subscriptions: std::sync::Mutex<HashMap<UserId, (Subscription, JoinHandle<()>)>>,
    updates: broadcast::Sender<PresenceUpdate>,
    lifecycle_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    pub fn new(transport: Arc<Transport>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            records: Mutex::new(HashMap::new()),
            subscriptions: std::sync::Mutex::new(HashMap::new()),
            updates,
            lifecycle_task: std::sync::Mutex::new(None),
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.updates.subscribe()
    }

    /// Starts the reconnect replay pump: every transition back into the open
    /// state re-issues a track request per tracked user, since the channel
    /// drops subscriptions on disconnect.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self
            .lifecycle_task
            .lock()
            .expect("lifecycle lock poisoned");
        if guard.is_some() {
            return;
        }
        let tracker = Arc::clone(self);
        let mut status = self.transport.subscribe_status();
        *guard = Some(tokio::spawn(async move {
            let mut was_connected = false;
            while let Ok(change) = status.recv().await {
                match change {
                    TransportStatus::Connected => {
                        if was_connected {
                            tracker.replay_tracked();
                        }
                        was_connected = true;
                    }
                    TransportStatus::Disconnected | TransportStatus::SendExpired(_) => {}
                }
            }
        }));
    }

    /// Subscribes to a counterpart's presence events and requests tracking.
    pub async fn track(self: &Arc<Self>, user_id: UserId) {
        {
            let subscriptions = self.subscriptions.lock().expect("subscriptions lock poisoned");
            if subscriptions.contains_key(&user_id) {
                return;
            }
        }

        self.records.lock().await.insert(
            user_id,
            PresenceRecord {
                online: false,
                updated_at: Utc::now(),
            },
        );

        let (subscription, mut events) = self.transport.subscribe(&presence_key(user_id));
        let tracker = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ServerEvent::Presence { user_id, online } = event {
                    tracker.apply_update(user_id, online).await;
                }
            }
        });
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .insert(user_id, (subscription, pump));

        self.transport.send(ClientRequest::JoinOnlineTrack { user_id });
        info!(user_id = user_id.0, "presence tracking started");
    }

    /// Tears the subscription down and forgets the record.
    pub async fn untrack(&self, user_id: UserId) {
        let removed = self
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .remove(&user_id);
        if let Some((subscription, pump)) = removed {
            drop(subscription);
            pump.abort();
        }
        self.records.lock().await.remove(&user_id);
    }

    pub async fn is_online(&self, user_id: UserId) -> Option<bool> {
        self.records
            .lock()
            .await
            .get(&user_id)
            .map(|record| record.online)
    }

    pub async fn record(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.records.lock().await.get(&user_id).copied()
    }

    pub fn tracked_users(&self) -> Vec<UserId> {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn shutdown(&self) {
        if let Some(task) = self
            .lifecycle_task
            .lock()
            .expect("lifecycle lock poisoned")
            .take()
        {
            task.abort();
        }
        let mut subscriptions = self.subscriptions.lock().expect("subscriptions lock poisoned");
        for (_, (subscription, pump)) in subscriptions.drain() {
            drop(subscription);
            pump.abort();
        }
    }

    async fn apply_update(&self, user_id: UserId, online: bool) {
        {
            let mut records = self.records.lock().await;
            let Some(record) = records.get_mut(&user_id) else {
                return;
            };
            record.online = online;
            record.updated_at = Utc::now();
        }
        let _ = self.updates.send(PresenceUpdate { user_id, online });
    }

    fn replay_tracked(&self) {
        let tracked = self.tracked_users();
        info!(count = tracked.len(), "re-subscribing presence tracking after reconnect");
        for user_id in tracked {
            self.transport.send(ClientRequest::JoinOnlineTrack { user_id });
        }
    }
}
