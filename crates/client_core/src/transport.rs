use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::{Duration, Instant},
};

use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::Settings;

const STATUS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Lifecycle and queue notifications fanned out to dependent components.
/// `SendExpired` carries the frame that aged out of the outbound queue so the
/// synchronizer can mark the matching optimistic message failed.
#[derive(Debug, Clone)]
pub enum TransportStatus {
    Connected,
    Disconnected,
    SendExpired(ClientRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Dispatched,
    Queued,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server url must start with http:// or https://, got {0}")]
    InvalidServerUrl(String),
}

struct QueuedSend {
    request: ClientRequest,
    queued_at: Instant,
}

type Registry = HashMap<String, HashMap<u64, mpsc::UnboundedSender<ServerEvent>>>;

/// The single persistent bidirectional channel. Owns connect state, a bounded
/// retry queue for frames produced while the channel is down, and the
/// named-handler subscription registry shared by the synchronizer, presence
/// tracker, and receipt tracker.
pub struct Transport {
    ws_url: String,
    backoff_floor: Duration,
    backoff_ceiling: Duration,
    queue_capacity: usize,
    queue_ttl: Duration,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<mpsc::UnboundedSender<ClientRequest>>>,
    queue: Mutex<VecDeque<QueuedSend>>,
    registry: Arc<Mutex<Registry>>,
    next_subscription_id: AtomicU64,
    status: broadcast::Sender<TransportStatus>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(settings: &Settings) -> Result<Arc<Self>, TransportError> {
        let ws_base = if let Some(rest) = settings.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = settings.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(TransportError::InvalidServerUrl(settings.server_url.clone()));
        };
        let ws_url = format!("{}/ws?token={}", ws_base.trim_end_matches('/'), settings.bearer_token);

        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            ws_url,
            backoff_floor: settings.reconnect_backoff_floor(),
            backoff_ceiling: settings.reconnect_backoff_ceiling(),
            queue_capacity: settings.send_queue_capacity,
            queue_ttl: settings.send_queue_ttl(),
            state: RwLock::new(ConnectionState::Closed),
            writer: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            registry: Arc::new(Mutex::new(Registry::new())),
            next_subscription_id: AtomicU64::new(1),
            status,
            supervisor: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().expect("state lock poisoned")
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    /// Starts the connection supervisor. Reconnects with exponential backoff
    /// forever; queued application events are never replayed implicitly by
    /// the channel itself, only flushed from the local outbound queue.
    pub fn connect(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock().expect("supervisor lock poisoned");
        if guard.is_some() {
            return;
        }
        let transport = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            transport.supervise().await;
        }));
    }

    pub fn shutdown(&self) {
        if let Some(task) = self
            .supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .take()
        {
            task.abort();
        }
        self.set_state(ConnectionState::Closed);
        *self.writer.lock().expect("writer lock poisoned") = None;
    }

    /// Dispatches an outbound event, or parks it in the bounded retry queue
    /// while the channel is not open. Never blocks the caller.
    pub fn send(&self, request: ClientRequest) -> SendOutcome {
        if self.state() == ConnectionState::Open {
            let guard = self.writer.lock().expect("writer lock poisoned");
            if let Some(writer) = guard.as_ref() {
                if writer.send(request.clone()).is_ok() {
                    return SendOutcome::Dispatched;
                }
            }
        }

        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.push_back(QueuedSend {
            request,
            queued_at: Instant::now(),
        });
        while queue.len() > self.queue_capacity {
            if let Some(evicted) = queue.pop_front() {
                warn!("outbound queue full, dropping oldest frame");
                let _ = self
                    .status
                    .send(TransportStatus::SendExpired(evicted.request));
            }
        }
        SendOutcome::Queued
    }

    /// Registers a handler for one named inbound event. The returned guard
    /// deregisters on drop; the receiver yields one item per occurrence.
    pub fn subscribe(&self, key: &str) -> (Subscription, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .entry(key.to_string())
            .or_default()
            .insert(id, tx);
        (
            Subscription {
                key: key.to_string(),
                id,
                registry: Arc::downgrade(&self.registry),
            },
            rx,
        )
    }

    /// Drops queued frames older than the queue TTL, reporting each on the
    /// status stream. The supervisor runs this between reconnect attempts.
    pub fn purge_expired_sends(&self) {
        let expired: Vec<ClientRequest> = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            let ttl = self.queue_ttl;
            let mut dropped = Vec::new();
            while queue
                .front()
                .is_some_and(|front| front.queued_at.elapsed() >= ttl)
            {
                if let Some(entry) = queue.pop_front() {
                    dropped.push(entry.request);
                }
            }
            dropped
        };
        for request in expired {
            warn!("outbound frame expired before reconnect");
            let _ = self.status.send(TransportStatus::SendExpired(request));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = self.backoff_floor;
        loop {
            self.set_state(ConnectionState::Connecting);
            match connect_async(&self.ws_url).await {
                Ok((stream, _)) => {
                    backoff = self.backoff_floor;
                    info!("channel established");
                    self.run_session(stream).await;
                    info!("channel closed");
                }
                Err(err) => {
                    warn!("channel connect failed: {err}");
                }
            }
            self.set_state(ConnectionState::Closed);
            self.purge_expired_sends();
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.backoff_ceiling);
        }
    }

    async fn run_session(
        self: &Arc<Self>,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut reader) = stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<ClientRequest>();
        *self.writer.lock().expect("writer lock poisoned") = Some(writer_tx);
        self.set_state(ConnectionState::Open);
        let _ = self.status.send(TransportStatus::Connected);
        self.flush_queue();

        let write_task = tokio::spawn(async move {
            while let Some(request) = writer_rx.recv().await {
                let frame = match serde_json::to_string(&request) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("failed to encode outbound frame: {err}");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => self.dispatch(event),
                    Err(err) => warn!("invalid server event: {err}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("channel receive failed: {err}");
                    break;
                }
            }
        }

        write_task.abort();
        *self.writer.lock().expect("writer lock poisoned") = None;
        self.set_state(ConnectionState::Closed);
        let _ = self.status.send(TransportStatus::Disconnected);
    }

    fn flush_queue(&self) {
        let pending: Vec<QueuedSend> = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            queue.drain(..).collect()
        };
        for entry in pending {
            if entry.queued_at.elapsed() >= self.queue_ttl {
                let _ = self.status.send(TransportStatus::SendExpired(entry.request));
                continue;
            }
            self.send(entry.request);
        }
    }

    fn dispatch(&self, event: ServerEvent) {
        let key = event.dispatch_key();
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let Some(handlers) = registry.get_mut(&key) else {
            debug!(key = %key, "inbound event with no subscriber");
            return;
        };
        handlers.retain(|_, tx| tx.send(event.clone()).is_ok());
        if handlers.is_empty() {
            registry.remove(&key);
        }
    }
}

/// Unsubscribe capability returned by [`Transport::subscribe`]. Dropping it
/// removes the handler from the registry.
pub struct Subscription {
    key: String,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().expect("registry lock poisoned");
        if let Some(handlers) = registry.get_mut(&self.key) {
            handlers.remove(&self.id);
            if handlers.is_empty() {
                registry.remove(&self.key);
            }
        }
    }
}
