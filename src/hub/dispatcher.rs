//! Hub dispatcher loop
//!
//! The [`Hub`] is the single owner of the [`Registry`]. It runs one loop that
//! reads register, unregister and broadcast requests from three bounded
//! channels and applies them in turn, so membership never needs a lock.
//! Everything else talks to it through a cloneable [`HubHandle`].
//!
//! Backpressure: a broadcast never waits on a connection. If a connection's
//! outbound queue is full the configured [`SlowConsumerPolicy`] decides
//! whether it is disconnected (default) or simply misses that message.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use super::connection::{
    Connection, ConnectionHandle, ConnectionId, ConnectionSettings, EnqueueOutcome,
};
use super::message::Message;
use super::registry::Registry;

/// What to do with a connection whose outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlowConsumerPolicy {
    /// Close and unregister it
    #[default]
    Disconnect,
    /// Skip this message for it and keep it registered
    DropMessage,
}

impl SlowConsumerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlowConsumerPolicy::Disconnect => "disconnect",
            SlowConsumerPolicy::DropMessage => "drop_message",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "disconnect" => Some(SlowConsumerPolicy::Disconnect),
            "drop_message" | "drop" => Some(SlowConsumerPolicy::DropMessage),
            _ => None,
        }
    }
}

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each dispatcher input channel
    pub channel_capacity: usize,
    pub slow_consumer_policy: SlowConsumerPolicy,
    /// Settings given to every connection created through the hub
    pub connection: ConnectionSettings,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            slow_consumer_policy: SlowConsumerPolicy::default(),
            connection: ConnectionSettings::default(),
        }
    }
}

/// Point-in-time hub counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub dropped_connections: u64,
}

// Written only by the dispatcher.
#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    dropped_connections: AtomicU64,
}

struct BroadcastRequest {
    message: Arc<Message>,
    exclude: Option<ConnectionId>,
}

/// The dispatcher. Consumed by [`Hub::run`], so it can only run once.
pub struct Hub {
    registry: Registry,
    register_rx: mpsc::Receiver<ConnectionHandle>,
    unregister_rx: mpsc::Receiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<BroadcastRequest>,
    policy: SlowConsumerPolicy,
    counters: Arc<Counters>,
}

/// Shared handle for registering connections and broadcasting
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<ConnectionHandle>,
    unregister_tx: mpsc::Sender<ConnectionId>,
    broadcast_tx: mpsc::Sender<BroadcastRequest>,
    connection: ConnectionSettings,
    counters: Arc<Counters>,
}

impl Hub {
    /// Create an un-started hub and the handle used to reach it
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let capacity = config.channel_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());

        let hub = Self {
            registry: Registry::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            policy: config.slow_consumer_policy,
            counters: counters.clone(),
        };

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            connection: config.connection,
            counters,
        };

        (hub, handle)
    }

    /// Run the dispatcher loop.
    ///
    /// Returns when `shutdown` flips to true (or its sender is dropped), or
    /// when every [`HubHandle`] is gone. Every connection still registered at
    /// that point is closed.
    ///
    /// When several requests are ready at once, registrations go first, then
    /// unregistrations, then broadcasts. Each channel is FIFO.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(policy = self.policy.as_str(), "Hub dispatcher started");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                conn = self.register_rx.recv() => match conn {
                    Some(conn) => self.register(conn),
                    None => {
                        debug!("All hub handles dropped");
                        break;
                    }
                },
                Some(id) = self.unregister_rx.recv() => self.unregister(&id),
                Some(request) = self.broadcast_rx.recv() => self.broadcast(request),
            }
        }

        self.close_all();
        info!("Hub dispatcher stopped");
    }

    fn register(&mut self, conn: ConnectionHandle) {
        let id = conn.id();
        if self.registry.insert(conn) {
            self.sync_connection_count();
            debug!(connection_id = %id, connections = self.registry.len(), "Connection registered");
        } else {
            debug!(connection_id = %id, "Ignoring registration of closed or duplicate connection");
        }
    }

    fn unregister(&mut self, id: &ConnectionId) {
        if let Some(conn) = self.registry.remove(id) {
            conn.close();
            self.sync_connection_count();
            debug!(connection_id = %id, connections = self.registry.len(), "Connection unregistered");
        }
    }

    fn broadcast(&mut self, request: BroadcastRequest) {
        let mut slow = Vec::new();
        let mut gone = Vec::new();
        let mut delivered = 0u64;

        for conn in self.registry.iter() {
            if request.exclude == Some(conn.id()) {
                continue;
            }

            if !conn.is_alive() {
                gone.push(conn.id());
                continue;
            }

            match conn.enqueue(Arc::clone(&request.message)) {
                EnqueueOutcome::Queued => delivered += 1,
                EnqueueOutcome::Full => match self.policy {
                    SlowConsumerPolicy::Disconnect => slow.push(conn.id()),
                    SlowConsumerPolicy::DropMessage => {
                        debug!(connection_id = %conn.id(), "Outbound queue full, skipping message");
                    }
                },
                EnqueueOutcome::Closed => gone.push(conn.id()),
            }
        }

        for id in slow {
            if let Some(conn) = self.registry.remove(&id) {
                conn.close();
                self.counters
                    .dropped_connections
                    .fetch_add(1, Ordering::Relaxed);
                warn!(connection_id = %id, "Outbound queue full, dropping connection");
            }
        }

        for id in gone {
            self.unregister(&id);
        }

        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .deliveries
            .fetch_add(delivered, Ordering::Relaxed);
        self.sync_connection_count();

        debug!(
            kind = %request.message.kind,
            delivered = delivered,
            "Broadcast dispatched"
        );
    }

    fn close_all(&mut self) {
        if self.registry.is_empty() {
            return;
        }

        let mut closed = 0usize;
        for conn in self.registry.drain() {
            conn.close();
            closed += 1;
        }
        self.sync_connection_count();

        info!(connections = closed, "Closed remaining connections");
    }

    fn sync_connection_count(&self) {
        self.counters
            .connections
            .store(self.registry.len(), Ordering::Relaxed);
    }
}

impl HubHandle {
    /// Create a connection with the hub's connection settings
    pub fn new_connection(&self) -> Connection {
        Connection::new(self.connection.clone())
    }

    /// Queue a connection for registration
    pub async fn register(&self, conn: ConnectionHandle) {
        conn.mark_open();
        if let Err(mpsc::error::SendError(conn)) = self.register_tx.send(conn).await {
            warn!(connection_id = %conn.id(), "Hub is not running, closing connection");
            conn.close();
        }
    }

    /// Queue a removal. Unknown or already removed ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) {
        if self.unregister_tx.send(id).await.is_err() {
            debug!(connection_id = %id, "Hub is not running, nothing to unregister");
        }
    }

    /// Queue a fan-out to every registered connection except `exclude`.
    ///
    /// Delivery is best-effort and never reported back to the caller.
    pub async fn broadcast(&self, message: Message, exclude: Option<ConnectionId>) {
        let request = BroadcastRequest {
            message: Arc::new(message),
            exclude,
        };

        if self.broadcast_tx.send(request).await.is_err() {
            warn!("Hub is not running, broadcast dropped");
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.counters.connections.load(Ordering::Relaxed),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            dropped_connections: self.counters.dropped_connections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{ConnectionState, EventKind};
    use axum::extract::ws::Message as WsMessage;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct Running {
        hub: HubHandle,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    fn start(capacity: usize, policy: SlowConsumerPolicy) -> Running {
        let (hub, handle) = Hub::new(HubConfig {
            channel_capacity: 64,
            slow_consumer_policy: policy,
            connection: ConnectionSettings {
                outbound_capacity: capacity,
                ..ConnectionSettings::default()
            },
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(hub.run(shutdown_rx));

        Running {
            hub: handle,
            shutdown,
            task,
        }
    }

    fn post(id: &str) -> Message {
        Message::new(EventKind::PostCreated, json!({ "id": id }))
    }

    async fn next(conn: &mut Connection) -> Option<String> {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if let Some(message) = conn.try_next_queued() {
                return message.payload["id"].as_str().map(str::to_string);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        None
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    /// A connection served over in-memory channels, drained continuously
    struct Served {
        id: ConnectionId,
        frames: fmpsc::UnboundedReceiver<WsMessage>,
        _inbound: fmpsc::UnboundedSender<Result<WsMessage, axum::Error>>,
    }

    impl Served {
        async fn next_id(&mut self) -> Option<String> {
            loop {
                let frame = timeout(Duration::from_secs(1), self.frames.next())
                    .await
                    .ok()??;
                if let WsMessage::Text(text) = frame {
                    let message: Message = serde_json::from_str(&text).ok()?;
                    return message.payload["id"].as_str().map(str::to_string);
                }
            }
        }
    }

    async fn serve(hub: &HubHandle) -> Served {
        let conn = hub.new_connection();
        let id = conn.id();
        let (sink, frames) = fmpsc::unbounded();
        let (inbound_tx, inbound) = fmpsc::unbounded::<Result<WsMessage, axum::Error>>();

        hub.register(conn.handle()).await;
        let serve_hub = hub.clone();
        tokio::spawn(async move { conn.serve(sink, inbound, &serve_hub).await });

        Served {
            id,
            frames,
            _inbound: inbound_tx,
        }
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            SlowConsumerPolicy::from_str("disconnect"),
            Some(SlowConsumerPolicy::Disconnect)
        );
        assert_eq!(
            SlowConsumerPolicy::from_str("DROP_MESSAGE"),
            Some(SlowConsumerPolicy::DropMessage)
        );
        assert_eq!(SlowConsumerPolicy::from_str("retry"), None);
    }

    #[tokio::test]
    async fn test_broadcast_exclusion_and_unregister() {
        let running = start(16, SlowConsumerPolicy::Disconnect);
        let hub = &running.hub;

        let mut a = hub.new_connection();
        let mut b = hub.new_connection();
        hub.register(a.handle()).await;
        hub.register(b.handle()).await;

        hub.broadcast(post("p1"), None).await;
        assert_eq!(next(&mut a).await.as_deref(), Some("p1"));
        assert_eq!(next(&mut b).await.as_deref(), Some("p1"));

        hub.broadcast(post("p1"), Some(a.id())).await;
        hub.broadcast(post("marker"), None).await;
        assert_eq!(next(&mut a).await.as_deref(), Some("marker"));
        assert_eq!(next(&mut b).await.as_deref(), Some("p1"));
        assert_eq!(next(&mut b).await.as_deref(), Some("marker"));

        hub.unregister(b.id()).await;
        hub.broadcast(post("p2"), None).await;
        assert_eq!(next(&mut a).await.as_deref(), Some("p2"));
        assert!(b.try_next_queued().is_none());
        assert_eq!(b.handle().state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_broadcast_order_is_preserved() {
        let running = start(64, SlowConsumerPolicy::Disconnect);
        let hub = &running.hub;

        let mut conn = hub.new_connection();
        hub.register(conn.handle()).await;

        for i in 0..20 {
            hub.broadcast(post(&format!("m{}", i)), None).await;
        }
        for i in 0..20 {
            assert_eq!(next(&mut conn).await, Some(format!("m{}", i)));
        }
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let running = start(16, SlowConsumerPolicy::Disconnect);
        let hub = &running.hub;

        let mut a = hub.new_connection();
        let b = hub.new_connection();
        hub.register(a.handle()).await;
        hub.register(b.handle()).await;

        hub.unregister(b.id()).await;
        hub.unregister(b.id()).await;
        hub.unregister(ConnectionId::generate()).await;

        hub.broadcast(post("p1"), None).await;
        assert_eq!(next(&mut a).await.as_deref(), Some("p1"));
        assert_eq!(hub.stats().connections, 1);
        assert_eq!(hub.stats().dropped_connections, 0);
    }

    #[tokio::test]
    async fn test_saturated_connection_is_dropped_without_stalling_others() {
        let running = start(16, SlowConsumerPolicy::Disconnect);
        let hub = &running.hub;

        // Never drained, and much smaller than the served connection's queue
        let mut slow = Connection::new(ConnectionSettings {
            outbound_capacity: 2,
            ..ConnectionSettings::default()
        });
        hub.register(slow.handle()).await;
        let mut healthy = serve(hub).await;

        hub.broadcast(post("p1"), None).await;
        hub.broadcast(post("p2"), None).await;
        hub.broadcast(post("p3"), None).await;
        hub.broadcast(post("p4"), None).await;

        let started = Instant::now();
        for expected in ["p1", "p2", "p3", "p4"] {
            assert_eq!(healthy.next_id().await.as_deref(), Some(expected));
        }
        assert!(started.elapsed() < Duration::from_millis(500));

        assert_eq!(slow.handle().state(), ConnectionState::Closing);
        assert!(eventually(|| hub.stats().dropped_connections == 1).await);
        assert_eq!(hub.stats().connections, 1);

        hub.broadcast(post("p5"), None).await;
        assert_eq!(healthy.next_id().await.as_deref(), Some("p5"));

        // Only what fit before the overflow
        assert_eq!(slow.try_next_queued().map(|m| m.payload["id"].clone()), Some(json!("p1")));
        assert_eq!(slow.try_next_queued().map(|m| m.payload["id"].clone()), Some(json!("p2")));
        assert!(slow.try_next_queued().is_none());
    }

    #[tokio::test]
    async fn test_drop_message_policy_keeps_slow_connection() {
        let running = start(1, SlowConsumerPolicy::DropMessage);
        let hub = &running.hub;

        let mut slow = hub.new_connection();
        hub.register(slow.handle()).await;

        hub.broadcast(post("p1"), None).await;
        hub.broadcast(post("p2"), None).await;
        assert!(eventually(|| hub.stats().broadcasts == 2).await);

        assert_eq!(next(&mut slow).await.as_deref(), Some("p1"));
        assert!(slow.handle().is_alive());
        assert_eq!(hub.stats().connections, 1);

        hub.broadcast(post("p3"), None).await;
        assert_eq!(next(&mut slow).await.as_deref(), Some("p3"));
    }

    #[tokio::test]
    async fn test_exclusion_of_served_originator() {
        let running = start(16, SlowConsumerPolicy::Disconnect);
        let hub = &running.hub;

        let mut origin = serve(hub).await;
        let mut other = serve(hub).await;

        hub.broadcast(post("own"), Some(origin.id)).await;
        hub.broadcast(post("next"), None).await;

        assert_eq!(other.next_id().await.as_deref(), Some("own"));
        assert_eq!(other.next_id().await.as_deref(), Some("next"));
        assert_eq!(origin.next_id().await.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_closed_connection_is_never_registered() {
        let running = start(16, SlowConsumerPolicy::Disconnect);
        let hub = &running.hub;

        let mut conn = hub.new_connection();
        conn.handle().close();
        hub.register(conn.handle()).await;
        hub.broadcast(post("p1"), None).await;

        assert!(eventually(|| hub.stats().broadcasts == 1).await);
        assert_eq!(hub.stats().connections, 0);
        assert!(conn.try_next_queued().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_registered_connections() {
        let running = start(16, SlowConsumerPolicy::Disconnect);

        let a = running.hub.new_connection();
        let b = running.hub.new_connection();
        running.hub.register(a.handle()).await;
        running.hub.register(b.handle()).await;
        assert!(eventually(|| running.hub.stats().connections == 2).await);

        running.shutdown.send(true).unwrap();
        timeout(Duration::from_secs(1), running.task)
            .await
            .unwrap()
            .unwrap();

        assert!(!a.handle().is_alive());
        assert!(!b.handle().is_alive());
        assert_eq!(running.hub.stats().connections, 0);

        // Registering after shutdown closes the connection instead
        let late = running.hub.new_connection();
        running.hub.register(late.handle()).await;
        assert!(!late.handle().is_alive());
    }

    #[tokio::test]
    async fn test_run_returns_when_all_handles_dropped() {
        let Running {
            hub,
            shutdown: _shutdown,
            task,
        } = start(16, SlowConsumerPolicy::Disconnect);

        let conn = hub.new_connection();
        hub.register(conn.handle()).await;
        drop(hub);

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(!conn.handle().is_alive());
    }
}
