//! Client connections
//!
//! A [`Connection`] owns one client's transport and a bounded outbound queue.
//! The hub only ever sees the cheap [`ConnectionHandle`] side: it can try to
//! enqueue a message or close the connection, nothing else. Draining the
//! queue to the socket and watching the socket for closure are done by the
//! connection's own writer and reader pumps.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error};
use uuid::Uuid;

use super::dispatcher::HubHandle;
use super::message::Message;

/// Opaque connection identity, only meaningful for equality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The outbound queue is at capacity
    Full,
    /// The writer is gone
    Closed,
}

const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Per-connection tuning
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Outbound queue capacity
    pub outbound_capacity: usize,
    /// Upper bound for a single transport write
    pub write_timeout: Duration,
    /// Heartbeat ping period
    pub ping_interval: Duration,
    /// The reader gives up after this long without any inbound frame
    pub idle_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

struct Shared {
    state: AtomicU8,
    close_tx: watch::Sender<bool>,
}

/// The hub's view of a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Arc<Message>>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// False once the connection has started closing
    pub fn is_alive(&self) -> bool {
        self.state() < ConnectionState::Closing
    }

    /// Try to queue a message without waiting
    pub fn enqueue(&self, message: Arc<Message>) -> EnqueueOutcome {
        match self.outbound.try_send(message) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Start closing the connection.
    ///
    /// Wakes both pumps. Safe to call any number of times from anywhere;
    /// returns true only for the call that actually flipped the state.
    pub fn close(&self) -> bool {
        let previous = self.advance(ConnectionState::Closing);
        if previous < ConnectionState::Closing {
            self.shared.close_tx.send_replace(true);
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_open(&self) {
        self.advance(ConnectionState::Open);
    }

    fn advance(&self, to: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.fetch_max(to as u8, Ordering::AcqRel))
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.shared.close_tx.subscribe()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// One accepted client
pub struct Connection {
    handle: ConnectionHandle,
    outbound_rx: mpsc::Receiver<Arc<Message>>,
    settings: ConnectionSettings,
}

impl Connection {
    pub fn new(settings: ConnectionSettings) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(settings.outbound_capacity.max(1));
        let (close_tx, _) = watch::channel(false);

        let handle = ConnectionHandle {
            id: ConnectionId::generate(),
            outbound,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                close_tx,
            }),
        };

        Self {
            handle,
            outbound_rx,
            settings,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Pump messages between the outbound queue and the transport until
    /// either side fails or the connection is closed.
    ///
    /// The writer and reader run on their own tasks. Whichever exits first
    /// triggers the close signal, which unblocks the other; once both are
    /// done the hub is told to unregister this connection, exactly once.
    pub async fn serve<Si, St, E>(self, sink: Si, stream: St, hub: &HubHandle)
    where
        Si: Sink<WsMessage> + Send + Unpin + 'static,
        Si::Error: fmt::Display + Send,
        St: Stream<Item = Result<WsMessage, E>> + Send + Unpin + 'static,
        E: fmt::Display + Send + 'static,
    {
        let Connection {
            handle,
            outbound_rx,
            settings,
        } = self;
        let id = handle.id;

        let mut writer = tokio::spawn(write_pump(
            id,
            sink,
            outbound_rx,
            handle.close_signal(),
            settings.clone(),
        ));
        let mut reader = tokio::spawn(read_pump(
            id,
            stream,
            handle.close_signal(),
            settings.idle_timeout,
        ));

        tokio::select! {
            _ = &mut writer => {
                handle.close();
                let _ = reader.await;
            }
            _ = &mut reader => {
                handle.close();
                let _ = writer.await;
            }
        }

        hub.unregister(id).await;
        handle.advance(ConnectionState::Closed);

        debug!(connection_id = %id, "Connection closed");
    }

    #[cfg(test)]
    pub(crate) fn try_next_queued(&mut self) -> Option<Arc<Message>> {
        self.outbound_rx.try_recv().ok()
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender means the connection is gone as well.
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn write_pump<Si>(
    id: ConnectionId,
    mut sink: Si,
    mut outbound: mpsc::Receiver<Arc<Message>>,
    mut closed: watch::Receiver<bool>,
    settings: ConnectionSettings,
) where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: fmt::Display,
{
    // tokio intervals reject a zero period
    let period = settings.ping_interval.max(MIN_PING_INTERVAL);
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            next = outbound.recv() => match next {
                Some(message) => match message.to_json() {
                    Ok(json) => WsMessage::Text(json),
                    Err(e) => {
                        error!(connection_id = %id, "Skipping unencodable message: {}", e);
                        continue;
                    }
                },
                None => break,
            },
            _ = ping.tick() => WsMessage::Ping(Vec::new()),
        };

        match timeout(settings.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection_id = %id, "Write failed: {}", e);
                break;
            }
            Err(_) => {
                debug!(connection_id = %id, "Write timed out");
                break;
            }
        }
    }

    let _ = timeout(settings.write_timeout, sink.close()).await;
}

async fn read_pump<St, E>(
    id: ConnectionId,
    mut stream: St,
    mut closed: watch::Receiver<bool>,
    idle_timeout: Duration,
) where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            next = timeout(idle_timeout, stream.next()) => match next {
                Ok(Some(Ok(WsMessage::Close(_)))) => {
                    debug!(connection_id = %id, "Client sent close");
                    break;
                }
                // Inbound frames only prove liveness
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    debug!(connection_id = %id, "Read failed: {}", e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(connection_id = %id, "No inbound frames within {:?}", idle_timeout);
                    break;
                }
            },
        }
    }
}
