//! CDC broadcast fan-out server.
//!
//! One source tail reads the backing store's change stream; every active
//! subscriber owns a bounded queue. Delivery is non-blocking per subscriber:
//! a full queue closes that subscriber with a slow-consumer signal instead
//! of blocking the source or the other subscribers. A single shared queue
//! would couple every consumer to the slowest one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use etre_core::{CdcEvent, Error, EventFilter, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::store::CdcStore;

/// Change-stream server limits.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Cap on concurrent subscribers.
    pub max_clients: usize,
    /// Per-subscriber queue size.
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 100,
            buffer_size: 100,
        }
    }
}

/// Why a subscriber's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscriber's queue was full when the source produced an event.
    SlowConsumer,
    /// Normal termination: the server is stopping.
    ServerShutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::SlowConsumer => write!(f, "slow consumer"),
            CloseReason::ServerShutdown => write!(f, "server shutdown"),
        }
    }
}

struct SubscriberSlot {
    tx: mpsc::Sender<CdcEvent>,
    closed_tx: oneshot::Sender<CloseReason>,
}

/// A live subscription: the bounded event queue plus the close signal.
pub struct Subscription {
    id: u64,
    events: mpsc::Receiver<CdcEvent>,
    closed: oneshot::Receiver<CloseReason>,
}

pub struct ChangeStreamServer {
    store: Arc<CdcStore>,
    config: ServerConfig,
    subscribers: RwLock<HashMap<u64, SubscriberSlot>>,
    next_id: AtomicU64,
    stop: CancellationToken,
}

impl ChangeStreamServer {
    pub fn new(store: Arc<CdcStore>, config: ServerConfig) -> Self {
        Self {
            store,
            config,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stop: CancellationToken::new(),
        }
    }

    /// Tail the backing store's change stream and fan events out until the
    /// stop signal. Returns an error if the tail ends unexpectedly so the
    /// caller can restart it.
    pub async fn run(&self) -> Result<()> {
        let mut tail = self.store.watch().await?;
        if self.stop.is_cancelled() {
            self.close_all(CloseReason::ServerShutdown);
            return Ok(());
        }
        tracing::info!("change stream server running");

        loop {
            tokio::select! {
                maybe = tail.recv() => match maybe {
                    Some(event) => self.fan_out(&event),
                    None => {
                        self.close_all(CloseReason::ServerShutdown);
                        return Err(Error::internal("change stream tail ended"));
                    }
                },
                _ = self.stop.cancelled() => {
                    tracing::info!("change stream server stopping");
                    self.close_all(CloseReason::ServerShutdown);
                    return Ok(());
                }
            }
        }
    }

    /// Signal the server to stop and close all subscribers.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Register a subscriber. Fails when the client cap is reached.
    pub fn subscribe(&self) -> Result<Subscription> {
        let mut subscribers = self.subscribers.write();
        if subscribers.len() >= self.config.max_clients {
            return Err(Error::internal(format!(
                "too many CDC clients (max {})",
                self.config.max_clients
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::channel(self.config.buffer_size);
        let (closed_tx, closed) = oneshot::channel();
        subscribers.insert(id, SubscriberSlot { tx, closed_tx });
        tracing::debug!(subscriber = id, "CDC subscriber added");
        Ok(Subscription { id, events, closed })
    }

    /// Remove a subscriber without a close signal (client went away).
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.write().remove(&id).is_some() {
            tracing::debug!(subscriber = id, "CDC subscriber removed");
        }
    }

    pub fn client_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn fan_out(&self, event: &CdcEvent) {
        let mut dead: Vec<(u64, Option<CloseReason>)> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (&id, slot) in subscribers.iter() {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dead.push((id, Some(CloseReason::SlowConsumer)));
                    }
                    Err(TrySendError::Closed(_)) => dead.push((id, None)),
                }
            }
        }
        for (id, reason) in dead {
            if let Some(slot) = self.subscribers.write().remove(&id) {
                if let Some(reason) = reason {
                    tracing::warn!(subscriber = id, %reason, "closing CDC subscriber");
                    let _ = slot.closed_tx.send(reason);
                }
            }
        }
    }

    fn close_all(&self, reason: CloseReason) {
        let slots: Vec<(u64, SubscriberSlot)> = self.subscribers.write().drain().collect();
        for (id, slot) in slots {
            tracing::debug!(subscriber = id, %reason, "closing CDC subscriber");
            let _ = slot.closed_tx.send(reason);
        }
    }
}

// ============================================================================
// PER-CLIENT STREAMER
// ============================================================================

/// Builds per-client streamers joined at a starting timestamp.
#[derive(Clone)]
pub struct StreamerFactory {
    pub store: Arc<CdcStore>,
    pub server: Arc<ChangeStreamServer>,
}

/// One item of a client's stream.
#[derive(Debug)]
pub enum StreamItem {
    Event(CdcEvent),
    Closed(CloseReason),
}

/// A client's view of the change stream: history replay from `since`, then
/// the live feed. The live subscription is opened before the history read,
/// so the overlap window is deduped by event id and the join has neither
/// gaps nor duplicates.
pub struct Streamer {
    server: Arc<ChangeStreamServer>,
    sub: Subscription,
    backlog: VecDeque<CdcEvent>,
    seen: HashSet<String>,
    done: Option<CloseReason>,
}

impl StreamerFactory {
    pub async fn start(&self, ctx: &CancellationToken, since: i64) -> Result<Streamer> {
        // Subscribe first: anything committed while we read history lands
        // in the queue and is deduped against the backlog.
        let sub = self.server.subscribe()?;
        let backlog = self.store.read(ctx, &EventFilter::since(since)).await?;
        Ok(Streamer::new(Arc::clone(&self.server), sub, backlog))
    }
}

impl Streamer {
    fn new(server: Arc<ChangeStreamServer>, sub: Subscription, backlog: Vec<CdcEvent>) -> Self {
        let seen = backlog.iter().map(|ev| ev.id.clone()).collect();
        Self {
            server,
            sub,
            backlog: backlog.into(),
            seen,
            done: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.sub.id
    }

    /// The next event, or the close signal. After a `Closed` item the
    /// streamer keeps returning it.
    pub async fn next(&mut self) -> StreamItem {
        if let Some(reason) = self.done {
            return StreamItem::Closed(reason);
        }
        if let Some(event) = self.backlog.pop_front() {
            return StreamItem::Event(event);
        }

        loop {
            tokio::select! {
                maybe = self.sub.events.recv() => match maybe {
                    Some(event) => {
                        // Events in the overlap window already went out
                        // during replay.
                        if self.seen.remove(&event.id) {
                            continue;
                        }
                        return StreamItem::Event(event);
                    }
                    None => {
                        let reason = (&mut self.sub.closed)
                            .await
                            .unwrap_or(CloseReason::ServerShutdown);
                        self.done = Some(reason);
                        return StreamItem::Closed(reason);
                    }
                },
                reason = &mut self.sub.closed => {
                    let reason = reason.unwrap_or(CloseReason::ServerShutdown);
                    self.done = Some(reason);
                    return StreamItem::Closed(reason);
                }
            }
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.server.unsubscribe(self.sub.id);
    }
}
