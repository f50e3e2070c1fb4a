//! Event hub: fans broadcast events out to connected subscribers.
//!
//! Each subscriber owns an in-memory FIFO queue and a drain task that moves
//! events from the queue onto the subscriber's stream. `broadcast` only
//! enqueues and returns; it never waits for delivery.
//!
//! ```text
//!  broadcast(e) ──┬──> [queue: sub-a] ──drain──> sink (gRPC stream a)
//!                 ├──> [queue: sub-b] ──drain──> sink (gRPC stream b)
//!                 └──> [queue: sub-c] ──drain──> sink (gRPC stream c)
//! ```
//!
//! ## Delivery failures
//!
//! When a delivery fails the drain task retries the same event with backoff,
//! keeping the rest of the queue behind it. A subscriber that re-subscribes
//! with the same id during that window hands its new stream to the running
//! drain task and delivery resumes with nothing lost. Once the retry budget is
//! spent the subscriber is dropped along with its queue. Other subscribers are
//! never affected.
//!
//! Queues live in memory only: everything still queued is gone when the hub
//! is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, error, info, warn};

use crate::codec::Envelope;
use crate::config::ServerOptions;

/// How a hub picks the subscribers of an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubMode {
    /// Every connected subscriber receives every event.
    #[default]
    FanOut,
    /// Each event goes to exactly one connected subscriber, in rotation.
    RoundRobin,
}

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The subscriber may accept the event on a later attempt.
    Transient(String),
    /// The subscriber's stream is gone.
    Closed,
}

/// The outbound side of one subscriber's stream.
#[async_trait]
pub trait EventSink: Send + 'static {
    async fn deliver(&mut self, envelope: Envelope) -> Result<(), DeliveryError>;
}

/// Sink feeding a gRPC `Subscribe` response stream.
pub(crate) struct ChannelSink {
    tx: mpsc::Sender<Result<Envelope, Status>>,
    timeout: Duration,
}

impl ChannelSink {
    pub(crate) fn new(tx: mpsc::Sender<Result<Envelope, Status>>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&mut self, envelope: Envelope) -> Result<(), DeliveryError> {
        match self.tx.send_timeout(Ok(envelope), self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::Transient(format!(
                "subscriber did not take the event within {:?}",
                self.timeout
            ))),
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

/// Fan-out point for one event type.
pub struct EventHub {
    event_type: String,
    mode: HubMode,
    backoff: ExponentialBuilder,
    state: Arc<Mutex<HubState>>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct HubState {
    subscribers: Vec<SubscriberSlot>,
    /// Round-robin cursor.
    next: usize,
    generation: u64,
}

/// A live subscriber: the enqueue side of its queue plus a way to hand a
/// fresh sink to its drain task.
struct SubscriberSlot {
    id: String,
    generation: u64,
    queue: mpsc::UnboundedSender<Envelope>,
    handover: mpsc::UnboundedSender<Box<dyn EventSink>>,
    depth: Arc<AtomicUsize>,
}

impl SubscriberSlot {
    fn enqueue(&self, envelope: Envelope) -> bool {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(envelope).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }
}

impl EventHub {
    pub(crate) fn new(
        event_type: impl Into<String>,
        mode: HubMode,
        options: &ServerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            mode,
            backoff: options.hub_backoff(),
            state: Arc::new(Mutex::new(HubState::default())),
            shutdown,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn mode(&self) -> HubMode {
        self.mode
    }

    /// Attach a subscriber's stream.
    ///
    /// A subscriber id that is still live takes its new sink into the existing
    /// drain task, keeping its queue. Must be called inside a Tokio runtime.
    pub fn attach(&self, subscriber_id: &str, sink: Box<dyn EventSink>) {
        let mut state = lock(&self.state);

        let sink = match state.subscribers.iter().position(|s| s.id == subscriber_id) {
            Some(index) => match state.subscribers[index].handover.send(sink) {
                Ok(()) => {
                    info!(event = %self.event_type, subscriber = subscriber_id, "subscriber reattached");
                    return;
                }
                Err(mpsc::error::SendError(sink)) => {
                    state.subscribers.remove(index);
                    sink
                }
            },
            None => sink,
        };

        state.generation += 1;
        let generation = state.generation;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (handover_tx, handover_rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        state.subscribers.push(SubscriberSlot {
            id: subscriber_id.to_string(),
            generation,
            queue: queue_tx,
            handover: handover_tx,
            depth: Arc::clone(&depth),
        });
        drop(state);

        let drain = DrainTask {
            event_type: self.event_type.clone(),
            subscriber_id: subscriber_id.to_string(),
            generation,
            hub: Arc::downgrade(&self.state),
            queue: queue_rx,
            handover: handover_rx,
            sink,
            depth,
            backoff: self.backoff,
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(drain.run());

        info!(event = %self.event_type, subscriber = subscriber_id, "subscriber attached");
    }

    /// Enqueue an event for its subscribers. Returns the number of queues it
    /// went into; zero when nobody is connected.
    pub fn broadcast(&self, envelope: Envelope) -> usize {
        let mut state = lock(&self.state);
        if state.subscribers.is_empty() {
            debug!(event = %self.event_type, "no subscribers, event dropped");
            return 0;
        }

        match self.mode {
            HubMode::FanOut => state
                .subscribers
                .iter()
                .filter(|slot| slot.enqueue(envelope.clone()))
                .count(),
            HubMode::RoundRobin => {
                let count = state.subscribers.len();
                for _ in 0..count {
                    let index = state.next % count;
                    state.next = state.next.wrapping_add(1);
                    if state.subscribers[index].enqueue(envelope.clone()) {
                        return 1;
                    }
                }
                0
            }
        }
    }

    /// Ids of the connected subscribers.
    pub fn subscribers(&self) -> Vec<String> {
        lock(&self.state)
            .subscribers
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }

    /// Events queued or in flight for a subscriber, `None` if it is not connected.
    pub fn pending(&self, subscriber_id: &str) -> Option<usize> {
        lock(&self.state)
            .subscribers
            .iter()
            .find(|s| s.id == subscriber_id)
            .map(|s| s.depth.load(Ordering::SeqCst))
    }
}

fn lock(state: &Mutex<HubState>) -> MutexGuard<'_, HubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves events from one subscriber's queue to its sink, in order.
struct DrainTask {
    event_type: String,
    subscriber_id: String,
    generation: u64,
    hub: Weak<Mutex<HubState>>,
    queue: mpsc::UnboundedReceiver<Envelope>,
    handover: mpsc::UnboundedReceiver<Box<dyn EventSink>>,
    sink: Box<dyn EventSink>,
    depth: Arc<AtomicUsize>,
    backoff: ExponentialBuilder,
    shutdown: CancellationToken,
}

impl DrainTask {
    async fn run(mut self) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(sink) = self.handover.recv() => {
                    self.sink = sink;
                    continue;
                }
                next = self.queue.recv() => match next {
                    Some(envelope) => envelope,
                    // the hub is gone
                    None => break,
                },
            };

            if !self.deliver(envelope).await {
                self.detach();
                break;
            }
        }
        debug!(event = %self.event_type, subscriber = %self.subscriber_id, "drain task stopped");
    }

    /// Deliver one event, retrying with backoff. Returns false once the
    /// subscriber is considered lost.
    async fn deliver(&mut self, envelope: Envelope) -> bool {
        let mut delays = self.backoff.build();
        loop {
            let failure = match self.sink.deliver(envelope.clone()).await {
                Ok(()) => {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    return true;
                }
                Err(failure) => failure,
            };

            let Some(delay) = delays.next() else {
                error!(
                    event = %self.event_type,
                    subscriber = %self.subscriber_id,
                    error = ?failure,
                    "subscriber lost, discarding its queue"
                );
                return false;
            };

            warn!(
                event = %self.event_type,
                subscriber = %self.subscriber_id,
                error = ?failure,
                delay = ?delay,
                "event delivery failed, retrying"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                Some(sink) = self.handover.recv() => {
                    self.sink = sink;
                    delays = self.backoff.build();
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn detach(&self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let mut state = lock(&hub);
        state
            .subscribers
            .retain(|s| !(s.id == self.subscriber_id && s.generation == self.generation));
    }
}
