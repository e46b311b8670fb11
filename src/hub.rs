//! Fan-out of captured process output to live observers.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a record
//! that does not fit a subscriber's queue is dropped for that subscriber only.
//! The most recent records are kept in a replay buffer and handed to new
//! subscribers first.

use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Write as _},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{Event, Subscriber, field::Field};
use tracing_subscriber::{Layer, layer::Context};

/// Process id used for the manager's own log lines
pub const SYSTEM_SOURCE: &str = "system";

pub const DEFAULT_REPLAY_CAPACITY: usize = 100;
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One chunk of output from a supervised process (or from the manager itself)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    /// Instance id, or [`SYSTEM_SOURCE`]
    pub process_id: String,
    pub stream: Stream,
    pub content: String,
}

impl LogRecord {
    pub fn new(process_id: impl Into<String>, stream: Stream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            process_id: process_id.into(),
            stream,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SYSTEM_SOURCE, Stream::Stdout, content)
    }

    pub fn is_system(&self) -> bool {
        self.process_id == SYSTEM_SOURCE
    }
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<u64, mpsc::Sender<LogRecord>>,
    replay: VecDeque<LogRecord>,
    next_id: u64,
    closed: bool,
}

/// Publish/subscribe hub for [`LogRecord`]s. Cheap to clone.
#[derive(Clone)]
pub struct LogHub {
    state: Arc<Mutex<HubState>>,
    replay_capacity: usize,
    queue_capacity: usize,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LogHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHub")
            .field("replay_capacity", &self.replay_capacity)
            .field("queue_capacity", &self.queue_capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn lock(state: &Mutex<HubState>) -> MutexGuard<'_, HubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LogHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY, DEFAULT_QUEUE_CAPACITY)
    }

    /// `replay` records are kept for late subscribers; each subscriber queue
    /// holds `queue` records (at least one).
    pub fn with_capacity(replay: usize, queue: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                replay: VecDeque::with_capacity(replay),
                ..HubState::default()
            })),
            replay_capacity: replay,
            queue_capacity: queue.max(1),
        }
    }

    /// Register a new subscriber, pre-filled with as much of the replay
    /// buffer as fits its queue.
    pub fn subscribe(&self) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.queue_capacity);
        let mut state = lock(&self.state);

        for record in &state.replay {
            if tx.try_send(record.clone()).is_err() {
                break;
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        // A closed hub hands out subscriptions that end after the replay
        if !state.closed {
            state.subscribers.insert(id, tx);
        }

        Subscription {
            id,
            receiver,
            hub: Arc::downgrade(&self.state),
        }
    }

    /// Deregister and close a subscription. Dropping it has the same effect.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn publish(&self, record: LogRecord) {
        let mut state = lock(&self.state);

        if self.replay_capacity > 0 {
            if state.replay.len() >= self.replay_capacity {
                state.replay.pop_front();
            }
            state.replay.push_back(record.clone());
        }

        state.subscribers.retain(|_, tx| match tx.try_send(record.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Close every subscription; later subscribers only receive the replay
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Current replay buffer, oldest first
    pub fn replay(&self) -> Vec<LogRecord> {
        lock(&self.state).replay.iter().cloned().collect()
    }
}

/// A registered subscriber's queue. Deregisters itself when dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<LogRecord>,
    hub: Weak<Mutex<HubState>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next record, or `None` once the hub closed this subscription and the
    /// queue is drained
    pub async fn recv(&mut self) -> Option<LogRecord> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<LogRecord, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.hub.upgrade() {
            lock(&state).subscribers.remove(&self.id);
        }
        self.receiver.close();
    }
}

/// `tracing` layer copying the manager's own events into the hub as
/// [`SYSTEM_SOURCE`] records
pub struct HubLayer {
    hub: LogHub,
}

impl HubLayer {
    pub fn new(hub: LogHub) -> Self {
        Self { hub }
    }
}

impl<S> Layer<S> for HubLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let level = event.metadata().level();
        self.hub
            .publish(LogRecord::system(format!("{level} {}{}", visitor.message, visitor.fields)));
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
