//! Request state machine.
//!
//! One machine per logical request (the feed, the open article, ...).
//! Producers never touch the state directly: they push messages onto a
//! queue, and a single writer task applies them in order, drops anything
//! from a superseded request, rejects illegal transitions, and only then
//! notifies listeners.
//!
//! ```text
//! begin() ──► Begin(seq) ─┐
//!                         ├──► queue ──► writer ──► watch (current)
//! sink.emit(state) ───────┘                   └──► broadcast (every commit)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::state::RequestState;

const EVENT_BUFFER: usize = 64;

/// A committed state plus the request sequence number that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub seq: u64,
    pub state: RequestState<T>,
}

enum Message<T> {
    Begin(u64),
    /// Supersede everything and go back to Idle (sign-out)
    Reset(u64),
    Commit { seq: u64, state: RequestState<T> },
}

/// Write handle for a single request.
///
/// Cheap to clone; background work keeps one around and asks
/// [`StateSink::is_current`] before bothering to do anything.
pub struct StateSink<T> {
    seq: u64,
    latest: Arc<AtomicU64>,
    queue: mpsc::UnboundedSender<Message<T>>,
}

impl<T> Clone for StateSink<T> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            latest: Arc::clone(&self.latest),
            queue: self.queue.clone(),
        }
    }
}

impl<T> StateSink<T> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// False once a newer request has been issued on the same machine
    pub fn is_current(&self) -> bool {
        self.latest.load(Ordering::SeqCst) == self.seq
    }

    /// Queue a transition. Returns false when it is known to be dropped.
    pub fn emit(&self, state: RequestState<T>) -> bool {
        if !self.is_current() {
            debug!(seq = self.seq, state = state.label(), "Request superseded; not emitting");
            return false;
        }
        self.queue
            .send(Message::Commit {
                seq: self.seq,
                state,
            })
            .is_ok()
    }
}

pub struct RequestMachine<T> {
    name: Arc<str>,
    latest: Arc<AtomicU64>,
    queue: mpsc::UnboundedSender<Message<T>>,
    current: watch::Receiver<Snapshot<T>>,
    events: broadcast::Sender<Snapshot<T>>,
}

impl<T> RequestMachine<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Must be called inside a Tokio runtime; the writer runs as a task.
    pub fn new(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (queue, inbox) = mpsc::unbounded_channel();
        let (state_tx, current) = watch::channel(Snapshot {
            seq: 0,
            state: RequestState::Idle,
        });
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        tokio::spawn(run_writer(Arc::clone(&name), inbox, state_tx, events.clone()));

        Self {
            name,
            latest: Arc::new(AtomicU64::new(0)),
            queue,
            current,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a new explicit request. Everything still in flight for older
    /// sequence numbers is ignored from here on.
    pub fn begin(&self) -> StateSink<T> {
        let seq = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        // Queued before the sink exists, so the writer always sees Begin(n)
        // ahead of any commit for n.
        let _ = self.queue.send(Message::Begin(seq));

        StateSink {
            seq,
            latest: Arc::clone(&self.latest),
            queue: self.queue.clone(),
        }
    }

    /// Drop whatever is shown and in flight; the machine reads Idle again.
    pub fn reset(&self) {
        let seq = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.queue.send(Message::Reset(seq));
    }

    pub fn latest_seq(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> RequestState<T> {
        self.current.borrow().state.clone()
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.current.borrow().clone()
    }

    /// Latest committed state; intermediate ones may be skipped
    pub fn watch(&self) -> watch::Receiver<Snapshot<T>> {
        self.current.clone()
    }

    /// Every committed transition, in order
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot<T>> {
        self.events.subscribe()
    }
}

async fn run_writer<T>(
    name: Arc<str>,
    mut inbox: mpsc::UnboundedReceiver<Message<T>>,
    state_tx: watch::Sender<Snapshot<T>>,
    events: broadcast::Sender<Snapshot<T>>,
) where
    T: Clone + Send + Sync + 'static,
{
    let mut begun = 0u64;

    while let Some(message) = inbox.recv().await {
        match message {
            Message::Begin(seq) => {
                begun = begun.max(seq);
                debug!(resource = %name, seq, "Request started");
            }
            Message::Reset(seq) => {
                begun = begun.max(seq);
                debug!(resource = %name, seq, "State reset");
                let snapshot = Snapshot {
                    seq,
                    state: RequestState::Idle,
                };
                state_tx.send_replace(snapshot.clone());
                let _ = events.send(snapshot);
            }
            Message::Commit { seq, state } => {
                if seq < begun {
                    debug!(
                        resource = %name,
                        seq,
                        latest = begun,
                        state = state.label(),
                        "Dropping result of superseded request"
                    );
                    continue;
                }

                let allowed = {
                    let current = state_tx.borrow();
                    current.state.can_transition_to(&state, current.seq == seq)
                };
                if !allowed {
                    warn!(
                        resource = %name,
                        seq,
                        from = state_tx.borrow().state.label(),
                        to = state.label(),
                        "Rejected illegal state transition"
                    );
                    continue;
                }

                debug!(resource = %name, seq, state = state.label(), "State committed");
                let snapshot = Snapshot { seq, state };
                state_tx.send_replace(snapshot.clone());
                // No subscribers is fine
                let _ = events.send(snapshot);
            }
        }
    }
}
