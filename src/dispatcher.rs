//! ==============================================================================
//! dispatcher.rs - fan-out of accepted readings to push subscribers
//! ==============================================================================
//!
//! purpose:
//!     every websocket client gets its own bounded queue. the ingestion
//!     pipeline publishes into all of them without ever waiting: a queue that
//!     is closed or full marks a dead or stalled client, which is dropped from
//!     the set. the other clients are unaffected.
//!
//! replay:
//!     `subscribe()` snapshots the history buffer and queues it as a single
//!     "history" message before the subscriber becomes visible to `publish`.
//!     the subscriber remembers the newest id it was replayed, so a reading
//!     that was inserted before the snapshot but published after it is not
//!     delivered twice.
//!
//! relationships:
//!     - reads: history.rs (replay snapshot)
//!     - called by: pipeline.rs (publish), supervisor.rs (link status)
//!     - consumed by: server.rs (one Subscription per websocket)
//!
//! ==============================================================================

use crate::domain::{LinkState, LinkStatus, PushMessage, Reading};
use crate::history::HistoryBuffer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
#[cfg(test)]
use tokio::sync::mpsc::error::TryRecvError;

pub const DEFAULT_REPLAY_LIMIT: usize = 100;
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

/// clone-able handle, all clones share one subscriber set
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    history: Arc<HistoryBuffer>,
    replay_limit: usize,
    queue_depth: usize,
    next_handle: AtomicU64,
    state: Mutex<SharedState>,
}

struct SharedState {
    subscribers: HashMap<u64, Subscriber>,
    link: LinkState,
}

struct Subscriber {
    tx: mpsc::Sender<PushMessage>,
    /// newest sequence id already covered by the replay
    replayed_up_to: u64,
}

impl Dispatcher {
    pub fn new(history: Arc<HistoryBuffer>, replay_limit: usize, queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                history,
                replay_limit: replay_limit.max(1),
                // history + status must always fit
                queue_depth: queue_depth.max(2),
                next_handle: AtomicU64::new(1),
                state: Mutex::new(SharedState {
                    subscribers: HashMap::new(),
                    link: LinkState::Disconnected,
                }),
            }),
        }
    }

    /// register a new subscriber; its queue already holds the history batch
    /// followed by the current link status
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        let history = self.inner.history.snapshot(self.inner.replay_limit);
        let replayed_up_to = history.first().map(|r| r.sequence_id).unwrap_or(0);

        // the channel is fresh and holds at least two messages
        let _ = tx.try_send(PushMessage::History(history));
        let _ = tx.try_send(PushMessage::Status(LinkStatus { serial: state.link }));

        state.subscribers.insert(id, Subscriber { tx, replayed_up_to });
        tracing::debug!("Push subscriber {} added ({} active)", id, state.subscribers.len());
        drop(state);

        Subscription {
            id,
            rx,
            dispatcher: self.clone(),
        }
    }

    /// deliver one reading to every active subscriber, returns how many got it
    pub fn publish(&self, reading: &Arc<Reading>) -> usize {
        let mut state = self.lock();
        let mut delivered = 0;

        state.subscribers.retain(|id, sub| {
            if reading.sequence_id <= sub.replayed_up_to {
                return true;
            }
            match sub.tx.try_send(PushMessage::Reading(reading.clone())) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    drop_subscriber(*id, &e);
                    false
                }
            }
        });

        delivered
    }

    /// record a serial link transition and tell every subscriber about it
    pub fn set_link_state(&self, link: LinkState) {
        let mut state = self.lock();
        if state.link == link {
            return;
        }
        state.link = link;

        let message = PushMessage::Status(LinkStatus { serial: link });
        state.subscribers.retain(|id, sub| match sub.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(e) => {
                drop_subscriber(*id, &e);
                false
            }
        });
    }

    /// remove a subscriber; unknown or already-removed handles are a no-op
    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.lock();
        if state.subscribers.remove(&id).is_some() {
            tracing::debug!("Push subscriber {} removed ({} active)", id, state.subscribers.len());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn link_state(&self) -> LinkState {
        self.lock().link
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn drop_subscriber<T>(id: u64, err: &TrySendError<T>) {
    match err {
        TrySendError::Full(_) => {
            tracing::debug!("Push subscriber {} is not keeping up, dropping it", id)
        }
        TrySendError::Closed(_) => tracing::debug!("Push subscriber {} went away", id),
    }
}

/// receiving end for one push client; unsubscribes itself on drop
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<PushMessage>,
    dispatcher: Dispatcher,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// next message, `None` once the dispatcher has dropped this subscriber
    pub async fn recv(&mut self) -> Option<PushMessage> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Result<PushMessage, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.id);
    }
}
