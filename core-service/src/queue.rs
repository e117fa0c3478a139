//! # Connector Update Queue
//!
//! Unbounded FIFO of [`UpdateEnvelope`]s between the account and the local
//! protocol server.
//!
//! ## Overview
//!
//! Publishing never blocks: the account actor must stay responsive while the
//! server works through a backlog. Closing the queue drops everything still
//! queued, which resolves the matching [`PendingUpdate`]s with
//! `StoreClosed`, and refuses new updates the same way.
//!
//! ## Usage
//!
//! ```no_run
//! # use core_service::queue::UpdateQueue;
//! # async fn example(queue: UpdateQueue) {
//! let mut updates = queue.receiver();
//! while let Some(envelope) = updates.recv().await {
//!     // apply envelope.update to the store, then:
//!     envelope.done(Ok(()));
//! }
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bridge_traits::{BridgeError, PendingUpdate, Update, UpdateEnvelope};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    items: VecDeque<UpdateEnvelope>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Sending side, owned by a connector.
#[derive(Clone, Default)]
pub struct UpdateQueue {
    shared: Arc<Shared>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `update`; the result resolves once the server applied it.
    pub fn publish(&self, update: Update) -> PendingUpdate {
        let mut state = self.shared.state.lock();
        if state.closed {
            debug!(update = %update, "Queue closed, dropping update");
            return PendingUpdate::resolved(update.kind(), Err(BridgeError::StoreClosed));
        }

        let (envelope, pending) = PendingUpdate::channel(update);
        state.items.push_back(envelope);
        drop(state);

        self.shared.notify.notify_one();
        pending
    }

    /// Discard queued updates and refuse new ones.
    pub fn close_and_discard(&self) -> usize {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            std::mem::take(&mut state.items)
        };
        let count = discarded.len();
        drop(discarded);

        self.shared.notify.notify_waiters();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn receiver(&self) -> UpdateReceiver {
        UpdateReceiver {
            shared: self.shared.clone(),
        }
    }
}

/// Receiving side, handed to the protocol server.
pub struct UpdateReceiver {
    shared: Arc<Shared>,
}

impl UpdateReceiver {
    /// Next update in publish order; `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<UpdateEnvelope> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(envelope) = state.items.pop_front() {
                    return Some(envelope);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<UpdateEnvelope> {
        self.shared.state.lock().items.pop_front()
    }
}

impl std::fmt::Debug for UpdateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("UpdateQueue")
            .field("queued", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}
