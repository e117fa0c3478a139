//! Sync progress reporting on the [`EventBus`].
//!
//! Progress events are throttled: at most one per update interval, plus a
//! final one when the counter reaches the total.

use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::SyncError;
use crate::pipeline::ProgressReporter;

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Counter {
    start: DateTime<Utc>,
    last_update: Option<DateTime<Utc>>,
    /// Steps done before this attempt, excluded from rate estimates
    initial: i64,
    current: i64,
    total: i64,
}

pub struct SyncReporter {
    user_id: String,
    events: EventBus,
    clock: Arc<dyn Clock>,
    update_interval: chrono::Duration,
    counter: Mutex<Counter>,
}

impl SyncReporter {
    pub fn new(user_id: impl Into<String>, events: EventBus) -> Self {
        Self::with_clock(user_id, events, Arc::new(SystemClock), DEFAULT_UPDATE_INTERVAL)
    }

    pub fn with_clock(
        user_id: impl Into<String>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        update_interval: Duration,
    ) -> Self {
        let now = clock.now();
        Self {
            user_id: user_id.into(),
            events,
            clock,
            update_interval: chrono::Duration::from_std(update_interval)
                .unwrap_or(chrono::Duration::seconds(1)),
            counter: Mutex::new(Counter {
                start: now,
                last_update: None,
                initial: 0,
                current: 0,
                total: 0,
            }),
        }
    }

    fn emit(&self, event: SyncEvent) {
        self.events.emit(CoreEvent::Sync(event)).ok();
    }

    fn progress_event(&self, counter: &Counter, now: DateTime<Utc>) -> SyncEvent {
        let elapsed = (now - counter.start).num_milliseconds().max(0);
        let done = counter.current - counter.initial;
        let left = (counter.total - counter.current).max(0);
        let remaining = if done > 0 {
            elapsed.saturating_mul(left) / done
        } else {
            0
        };

        SyncEvent::Progress {
            user_id: self.user_id.clone(),
            current: counter.current.max(0) as u64,
            total: counter.total.max(0) as u64,
            elapsed_ms: elapsed as u64,
            remaining_ms: remaining as u64,
        }
    }
}

impl ProgressReporter for SyncReporter {
    fn on_start(&self) {
        let mut counter = self.counter.lock();
        counter.start = self.clock.now();
        counter.last_update = None;
        drop(counter);

        self.emit(SyncEvent::Started {
            user_id: self.user_id.clone(),
        });
    }

    fn on_finished(&self) {
        self.emit(SyncEvent::Finished {
            user_id: self.user_id.clone(),
        });
    }

    fn on_error(&self, error: &SyncError) {
        let event = if error.is_cancelled() {
            SyncEvent::Cancelled {
                user_id: self.user_id.clone(),
            }
        } else {
            SyncEvent::Failed {
                user_id: self.user_id.clone(),
                message: error.to_string(),
            }
        };
        self.emit(event);
    }

    fn on_progress(&self, delta: i64) {
        let now = self.clock.now();
        let mut counter = self.counter.lock();
        counter.current += delta;

        let due = match counter.last_update {
            None => true,
            Some(last) => now - last >= self.update_interval,
        };
        if !due && counter.current < counter.total {
            return;
        }

        counter.last_update = Some(now);
        let event = self.progress_event(&counter, now);
        drop(counter);

        debug!(user_id = %self.user_id, ?event, "Sync progress");
        self.emit(event);
    }

    fn initialize_progress_counter(&self, current: i64, total: i64) {
        let mut counter = self.counter.lock();
        counter.initial = current;
        counter.current = current;
        counter.total = total;
    }
}

impl std::fmt::Debug for SyncReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncReporter")
            .field("user_id", &self.user_id)
            .field("counter", &*self.counter.lock())
            .finish()
    }
}
