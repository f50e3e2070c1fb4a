//! Replay cache for retried unary calls.
//!
//! A client keeps the same call id across retry attempts. The first attempt to
//! reach the server runs the handler; a later attempt with the same id either
//! waits for that execution or gets its stored reply. If the running attempt is
//! dropped before the handler finishes, the next attempt runs it again.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::codec::Reply;

/// Bounded map from call id to the (eventual) reply of that call.
pub(crate) struct ReplayCache {
    capacity: usize,
    state: Mutex<ReplayState>,
}

#[derive(Default)]
struct ReplayState {
    entries: HashMap<String, Arc<OnceCell<Reply>>>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

impl ReplayCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(ReplayState::default()),
        }
    }

    /// Run `execute` once per call id. Calls without an id always execute.
    pub(crate) async fn run<F, Fut>(&self, call_id: Option<&str>, execute: F) -> Reply
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Reply>,
    {
        let Some(call_id) = call_id.filter(|_| self.capacity > 0) else {
            return execute().await;
        };

        let cell = self.slot(call_id);
        let mut executed = false;
        let reply = cell
            .get_or_init(|| {
                executed = true;
                execute()
            })
            .await
            .clone();

        if !executed {
            debug!(call_id, "replaying reply of an already executed call");
        }
        reply
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn slot(&self, call_id: &str) -> Arc<OnceCell<Reply>> {
        let mut state = self.lock();
        if let Some(cell) = state.entries.get(call_id) {
            return Arc::clone(cell);
        }

        let cell = Arc::new(OnceCell::new());
        state.entries.insert(call_id.to_string(), Arc::clone(&cell));
        state.order.push_back(call_id.to_string());
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
            }
        }
        cell
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
