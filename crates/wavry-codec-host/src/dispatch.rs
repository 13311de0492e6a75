//! Ordered delivery of session events.
//!
//! Events are produced while the session lock is held but must reach the
//! client without it, because the client is allowed to call straight back
//! into the session (releasing an output from inside `Output` is the common
//! case). Producers enqueue under the session lock; after unlocking, whoever
//! finds the queue idle drains it. A nested drain from inside a callback
//! returns immediately and the outer loop picks up anything it enqueued, so
//! events always arrive in production order.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;
use wavry_common::{SessionEvent, SessionId};

/// Receives the events of one or more sessions.
pub trait SessionEvents: Send + Sync {
    fn on_event(&self, session: SessionId, event: SessionEvent);
}

#[derive(Default)]
struct Queue {
    events: VecDeque<SessionEvent>,
    draining: bool,
}

pub struct EventDispatcher {
    session: SessionId,
    sink: Arc<dyn SessionEvents>,
    queue: Mutex<Queue>,
}

impl EventDispatcher {
    pub fn new(session: SessionId, sink: Arc<dyn SessionEvents>) -> Self {
        Self {
            session,
            sink,
            queue: Mutex::new(Queue::default()),
        }
    }

    pub fn enqueue(&self, event: SessionEvent) {
        self.queue.lock().events.push_back(event);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Deliver queued events unless another caller is already doing so.
    pub fn drain(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let event = {
                let mut queue = self.queue.lock();
                match queue.events.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            trace!(session = %self.session, ?event, "delivering session event");
            self.sink.on_event(self.session, event);
        }
    }
}
