//! Liveness monitoring of the process hosting codec sessions.

use parking_lot::Mutex;
use tracing::debug;
use wavry_common::{Error, Result};

pub type DeathCallback = Box<dyn FnOnce() + Send>;

/// Watches one peer and reports its death at most once.
pub trait LivenessMonitor: Send + Sync {
    /// Register the callback fired when the peer dies, replacing any earlier one.
    ///
    /// Fails if the peer is already dead; the callback never runs in that case.
    fn watch(&self, on_death: DeathCallback) -> Result<()>;

    /// Stop watching. A death after this is not reported.
    fn disarm(&self);

    fn is_alive(&self) -> bool;
}

#[derive(Default)]
struct LinkState {
    watcher: Option<DeathCallback>,
    dead: bool,
}

/// Death notification for an in-process peer.
#[derive(Default)]
pub struct DeathLink {
    state: Mutex<LinkState>,
}

impl DeathLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the peer dead and notify the watcher. Returns whether a watcher ran.
    pub fn notify_death(&self) -> bool {
        let watcher = {
            let mut state = self.state.lock();
            if state.dead {
                return false;
            }
            state.dead = true;
            state.watcher.take()
        };
        match watcher {
            Some(on_death) => {
                on_death();
                true
            }
            None => {
                debug!("peer died with no watcher");
                false
            }
        }
    }
}

impl LivenessMonitor for DeathLink {
    fn watch(&self, on_death: DeathCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.dead {
            return Err(Error::transport("peer is already dead"));
        }
        state.watcher = Some(on_death);
        Ok(())
    }

    fn disarm(&self) {
        self.state.lock().watcher = None;
    }

    fn is_alive(&self) -> bool {
        !self.state.lock().dead
    }
}
