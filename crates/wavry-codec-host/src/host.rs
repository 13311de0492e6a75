//! Registry of the codec sessions running in one host process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use wavry_common::{CodecCapability, Error, HostConfig, Result, SessionConfig, SessionId};
use wavry_media::CodecFactory;

use crate::dispatch::SessionEvents;
use crate::session::{CodecSession, SessionState, SessionStats};

/// Session state counts for diagnostics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStateCounts {
    pub configured: usize,
    pub started: usize,
    pub stopped: usize,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<CodecSession>>,
    shut_down: bool,
}

pub struct SessionHost {
    config: HostConfig,
    factory: Arc<dyn CodecFactory>,
    registry: Mutex<Registry>,
}

impl SessionHost {
    pub fn new(config: HostConfig, factory: Arc<dyn CodecFactory>) -> Self {
        Self {
            config,
            factory,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn capabilities(&self) -> Vec<CodecCapability> {
        self.factory.capabilities()
    }

    /// Create, configure and start a session under the caller-chosen id.
    pub fn create_session(
        &self,
        id: SessionId,
        config: SessionConfig,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Arc<CodecSession>> {
        let mut registry = self.registry.lock();
        if registry.shut_down {
            return Err(Error::transport("session host is shut down"));
        }
        if registry.sessions.contains_key(&id) {
            return Err(Error::invalid_argument(format!("session {id} already exists")));
        }
        if registry.sessions.len() >= self.config.max_sessions {
            return Err(Error::allocation(format!(
                "host already runs {} sessions",
                self.config.max_sessions
            )));
        }

        let session = CodecSession::new(id, config, events);
        let started = session
            .configure(self.factory.as_ref())
            .and_then(|()| session.start());
        if let Err(err) = started {
            warn!(session = %id, error = %err, "session failed to start");
            session.release();
            return Err(err);
        }

        registry.sessions.insert(id, session.clone());
        info!(session = %id, sessions = registry.sessions.len(), "session created");
        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> Result<Arc<CodecSession>> {
        self.registry
            .lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("session {id}")))
    }

    pub fn destroy_session(&self, id: SessionId) -> Result<()> {
        let session = self
            .registry
            .lock()
            .sessions
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("session {id}")))?;
        session.release();
        debug!(session = %id, "session destroyed");
        Ok(())
    }

    /// Release every session and refuse new ones.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<CodecSession>> = {
            let mut registry = self.registry.lock();
            registry.shut_down = true;
            registry.sessions.drain().map(|(_, session)| session).collect()
        };
        let released = sessions.len();
        for session in sessions {
            session.release();
        }
        info!(released, "session host shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.registry.lock().shut_down
    }

    pub fn session_stats(&self, id: SessionId) -> Option<SessionStats> {
        let session = self.registry.lock().sessions.get(&id).cloned()?;
        Some(session.stats())
    }

    pub fn len(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().sessions.is_empty()
    }

    pub fn state_counts(&self) -> SessionStateCounts {
        let sessions: Vec<Arc<CodecSession>> =
            self.registry.lock().sessions.values().cloned().collect();
        let mut counts = SessionStateCounts::default();
        for session in sessions {
            match session.state() {
                SessionState::Configured => counts.configured += 1,
                SessionState::Started | SessionState::Flushing => counts.started += 1,
                SessionState::Stopped => counts.stopped += 1,
                SessionState::Unconfigured | SessionState::Released => {}
            }
        }
        counts
    }
}
