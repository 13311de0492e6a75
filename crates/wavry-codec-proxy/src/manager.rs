//! Shared connection to the session host, with crash recovery.
//!
//! All proxies share one connection. It is opened on first demand, closed when
//! the last proxy is released, and replaced when the host dies: the manager
//! reconnects, recreates every live proxy's session with its original
//! configuration and tells each proxy how that went.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use wavry_common::{Error, Result};

use crate::connection::{Connector, HostConnection};
use crate::proxy::ProxyShared;

#[derive(Default)]
struct ManagerState {
    connection: Option<Arc<dyn HostConnection>>,
    /// Bumped for every connection; death notifications name the one they belong to.
    epoch: u64,
    refs: usize,
    recovering: bool,
    proxies: HashMap<u64, Weak<ProxyShared>>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    state: Mutex<ManagerState>,
    recovered: Condvar,
    next_key: AtomicU64,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connector,
            state: Mutex::new(ManagerState::default()),
            recovered: Condvar::new(),
            next_key: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn connection(&self) -> Option<Arc<dyn HostConnection>> {
        self.state.lock().connection.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Sessions currently holding a reference to the connection.
    pub fn active_sessions(&self) -> usize {
        self.state.lock().refs
    }

    pub fn live_proxies(&self) -> usize {
        self.state
            .lock()
            .proxies
            .values()
            .filter(|proxy| proxy.strong_count() > 0)
            .count()
    }

    /// Take a reference on the shared connection, connecting if needed.
    ///
    /// Blocks while a lost connection is being recovered.
    pub(crate) fn acquire(&self) -> Result<(Arc<dyn HostConnection>, u64)> {
        let mut state = self.state.lock();
        while state.recovering {
            self.recovered.wait(&mut state);
        }

        let connection = match &state.connection {
            Some(connection) => connection.clone(),
            None => {
                let connection = self.connector.connect()?;
                let epoch = state.epoch + 1;
                self.watch(&connection, epoch)?;
                state.epoch = epoch;
                state.connection = Some(connection.clone());
                info!(epoch, "connected to session host");
                connection
            }
        };
        state.refs += 1;
        Ok((connection, state.epoch))
    }

    /// Drop a reference taken by `acquire`; the last one closes the connection.
    pub(crate) fn release_connection(&self) {
        let closing = {
            let mut state = self.state.lock();
            state.refs = state.refs.saturating_sub(1);
            if state.refs > 0 || state.recovering {
                return;
            }
            state.connection.take()
        };
        if let Some(connection) = closing {
            connection.monitor().disarm();
            connection.close();
            info!("last session released, connection closed");
        }
    }

    pub(crate) fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a proxy for recovery. Fails if the connection it was created on
    /// has already been replaced.
    pub(crate) fn register(&self, key: u64, proxy: &Arc<ProxyShared>, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.connection.is_none() {
            return false;
        }
        state.proxies.insert(key, Arc::downgrade(proxy));
        true
    }

    pub(crate) fn unregister(&self, key: u64) {
        self.state.lock().proxies.remove(&key);
    }

    fn watch(&self, connection: &Arc<dyn HostConnection>, epoch: u64) -> Result<()> {
        let this = self.this.clone();
        connection.monitor().watch(Box::new(move || {
            if let Some(manager) = this.upgrade() {
                manager.on_death(epoch);
            }
        }))
    }

    fn reconnect(&self) -> Result<Arc<dyn HostConnection>> {
        let connection = self.connector.connect()?;
        let mut state = self.state.lock();
        state.epoch += 1;
        self.watch(&connection, state.epoch)?;
        state.connection = Some(connection.clone());
        Ok(connection)
    }

    fn on_death(&self, epoch: u64) {
        let proxies: Vec<Arc<ProxyShared>> = {
            let mut state = self.state.lock();
            while state.recovering {
                self.recovered.wait(&mut state);
            }
            if state.epoch != epoch || state.connection.is_none() {
                debug!(epoch, "ignoring stale death notification");
                return;
            }
            state.connection = None;
            state.recovering = true;
            state.proxies.retain(|_, proxy| proxy.strong_count() > 0);
            state.proxies.values().filter_map(Weak::upgrade).collect()
        };
        warn!(epoch, proxies = proxies.len(), "session host died, recovering");

        let connection = if proxies.is_empty() {
            Err(Error::transport("no sessions to recover"))
        } else {
            self.reconnect()
        };
        if let Err(err) = &connection {
            if !proxies.is_empty() {
                error!(error = %err, "cannot reconnect to session host");
            }
        }

        let outcomes: Vec<(Arc<ProxyShared>, Result<()>)> = proxies
            .into_iter()
            .map(|proxy| {
                let outcome = match &connection {
                    Ok(connection) => proxy.recreate(connection),
                    Err(err) => Err(Error::transport(format!("host unavailable: {err}"))),
                };
                (proxy, outcome)
            })
            .collect();

        let orphaned = {
            let mut state = self.state.lock();
            state.recovering = false;
            if state.refs == 0 {
                state.connection.take()
            } else {
                None
            }
        };
        self.recovered.notify_all();
        if let Some(connection) = orphaned {
            connection.monitor().disarm();
            connection.close();
        }

        let recovered = outcomes.iter().filter(|(_, outcome)| outcome.is_ok()).count();
        info!(recovered, failed = outcomes.len() - recovered, "recovery finished");
        for (proxy, outcome) in outcomes {
            proxy.report_recovery(outcome);
        }
    }
}
