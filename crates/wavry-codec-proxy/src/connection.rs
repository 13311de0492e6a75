//! The boundary between a proxy and the process hosting its sessions.
//!
//! [`HostConnection`] is the whole command surface a proxy uses. Payload bytes
//! never travel through it: buffers are shared memory regions the proxy maps
//! once and then writes or reads in place. [`LocalConnection`] hosts the
//! sessions in-process and delivers their events on a dedicated thread, the
//! way a real transport would.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use wavry_codec_host::{SessionEvents, SessionHost};
use wavry_common::{
    BufferId, CodecCapability, Direction, Error, HostConfig, InputTicket, OutputRelease, Result,
    SessionConfig, SessionEvent, SessionId, SubmitRequest,
};
use wavry_media::{CodecFactory, SharedMemory};

use crate::monitor::{DeathLink, LivenessMonitor};

pub trait HostConnection: Send + Sync {
    /// Create, configure and start a session whose events go to `events`.
    fn create_session(
        &self,
        id: SessionId,
        config: &SessionConfig,
        events: Arc<dyn SessionEvents>,
    ) -> Result<()>;

    fn allocate_input(&self, session: SessionId, size: usize) -> Result<InputTicket>;

    fn map_buffer(
        &self,
        session: SessionId,
        direction: Direction,
        buffer: BufferId,
    ) -> Result<SharedMemory>;

    fn submit_input(&self, session: SessionId, request: SubmitRequest) -> Result<()>;

    fn submit_end_of_stream(&self, session: SessionId, timestamp_us: i64) -> Result<()>;

    /// Flush the session; returns its new generation.
    fn flush(&self, session: SessionId) -> Result<u32>;

    fn release_output(&self, session: SessionId, release: OutputRelease) -> Result<bool>;

    fn destroy_session(&self, session: SessionId) -> Result<()>;

    fn capabilities(&self) -> Result<Vec<CodecCapability>>;

    fn monitor(&self) -> Arc<dyn LivenessMonitor>;

    /// Intentionally tear the connection down. Does not count as a death.
    fn close(&self);
}

/// Establishes connections to a session host.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn HostConnection>>;
}

enum Delivery {
    Event {
        session: SessionId,
        event: SessionEvent,
        target: Arc<dyn SessionEvents>,
    },
    Sync(Sender<()>),
    Stop,
}

/// Forwards one session's events to the delivery thread.
struct ChannelEvents {
    alive: Arc<AtomicBool>,
    tx: Sender<Delivery>,
    target: Arc<dyn SessionEvents>,
}

impl SessionEvents for ChannelEvents {
    fn on_event(&self, session: SessionId, event: SessionEvent) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let delivery = Delivery::Event {
            session,
            event,
            target: self.target.clone(),
        };
        if self.tx.send(delivery).is_err() {
            trace!(%session, "event delivery already stopped");
        }
    }
}

fn deliver(rx: Receiver<Delivery>, alive: Arc<AtomicBool>) {
    for delivery in rx {
        match delivery {
            Delivery::Event {
                session,
                event,
                target,
            } => {
                if alive.load(Ordering::Acquire) {
                    target.on_event(session, event);
                } else {
                    trace!(%session, "dropping event from a dead host");
                }
            }
            Delivery::Sync(done) => {
                let _ = done.send(());
            }
            Delivery::Stop => break,
        }
    }
    debug!("event delivery stopped");
}

/// Connection to a [`SessionHost`] running in this process.
pub struct LocalConnection {
    id: u64,
    host: Arc<SessionHost>,
    link: Arc<DeathLink>,
    alive: Arc<AtomicBool>,
    tx: Sender<Delivery>,
}

impl LocalConnection {
    pub fn new(id: u64, config: HostConfig, factory: Arc<dyn CodecFactory>) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let gate = alive.clone();
        thread::Builder::new()
            .name(format!("codec-events-{id}"))
            .spawn(move || deliver(rx, gate))?;

        Ok(Arc::new(Self {
            id,
            host: Arc::new(SessionHost::new(config, factory)),
            link: Arc::new(DeathLink::new()),
            alive,
            tx,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &Arc<SessionHost> {
        &self.host
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Simulate the host process dying: its sessions vanish, undelivered
    /// events are dropped and the death link fires.
    pub fn kill(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!(connection = self.id, "session host killed");
        self.host.shutdown();
        let _ = self.tx.send(Delivery::Stop);
        self.link.notify_death();
    }

    /// Block until every event produced so far has been delivered.
    pub fn sync(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.tx.send(Delivery::Sync(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    fn call<R>(&self, f: impl FnOnce(&SessionHost) -> Result<R>) -> Result<R> {
        if !self.is_alive() {
            return Err(Error::transport(format!("connection {} is down", self.id)));
        }
        f(&self.host).map_err(|err| {
            if self.is_alive() {
                err
            } else {
                Error::transport(format!("connection {} lost mid-call: {err}", self.id))
            }
        })
    }
}

impl HostConnection for LocalConnection {
    fn create_session(
        &self,
        id: SessionId,
        config: &SessionConfig,
        events: Arc<dyn SessionEvents>,
    ) -> Result<()> {
        let events: Arc<dyn SessionEvents> = Arc::new(ChannelEvents {
            alive: self.alive.clone(),
            tx: self.tx.clone(),
            target: events,
        });
        self.call(|host| host.create_session(id, *config, events).map(|_| ()))
    }

    fn allocate_input(&self, session: SessionId, size: usize) -> Result<InputTicket> {
        self.call(|host| host.session(session)?.allocate_input(size))
    }

    fn map_buffer(
        &self,
        session: SessionId,
        direction: Direction,
        buffer: BufferId,
    ) -> Result<SharedMemory> {
        self.call(|host| host.session(session)?.map_buffer(direction, buffer))
    }

    fn submit_input(&self, session: SessionId, request: SubmitRequest) -> Result<()> {
        self.call(|host| host.session(session)?.submit_input(request))
    }

    fn submit_end_of_stream(&self, session: SessionId, timestamp_us: i64) -> Result<()> {
        self.call(|host| host.session(session)?.submit_end_of_stream(timestamp_us))
    }

    fn flush(&self, session: SessionId) -> Result<u32> {
        self.call(|host| host.session(session)?.flush())
    }

    fn release_output(&self, session: SessionId, release: OutputRelease) -> Result<bool> {
        self.call(|host| host.session(session)?.release_output(release))
    }

    fn destroy_session(&self, session: SessionId) -> Result<()> {
        self.call(|host| host.destroy_session(session))
    }

    fn capabilities(&self) -> Result<Vec<CodecCapability>> {
        self.call(|host| Ok(host.capabilities()))
    }

    fn monitor(&self) -> Arc<dyn LivenessMonitor> {
        self.link.clone()
    }

    fn close(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.link.disarm();
        self.host.shutdown();
        let _ = self.tx.send(Delivery::Stop);
        info!(connection = self.id, "connection closed");
    }
}

/// Starts a fresh in-process host for every connection.
pub struct LocalConnector {
    config: HostConfig,
    factory: Arc<dyn CodecFactory>,
    connections: Mutex<Vec<Arc<LocalConnection>>>,
    refusals: AtomicUsize,
    next_id: AtomicU64,
}

impl LocalConnector {
    pub fn new(factory: Arc<dyn CodecFactory>, config: HostConfig) -> Self {
        Self {
            config,
            factory,
            connections: Mutex::new(Vec::new()),
            refusals: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make the next `count` connection attempts fail, as if no host could be started.
    pub fn refuse_connections(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Every connection made so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<LocalConnection>> {
        self.connections.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<LocalConnection>> {
        self.connections.lock().last().cloned()
    }

    /// Wait for pending events on every live connection.
    pub fn sync(&self) {
        for connection in self.connections() {
            if connection.is_alive() {
                connection.sync();
            }
        }
    }
}

impl Connector for LocalConnector {
    fn connect(&self) -> Result<Arc<dyn HostConnection>> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::transport("session host refused the connection"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = LocalConnection::new(id, self.config, self.factory.clone())?;
        self.connections.lock().push(connection.clone());
        debug!(connection = id, "connected to local session host");
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavry_media::LoopbackCodecFactory;

    #[derive(Default)]
    struct Counter {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl SessionEvents for Counter {
        fn on_event(&self, _session: SessionId, event: SessionEvent) {
            self.events.lock().push(event);
        }
    }

    fn connector() -> (LocalConnector, Arc<LoopbackCodecFactory>) {
        let factory = Arc::new(LoopbackCodecFactory::default());
        (LocalConnector::new(factory.clone(), HostConfig::default()), factory)
    }

    #[test]
    fn test_events_arrive_on_delivery_thread() {
        let (connector, factory) = connector();
        let connection = connector.connect().unwrap();
        let counter = Arc::new(Counter::default());
        let id = SessionId::new();
        connection
            .create_session(id, &SessionConfig::default(), counter.clone())
            .unwrap();

        factory.pump_all();
        let ticket = connection.allocate_input(id, 4).unwrap();
        connection
            .map_buffer(id, Direction::Input, ticket.buffer)
            .unwrap()
            .write(0, b"data")
            .unwrap();
        connection
            .submit_input(
                id,
                SubmitRequest {
                    buffer: ticket.buffer,
                    generation: ticket.generation,
                    info: wavry_common::SampleInfo::new(0, 4, wavry_common::SampleFlags::empty()),
                    crypto: None,
                },
            )
            .unwrap();
        factory.pump_all();
        connector.sync();

        let events = counter.events.lock();
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::Output { .. })));
    }

    #[test]
    fn test_kill_fires_death_and_fails_calls() {
        let (connector, _factory) = connector();
        let connection = connector.connect().unwrap();
        let id = SessionId::new();
        connection
            .create_session(id, &SessionConfig::default(), Arc::new(Counter::default()))
            .unwrap();

        let died = Arc::new(AtomicBool::new(false));
        let flag = died.clone();
        connection
            .monitor()
            .watch(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();

        let local = connector.latest().unwrap();
        local.kill();
        local.kill();
        assert!(died.load(Ordering::SeqCst));
        assert!(local.host().is_empty());
        assert!(matches!(
            connection.allocate_input(id, 8),
            Err(Error::TransportLost(_))
        ));
        // Waiting on a dead connection returns at once
        local.sync();
    }

    #[test]
    fn test_close_is_not_a_death() {
        let (connector, _factory) = connector();
        let connection = connector.connect().unwrap();
        let died = Arc::new(AtomicBool::new(false));
        let flag = died.clone();
        connection
            .monitor()
            .watch(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();

        connection.close();
        connector.latest().unwrap().kill();
        assert!(!died.load(Ordering::SeqCst));
        assert!(connection.capabilities().is_err());
    }

    #[test]
    fn test_refused_connections() {
        let (connector, _factory) = connector();
        connector.refuse_connections(1);
        assert!(matches!(connector.connect(), Err(Error::TransportLost(_))));
        assert!(connector.connect().is_ok());
        assert_eq!(connector.connections().len(), 1);
    }
}
