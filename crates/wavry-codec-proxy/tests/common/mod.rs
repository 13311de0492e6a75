//! Shared rig for the proxy integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use wavry_codec_host::SessionEvents;
use wavry_codec_proxy::{
    CodecProxy, ConnectionManager, Connector, HostConnection, LivenessMonitor, LocalConnection,
    LocalConnector, OutputBuffer, OutputSample, ProxyCallbacks,
};
use wavry_common::{
    BufferId, CodecCapability, Direction, HostConfig, InputTicket, MediaFormat, OutputRelease,
    Result, SampleFlags, SampleInfo, SessionConfig, SessionId, SubmitRequest,
};
use wavry_media::{LoopbackCodecFactory, LoopbackConfig, SharedMemory};

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    InputStatus { timestamp_us: i64, processed: bool },
    FormatChanged(MediaFormat),
    Output { sample: OutputSample, payload: Option<Bytes> },
    Error { fatal: bool },
}

/// Records every callback. Optionally releases each output as it arrives.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
    releaser: OnceLock<Weak<CodecProxy>>,
}

impl Recorder {
    pub fn release_outputs_through(&self, proxy: &Arc<CodecProxy>) {
        let _ = self.releaser.set(Arc::downgrade(proxy));
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    pub fn outputs(&self) -> Vec<(OutputSample, Option<Bytes>)> {
        self.seen
            .lock()
            .iter()
            .filter_map(|seen| match seen {
                Seen::Output { sample, payload } => Some((*sample, payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn samples(&self) -> Vec<OutputSample> {
        self.outputs().into_iter().map(|(sample, _)| sample).collect()
    }

    pub fn errors(&self) -> Vec<bool> {
        self.seen
            .lock()
            .iter()
            .filter_map(|seen| match seen {
                Seen::Error { fatal } => Some(*fatal),
                _ => None,
            })
            .collect()
    }

    pub fn input_statuses(&self) -> Vec<(i64, bool)> {
        self.seen
            .lock()
            .iter()
            .filter_map(|seen| match seen {
                Seen::InputStatus {
                    timestamp_us,
                    processed,
                } => Some((*timestamp_us, *processed)),
                _ => None,
            })
            .collect()
    }
}

impl ProxyCallbacks for Recorder {
    fn on_input_status(&self, timestamp_us: i64, processed: bool) {
        self.seen.lock().push(Seen::InputStatus {
            timestamp_us,
            processed,
        });
    }

    fn on_output_format_changed(&self, format: MediaFormat) {
        self.seen.lock().push(Seen::FormatChanged(format));
    }

    fn on_output(&self, sample: OutputSample, buffer: Option<OutputBuffer>) {
        let payload = buffer.map(|buffer| buffer.to_bytes().unwrap());
        self.seen.lock().push(Seen::Output { sample, payload });
        if let Some(proxy) = self.releaser.get().and_then(Weak::upgrade) {
            proxy.release_output(&sample, true).unwrap();
        }
    }

    fn on_error(&self, fatal: bool) {
        self.seen.lock().push(Seen::Error { fatal });
    }
}

pub struct Rig {
    pub factory: Arc<LoopbackCodecFactory>,
    pub connector: Arc<LocalConnector>,
    pub manager: Arc<ConnectionManager>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_loopback(LoopbackConfig::default())
    }

    pub fn with_loopback(config: LoopbackConfig) -> Self {
        let factory = Arc::new(LoopbackCodecFactory::new(config));
        let connector = Arc::new(LocalConnector::new(factory.clone(), HostConfig::default()));
        let manager = ConnectionManager::new(connector.clone());
        Self {
            factory,
            connector,
            manager,
        }
    }

    /// A rig whose proxies stop at `gate` the first time they map an output.
    pub fn with_output_gate(hold: Hold) -> (Self, Arc<OutputGate>) {
        let factory = Arc::new(LoopbackCodecFactory::new(LoopbackConfig::default()));
        let connector = Arc::new(LocalConnector::new(factory.clone(), HostConfig::default()));
        let gate = Arc::new(OutputGate::new(hold));
        let manager = ConnectionManager::new(Arc::new(GatedConnector {
            inner: connector.clone(),
            gate: gate.clone(),
        }));
        let rig = Self {
            factory,
            connector,
            manager,
        };
        (rig, gate)
    }

    pub fn proxy(&self, config: SessionConfig) -> (CodecProxy, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let proxy = CodecProxy::create(&self.manager, config, recorder.clone()).unwrap();
        (proxy, recorder)
    }

    /// Run codec callbacks and event delivery until everything is quiet.
    pub fn settle(&self) {
        loop {
            self.connector.sync();
            let delivered = self.factory.pump_all();
            self.connector.sync();
            if delivered == 0 && self.factory.pump_all() == 0 {
                return;
            }
        }
    }

    pub fn latest(&self) -> Arc<LocalConnection> {
        self.connector.latest().unwrap()
    }
}

/// Where the first output mapping stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    BeforeMap,
    AfterMap,
}

/// Parks the event delivery thread inside the first output mapping until the
/// test lets it go. Call [`OutputGate::wait_entered`] then [`OutputGate::open`].
pub struct OutputGate {
    hold: Hold,
    armed: AtomicBool,
    barrier: Barrier,
}

impl OutputGate {
    fn new(hold: Hold) -> Self {
        Self {
            hold,
            armed: AtomicBool::new(true),
            barrier: Barrier::new(2),
        }
    }

    /// Block until the delivery thread is parked at the gate.
    pub fn wait_entered(&self) {
        self.barrier.wait();
    }

    pub fn open(&self) {
        self.barrier.wait();
    }

    fn pass(&self) {
        self.barrier.wait();
        self.barrier.wait();
    }
}

struct GatedConnector {
    inner: Arc<LocalConnector>,
    gate: Arc<OutputGate>,
}

impl Connector for GatedConnector {
    fn connect(&self) -> Result<Arc<dyn HostConnection>> {
        let inner = self.inner.connect()?;
        Ok(Arc::new(GatedConnection {
            inner,
            gate: self.gate.clone(),
        }))
    }
}

struct GatedConnection {
    inner: Arc<dyn HostConnection>,
    gate: Arc<OutputGate>,
}

impl HostConnection for GatedConnection {
    fn create_session(
        &self,
        id: SessionId,
        config: &SessionConfig,
        events: Arc<dyn SessionEvents>,
    ) -> Result<()> {
        self.inner.create_session(id, config, events)
    }

    fn allocate_input(&self, session: SessionId, size: usize) -> Result<InputTicket> {
        self.inner.allocate_input(session, size)
    }

    fn map_buffer(
        &self,
        session: SessionId,
        direction: Direction,
        buffer: BufferId,
    ) -> Result<SharedMemory> {
        let gated =
            direction == Direction::Output && self.gate.armed.swap(false, Ordering::SeqCst);
        if !gated {
            return self.inner.map_buffer(session, direction, buffer);
        }
        match self.gate.hold {
            Hold::BeforeMap => {
                self.gate.pass();
                self.inner.map_buffer(session, direction, buffer)
            }
            Hold::AfterMap => {
                let mapped = self.inner.map_buffer(session, direction, buffer);
                self.gate.pass();
                mapped
            }
        }
    }

    fn submit_input(&self, session: SessionId, request: SubmitRequest) -> Result<()> {
        self.inner.submit_input(session, request)
    }

    fn submit_end_of_stream(&self, session: SessionId, timestamp_us: i64) -> Result<()> {
        self.inner.submit_end_of_stream(session, timestamp_us)
    }

    fn flush(&self, session: SessionId) -> Result<u32> {
        self.inner.flush(session)
    }

    fn release_output(&self, session: SessionId, release: OutputRelease) -> Result<bool> {
        self.inner.release_output(session, release)
    }

    fn destroy_session(&self, session: SessionId) -> Result<()> {
        self.inner.destroy_session(session)
    }

    fn capabilities(&self) -> Result<Vec<CodecCapability>> {
        self.inner.capabilities()
    }

    fn monitor(&self) -> Arc<dyn LivenessMonitor> {
        self.inner.monitor()
    }

    fn close(&self) {
        self.inner.close()
    }
}

pub fn frame(timestamp_us: i64) -> SampleInfo {
    SampleInfo::new(timestamp_us, 0, SampleFlags::empty())
}

pub fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}
