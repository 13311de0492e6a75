//! Client-side handle for a remote codec session.
//!
//! A [`CodecProxy`] forwards commands across the [`HostConnection`] and
//! demultiplexes the session's events back to the caller's
//! [`ProxyCallbacks`]. Buffer identities are mirrored lazily: a buffer is
//! mapped the first time it is seen and the mapping is cached until the next
//! flush.
//!
//! Two locks are involved. `state` guards bookkeeping and is never held across
//! a call to the host. `delivery` is held while a callback runs; `release`
//! takes it before marking the proxy inert, so once `release` returns no
//! callback is running and none will start.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, info, trace, warn};
use wavry_codec_host::SessionEvents;
use wavry_common::{
    BufferId, CodecCapability, CryptoInfo, Direction, Error, MediaFormat, OutputDescriptor,
    OutputRelease, Result, SampleInfo, SessionConfig, SessionEvent, SessionId, SessionToken,
    SubmitRequest,
};
use wavry_media::SharedMemory;

use crate::connection::HostConnection;
use crate::manager::ConnectionManager;

/// Callbacks a proxy delivers to the media pipeline.
pub trait ProxyCallbacks: Send + Sync {
    fn on_input_status(&self, timestamp_us: i64, processed: bool);
    fn on_output_format_changed(&self, format: MediaFormat);
    fn on_output(&self, sample: OutputSample, buffer: Option<OutputBuffer>);
    fn on_error(&self, fatal: bool);
}

/// An output handed to the caller; give it back with [`CodecProxy::release_output`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSample {
    pub session: SessionId,
    pub generation: u32,
    pub sequence: u64,
    pub info: SampleInfo,
}

/// Decoded bytes of an output, read in place from the host's shared memory.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    memory: SharedMemory,
    len: usize,
}

impl OutputBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        self.memory.read(0, self.len)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.memory.with_bytes(|bytes| f(&bytes[..self.len]))
    }
}

struct ProxyState {
    session: SessionId,
    connection: Option<Arc<dyn HostConnection>>,
    generation: u32,
    /// Input submitted since the last flush.
    dirty: bool,
    inert: bool,
    /// The host died and the session could not be recreated.
    broken: bool,
    input_buffers: HashMap<BufferId, SharedMemory>,
    output_buffers: HashMap<BufferId, SharedMemory>,
    /// Surface outputs delivered and not yet released, by sequence.
    surface_queue: VecDeque<u64>,
}

impl ProxyState {
    fn new(session: SessionId, connection: Arc<dyn HostConnection>) -> Self {
        Self {
            session,
            connection: Some(connection),
            generation: 0,
            dirty: false,
            inert: false,
            broken: false,
            input_buffers: HashMap::new(),
            output_buffers: HashMap::new(),
            surface_queue: VecDeque::new(),
        }
    }

    fn forget_buffers(&mut self) {
        self.input_buffers.clear();
        self.output_buffers.clear();
        self.surface_queue.clear();
    }
}

/// Cache a mapping, evicting any older generation of the same slot.
fn cache_mapping(
    cache: &mut HashMap<BufferId, SharedMemory>,
    id: BufferId,
    memory: SharedMemory,
) {
    cache.retain(|cached, _| cached.index != id.index);
    cache.insert(id, memory);
}

pub(crate) struct ProxyShared {
    key: u64,
    manager: Arc<ConnectionManager>,
    config: SessionConfig,
    capability: CodecCapability,
    callbacks: Arc<dyn ProxyCallbacks>,
    delivery: ReentrantMutex<()>,
    /// Keeps allocate and submit of one input adjacent on the host.
    submit: Mutex<()>,
    state: Mutex<ProxyState>,
    this: Weak<ProxyShared>,
}

struct ProxyEvents {
    proxy: Weak<ProxyShared>,
}

impl SessionEvents for ProxyEvents {
    fn on_event(&self, session: SessionId, event: SessionEvent) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.handle_event(session, event);
        }
    }
}

impl ProxyShared {
    fn events(&self) -> Arc<dyn SessionEvents> {
        Arc::new(ProxyEvents {
            proxy: self.this.clone(),
        })
    }

    fn connection(&self) -> Result<(Arc<dyn HostConnection>, SessionId)> {
        let state = self.state.lock();
        if state.inert {
            return Err(Error::SessionEnded);
        }
        if state.broken {
            return Err(Error::transport("session was lost with its host"));
        }
        let connection = state
            .connection
            .clone()
            .ok_or_else(|| Error::transport("proxy is not connected"))?;
        Ok((connection, state.session))
    }

    /// Whether events from `session` should still reach the caller.
    fn accepts(&self, session: SessionId) -> bool {
        let state = self.state.lock();
        !state.inert && state.session == session
    }

    fn handle_event(&self, session: SessionId, event: SessionEvent) {
        let _delivery = self.delivery.lock();
        match event {
            SessionEvent::InputStatus {
                timestamp_us,
                processed,
            } => {
                if self.accepts(session) {
                    self.callbacks.on_input_status(timestamp_us, processed);
                }
            }
            SessionEvent::FormatChanged { format } => {
                if self.accepts(session) {
                    self.callbacks.on_output_format_changed(format);
                }
            }
            SessionEvent::Output { output } => self.deliver_output(session, output),
            SessionEvent::Error { fatal } => {
                if self.accepts(session) {
                    if fatal {
                        warn!(%session, "session reported a fatal error");
                    }
                    self.callbacks.on_error(fatal);
                }
            }
        }
    }

    fn deliver_output(&self, session: SessionId, output: OutputDescriptor) {
        let (connection, cached) = {
            let mut state = self.state.lock();
            if state.inert || state.session != session {
                return;
            }
            if output.generation < state.generation {
                trace!(%session, sequence = output.sequence, "dropping output from a previous generation");
                return;
            }
            state.generation = output.generation;
            let cached = output
                .buffer
                .and_then(|id| state.output_buffers.get(&id).cloned());
            (state.connection.clone(), cached)
        };

        let memory = match (output.buffer, cached) {
            (None, _) => None,
            (Some(_), Some(memory)) => Some(memory),
            (Some(id), None) => {
                let mapped = connection
                    .ok_or_else(|| Error::transport("proxy is not connected"))
                    .and_then(|connection| connection.map_buffer(session, Direction::Output, id));
                match mapped {
                    Ok(memory) => Some(memory),
                    Err(Error::TransportLost(reason)) => {
                        debug!(%session, %reason, "host gone before output could be mapped");
                        return;
                    }
                    // A flush or release on another thread retired the buffer.
                    Err(err @ (Error::NotFound(_) | Error::SessionEnded)) => {
                        debug!(%session, buffer = %id, error = %err, "output retired before mapping");
                        return;
                    }
                    Err(err) => {
                        if !self.still_current(session, output.generation) {
                            debug!(%session, buffer = %id, error = %err, "stale output failed to map");
                            return;
                        }
                        error!(%session, buffer = %id, error = %err, "cannot map output buffer");
                        self.callbacks.on_error(true);
                        return;
                    }
                }
            }
        };

        {
            let mut state = self.state.lock();
            if state.inert || state.session != session {
                return;
            }
            if output.generation < state.generation {
                trace!(%session, sequence = output.sequence, "output flushed while it was mapped");
                return;
            }
            if let (Some(id), Some(memory)) = (output.buffer, &memory) {
                cache_mapping(&mut state.output_buffers, id, memory.clone());
            }
            if self.config.render_target.is_surface() {
                state.surface_queue.push_back(output.sequence);
            }
        }

        let sample = OutputSample {
            session,
            generation: output.generation,
            sequence: output.sequence,
            info: output.info,
        };
        let buffer = memory.map(|memory| OutputBuffer {
            memory,
            len: output.info.size,
        });
        self.callbacks.on_output(sample, buffer);
    }

    fn input_memory(
        &self,
        connection: &Arc<dyn HostConnection>,
        session: SessionId,
        buffer: BufferId,
    ) -> Result<SharedMemory> {
        if let Some(memory) = self.state.lock().input_buffers.get(&buffer).cloned() {
            return Ok(memory);
        }
        let memory = connection.map_buffer(session, Direction::Input, buffer)?;
        let mut state = self.state.lock();
        if state.session == session {
            cache_mapping(&mut state.input_buffers, buffer, memory.clone());
        }
        Ok(memory)
    }

    fn still_current(&self, session: SessionId, generation: u32) -> bool {
        let state = self.state.lock();
        !state.inert && state.session == session && generation >= state.generation
    }

    /// Recreate the remote session on a new connection after the host died.
    pub(crate) fn recreate(&self, connection: &Arc<dyn HostConnection>) -> Result<()> {
        let _delivery = self.delivery.lock();
        if self.state.lock().inert {
            return Ok(());
        }

        let session = SessionId::new();
        connection.create_session(session, &self.config, self.events())?;

        let mut state = self.state.lock();
        let previous = state.session;
        state.session = session;
        state.connection = Some(connection.clone());
        state.generation = 0;
        state.dirty = false;
        state.broken = false;
        state.forget_buffers();
        info!(%previous, %session, "codec session recreated");
        Ok(())
    }

    /// Tell the caller how recovery went: a discontinuity, or the end.
    pub(crate) fn report_recovery(&self, outcome: Result<()>) {
        let _delivery = self.delivery.lock();
        {
            let mut state = self.state.lock();
            if state.inert {
                return;
            }
            if let Err(err) = &outcome {
                error!(session = %state.session, error = %err, "codec session could not be recovered");
                state.broken = true;
                state.connection = None;
                state.forget_buffers();
            }
        }
        self.callbacks.on_error(outcome.is_err());
    }
}

/// Caller-visible handle to a codec session running in the host process.
pub struct CodecProxy {
    shared: Arc<ProxyShared>,
}

impl CodecProxy {
    /// Create a session configured by `config`, connecting to the host if needed.
    pub fn create(
        manager: &Arc<ConnectionManager>,
        config: SessionConfig,
        callbacks: Arc<dyn ProxyCallbacks>,
    ) -> Result<Self> {
        config.validate()?;
        let (connection, epoch) = manager.acquire()?;
        match Self::open(manager, connection, epoch, config, callbacks) {
            Ok(proxy) => Ok(proxy),
            Err(err) => {
                manager.release_connection();
                Err(err)
            }
        }
    }

    fn open(
        manager: &Arc<ConnectionManager>,
        connection: Arc<dyn HostConnection>,
        epoch: u64,
        config: SessionConfig,
        callbacks: Arc<dyn ProxyCallbacks>,
    ) -> Result<Self> {
        let codec = config.format.codec;
        let capability = connection
            .capabilities()?
            .into_iter()
            .find(|cap| cap.codec == codec)
            .ok_or_else(|| Error::codec(format!("session host has no {codec:?} codec")))?;

        let session = SessionId::new();
        let key = manager.next_key();
        let shared = Arc::new_cyclic(|this| ProxyShared {
            key,
            manager: manager.clone(),
            config,
            capability,
            callbacks,
            delivery: ReentrantMutex::new(()),
            submit: Mutex::new(()),
            state: Mutex::new(ProxyState::new(session, connection.clone())),
            this: this.clone(),
        });

        connection.create_session(session, &config, shared.events())?;
        if !manager.register(key, &shared, epoch) {
            if let Err(err) = connection.destroy_session(session) {
                debug!(%session, error = %err, "session vanished with its host");
            }
            return Err(Error::transport("session host died while the session was created"));
        }

        info!(%session, ?codec, surface = config.render_target.is_surface(), "codec proxy created");
        Ok(Self { shared })
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.state.lock().session
    }

    pub fn generation(&self) -> u32 {
        self.shared.state.lock().generation
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn is_released(&self) -> bool {
        self.shared.state.lock().inert
    }

    pub fn is_adaptive_playback_supported(&self) -> bool {
        self.shared.capability.adaptive_playback
    }

    pub fn is_tunneled_playback_supported(&self) -> bool {
        self.shared.capability.tunneled_playback
    }

    /// Whether `token` was issued by the current session and generation.
    pub fn is_current(&self, token: SessionToken) -> bool {
        let state = self.shared.state.lock();
        !state.inert && token.session == state.session && token.generation == state.generation
    }

    /// Queue one sample. An empty end-of-stream sample needs no buffer.
    ///
    /// The returned token goes stale once the session is flushed or recreated.
    pub fn input(
        &self,
        data: &[u8],
        info: SampleInfo,
        crypto: Option<CryptoInfo>,
    ) -> Result<SessionToken> {
        let shared = &self.shared;
        let _submit = shared.submit.lock();
        let (connection, session) = shared.connection()?;

        let generation = if data.is_empty() && info.is_end_of_stream() {
            connection.submit_end_of_stream(session, info.timestamp_us)?;
            shared.state.lock().generation
        } else {
            let ticket = connection.allocate_input(session, data.len())?;
            let memory = shared.input_memory(&connection, session, ticket.buffer)?;
            memory.write(0, data)?;
            connection.submit_input(
                session,
                SubmitRequest {
                    buffer: ticket.buffer,
                    generation: ticket.generation,
                    info: SampleInfo {
                        offset: 0,
                        size: data.len(),
                        ..info
                    },
                    crypto,
                },
            )?;
            ticket.generation
        };

        let mut state = shared.state.lock();
        if state.session == session {
            state.dirty = true;
        }
        Ok(SessionToken {
            session,
            generation,
        })
    }

    /// Discard everything queued so far. A no-op when nothing was submitted since the last flush.
    pub fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        let _submit = shared.submit.lock();
        if !shared.state.lock().dirty {
            trace!("nothing to flush");
            return Ok(());
        }
        let (connection, session) = shared.connection()?;

        let generation = connection.flush(session)?;
        let mut state = shared.state.lock();
        if state.session == session {
            state.forget_buffers();
            state.generation = generation;
            state.dirty = false;
        }
        debug!(%session, generation, "proxy flushed");
        Ok(())
    }

    /// Give an output back, optionally rendering it.
    ///
    /// Outputs must be released in the order they were delivered. Releasing an
    /// output twice, or one from before a flush or recovery, does nothing.
    pub fn release_output(&self, sample: &OutputSample, render: bool) -> Result<()> {
        let shared = &self.shared;
        let (connection, session) = {
            let mut state = shared.state.lock();
            if state.inert {
                return Ok(());
            }
            if sample.session != state.session || sample.generation != state.generation {
                trace!(sequence = sample.sequence, "ignoring release of a stale output");
                return Ok(());
            }
            if shared.config.render_target.is_surface() {
                match state.surface_queue.iter().position(|&seq| seq == sample.sequence) {
                    None => {
                        trace!(sequence = sample.sequence, "surface output already released");
                        return Ok(());
                    }
                    Some(0) => {
                        state.surface_queue.pop_front();
                    }
                    Some(_) => {
                        return Err(Error::invalid_state(format!(
                            "surface output {} released out of order",
                            sample.sequence
                        )));
                    }
                }
            }
            match state.connection.clone() {
                Some(connection) => (connection, state.session),
                None => return Ok(()),
            }
        };

        connection.release_output(
            session,
            OutputRelease {
                sequence: sample.sequence,
                generation: sample.generation,
                render,
            },
        )?;
        Ok(())
    }

    /// Tear the session down. Returns `false` if it was already released.
    ///
    /// No callback is delivered once this returns.
    pub fn release(&self) -> bool {
        let shared = &self.shared;
        let (connection, session) = {
            let _delivery = shared.delivery.lock();
            let mut state = shared.state.lock();
            if state.inert {
                return false;
            }
            state.inert = true;
            state.forget_buffers();
            (state.connection.take(), state.session)
        };

        shared.manager.unregister(shared.key);
        if let Some(connection) = connection {
            if let Err(err) = connection.destroy_session(session) {
                debug!(%session, error = %err, "remote session already gone");
            }
        }
        shared.manager.release_connection();
        info!(%session, "codec proxy released");
        true
    }
}

impl Drop for CodecProxy {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CodecProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CodecProxy")
            .field("session", &state.session)
            .field("generation", &state.generation)
            .field("released", &state.inert)
            .finish()
    }
}
