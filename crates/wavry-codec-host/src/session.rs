//! Server-side codec session.
//!
//! One session owns one platform codec plus the input and output processors
//! that feed it. Everything that mutates the session runs under a single lock;
//! events produced meanwhile are delivered once the lock is dropped.
//!
//! Lifecycle: `Unconfigured -> Configured -> Started <-> Flushing -> Stopped -> Released`.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use wavry_common::{
    BufferId, Direction, Error, InputTicket, MediaFormat, OutputRelease, Result, SampleInfo,
    SessionConfig, SessionEvent, SessionId, SlotId, SubmitRequest,
};
use wavry_media::{
    BufferPool, BufferPoolStats, CodecFactory, CodecFault, PlatformCallbacks, PlatformCodec,
    SharedMemory,
};

use crate::dispatch::{EventDispatcher, SessionEvents};
use crate::input::InputProcessor;
use crate::output::OutputProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unconfigured,
    Configured,
    Started,
    Flushing,
    Stopped,
    Released,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Point-in-time diagnostics for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    pub generation: u32,
    pub input_pool: BufferPoolStats,
    pub output_pool: BufferPoolStats,
    pub pending_inputs: usize,
    pub available_slots: usize,
    pub sent_outputs: usize,
}

struct SessionInner {
    state: SessionState,
    generation: u32,
    codec: Option<Box<dyn PlatformCodec>>,
    input: InputProcessor,
    output: OutputProcessor,
}

impl SessionInner {
    fn require(&self, allowed: &[SessionState], op: &str) -> Result<()> {
        if self.state == SessionState::Released {
            return Err(Error::SessionEnded);
        }
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::invalid_state(format!("cannot {op} a {} session", self.state)))
        }
    }

    fn codec(&mut self) -> Result<&mut (dyn PlatformCodec + 'static)> {
        self.codec
            .as_deref_mut()
            .ok_or_else(|| Error::invalid_state("session has no codec"))
    }
}

pub struct CodecSession {
    id: SessionId,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    events: EventDispatcher,
}

impl CodecSession {
    pub fn new(id: SessionId, config: SessionConfig, sink: Arc<dyn SessionEvents>) -> Arc<Self> {
        let max_input_size = config.format.max_input_size;
        let mut input_config = config.input_pool;
        if input_config.default_size == 0 {
            input_config.default_size = max_input_size.unwrap_or(0);
        }
        let input_pool = BufferPool::new(Direction::Input, input_config);
        let output_pool = if config.render_target.is_surface() {
            BufferPool::metadata_only(Direction::Output)
        } else {
            BufferPool::new(Direction::Output, config.output_pool)
        };

        Arc::new(Self {
            id,
            config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Unconfigured,
                generation: 0,
                codec: None,
                input: InputProcessor::new(input_pool).with_max_size(max_input_size),
                output: OutputProcessor::new(output_pool),
            }),
            events: EventDispatcher::new(id, sink),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn generation(&self) -> u32 {
        self.inner.lock().generation
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        SessionStats {
            state: inner.state,
            generation: inner.generation,
            input_pool: inner.input.pool_stats(),
            output_pool: inner.output.pool_stats(),
            pending_inputs: inner.input.pending(),
            available_slots: inner.input.available_slots(),
            sent_outputs: inner.output.sent(),
        }
    }

    /// Run `f` under the session lock, then deliver whatever it produced.
    fn locked<R>(&self, f: impl FnOnce(&mut SessionInner, &EventDispatcher) -> R) -> R {
        let result = {
            let mut inner = self.inner.lock();
            f(&mut inner, &self.events)
        };
        self.events.drain();
        result
    }

    /// Bind a platform codec created by `factory`.
    pub fn configure(self: &Arc<Self>, factory: &dyn CodecFactory) -> Result<()> {
        self.config.validate()?;
        let callbacks: Arc<dyn PlatformCallbacks> = Arc::new(SessionCallbacks {
            session: Arc::downgrade(self),
        });
        let config = self.config;

        self.locked(|inner, _| {
            inner.require(&[SessionState::Unconfigured], "configure")?;
            let mut codec = factory
                .create(&config.format, config.flags)
                .map_err(Error::codec)?;
            codec
                .configure(&config.format, config.render_target, config.flags, callbacks)
                .map_err(Error::codec)?;
            inner.codec = Some(codec);
            inner.state = SessionState::Configured;
            info!(session = %self.id, codec = ?config.format.codec, surface = config.render_target.is_surface(), "session configured");
            Ok(())
        })
    }

    pub fn start(&self) -> Result<()> {
        self.locked(|inner, _| {
            if inner.state == SessionState::Started {
                return Ok(());
            }
            inner.require(&[SessionState::Configured], "start")?;
            inner.codec()?.start().map_err(Error::codec)?;
            inner.input.start();
            inner.output.start();
            inner.state = SessionState::Started;
            info!(session = %self.id, "session started");
            Ok(())
        })
    }

    /// Discard all in-flight work and continue with a fresh generation.
    ///
    /// Returns the new generation. The session accepts input again as soon as
    /// this returns; no further `start` is needed.
    pub fn flush(&self) -> Result<u32> {
        self.locked(|inner, _| {
            inner.require(&[SessionState::Started], "flush")?;
            let SessionInner {
                state,
                generation,
                codec,
                input,
                output,
            } = inner;
            let Some(codec) = codec.as_deref_mut() else {
                return Err(Error::invalid_state("session has no codec"));
            };

            *state = SessionState::Flushing;
            input.stop();
            output.stop(codec);
            let restarted = codec.flush().and_then(|()| codec.start());

            *generation = generation.wrapping_add(1);
            output.pool_mut().clear();
            if let Err(err) = restarted {
                warn!(session = %self.id, error = %err, "codec did not survive flush");
                *state = SessionState::Stopped;
                return Err(Error::codec(err));
            }

            input.start();
            output.start();
            *state = SessionState::Started;
            debug!(session = %self.id, generation = *generation, "session flushed");
            Ok(*generation)
        })
    }

    /// Stop the codec but keep both pools for a later `release`.
    pub fn stop(&self) -> Result<()> {
        self.locked(|inner, _| {
            if inner.state == SessionState::Stopped {
                return Ok(());
            }
            inner.require(&[SessionState::Configured, SessionState::Started], "stop")?;
            Self::stop_locked(inner)?;
            info!(session = %self.id, "session stopped");
            Ok(())
        })
    }

    fn stop_locked(inner: &mut SessionInner) -> Result<()> {
        let SessionInner {
            codec,
            input,
            output,
            state,
            ..
        } = inner;
        input.stop();
        let stopped = match codec.as_deref_mut() {
            Some(codec) => {
                output.stop(codec);
                codec.stop().map_err(Error::codec)
            }
            None => Ok(()),
        };
        *state = SessionState::Stopped;
        stopped
    }

    /// Tear everything down. Safe to call any number of times.
    pub fn release(&self) {
        self.locked(|inner, _| {
            if inner.state == SessionState::Released {
                return;
            }
            if inner.state != SessionState::Stopped {
                if let Err(err) = Self::stop_locked(inner) {
                    debug!(session = %self.id, error = %err, "codec stop failed during release");
                }
            }
            if let Some(mut codec) = inner.codec.take() {
                codec.release();
            }
            inner.input.release();
            inner.output.pool_mut().clear();
            inner.state = SessionState::Released;
            info!(session = %self.id, "session released");
        })
    }

    pub fn allocate_input(&self, size: usize) -> Result<InputTicket> {
        self.locked(|inner, _| {
            inner.require(&[SessionState::Started], "allocate input for")?;
            let generation = inner.generation;
            inner.input.allocate(size, generation)
        })
    }

    pub fn submit_input(&self, request: SubmitRequest) -> Result<()> {
        self.locked(|inner, events| {
            inner.require(&[SessionState::Started], "submit input to")?;
            let generation = inner.generation;
            let SessionInner { codec, input, .. } = inner;
            let Some(codec) = codec.as_deref_mut() else {
                return Err(Error::invalid_state("session has no codec"));
            };
            input.submit(request, generation, codec, events)
        })
    }

    pub fn submit_end_of_stream(&self, timestamp_us: i64) -> Result<()> {
        self.locked(|inner, events| {
            inner.require(&[SessionState::Started], "submit input to")?;
            let SessionInner { codec, input, .. } = inner;
            let Some(codec) = codec.as_deref_mut() else {
                return Err(Error::invalid_state("session has no codec"));
            };
            input.submit_end_of_stream(timestamp_us, codec, events);
            Ok(())
        })
    }

    /// Give a delivered output back. Returns whether a platform slot was released.
    pub fn release_output(&self, release: OutputRelease) -> Result<bool> {
        self.locked(|inner, _| {
            if inner.state == SessionState::Released {
                return Err(Error::SessionEnded);
            }
            let generation = inner.generation;
            let SessionInner { codec, output, .. } = inner;
            match codec.as_deref_mut() {
                Some(codec) => output.release(release, generation, codec),
                None => Ok(false),
            }
        })
    }

    /// Resolve a buffer id to its shared memory so the client can map it.
    pub fn map_buffer(&self, direction: Direction, buffer: BufferId) -> Result<SharedMemory> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Released {
            return Err(Error::SessionEnded);
        }
        let pool = match direction {
            Direction::Input => inner.input.pool(),
            Direction::Output => inner.output.pool(),
        };
        pool.lookup(buffer)
            .ok_or_else(|| Error::not_found(format!("{direction:?} buffer {buffer}")))
    }

    fn on_input_slot_available(&self, slot: SlotId) {
        self.locked(|inner, events| {
            if inner.state != SessionState::Started {
                return;
            }
            let SessionInner { codec, input, .. } = inner;
            if let Some(codec) = codec.as_deref_mut() {
                input.on_slot_available(slot, codec, events);
            }
        })
    }

    fn on_output_available(&self, slot: SlotId, info: SampleInfo) {
        self.locked(|inner, events| {
            if inner.state != SessionState::Started {
                return;
            }
            let generation = inner.generation;
            let SessionInner { codec, output, .. } = inner;
            if let Some(codec) = codec.as_deref_mut() {
                output.on_output_available(slot, info, generation, codec, events);
            }
        })
    }

    fn on_format_changed(&self, format: MediaFormat) {
        self.locked(|inner, events| {
            if inner.state == SessionState::Started {
                info!(session = %self.id, ?format, "output format changed");
                inner.output.on_format_changed(format, events);
            }
        })
    }

    fn on_codec_error(&self, fault: CodecFault) {
        self.locked(|inner, events| {
            if inner.state == SessionState::Released {
                return;
            }
            warn!(session = %self.id, code = fault.code, recoverable = fault.recoverable, "codec reported an error");
            events.enqueue(SessionEvent::Error {
                fatal: !fault.recoverable,
            });
        })
    }
}

impl fmt::Debug for CodecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Routes platform callbacks to the session without keeping it alive.
struct SessionCallbacks {
    session: Weak<CodecSession>,
}

impl PlatformCallbacks for SessionCallbacks {
    fn on_input_slot_available(&self, slot: SlotId) {
        if let Some(session) = self.session.upgrade() {
            session.on_input_slot_available(slot);
        }
    }

    fn on_output_available(&self, slot: SlotId, info: SampleInfo) {
        if let Some(session) = self.session.upgrade() {
            session.on_output_available(slot, info);
        }
    }

    fn on_format_changed(&self, format: MediaFormat) {
        if let Some(session) = self.session.upgrade() {
            session.on_format_changed(format);
        }
    }

    fn on_error(&self, fault: CodecFault) {
        if let Some(session) = self.session.upgrade() {
            session.on_codec_error(fault);
        }
    }
}
