//! Output side of a codec session.
//!
//! Every output the platform produces is copied into a pooled buffer (or, when
//! rendering to a surface, described by metadata alone), remembered in the
//! sent queue and handed to the client. The client gives outputs back in the
//! order it received them.

use std::collections::VecDeque;

use tracing::{debug, error, trace, warn};
use wavry_common::{
    Error, MediaFormat, OutputDescriptor, OutputRelease, Result, SampleFlags, SampleInfo,
    SessionEvent, SlotId,
};
use wavry_media::{BufferPool, BufferPoolStats, PlatformCodec, PoolMode, Sample};

use crate::dispatch::EventDispatcher;

struct SentOutput {
    sequence: u64,
    slot: SlotId,
    sample: Sample,
}

pub struct OutputProcessor {
    pool: BufferPool,
    sent: VecDeque<SentOutput>,
    next_sequence: u64,
    stopped: bool,
    capacity_learned: bool,
}

impl OutputProcessor {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            sent: VecDeque::new(),
            next_sequence: 0,
            stopped: true,
            capacity_learned: false,
        }
    }

    pub fn start(&mut self) {
        self.stopped = false;
    }

    /// Hand every outstanding platform slot back unrendered and recycle its buffer.
    pub fn stop(&mut self, codec: &mut dyn PlatformCodec) {
        let outstanding = self.sent.len();
        for mut sent in self.sent.drain(..) {
            if let Err(err) = codec.release_output(sent.slot, false) {
                debug!(slot = %sent.slot, error = %err, "output slot already gone");
            }
            if let Some(buffer) = sent.sample.take_buffer() {
                self.pool.recycle(buffer);
            }
        }
        self.stopped = true;
        if outstanding > 0 {
            debug!(outstanding, "output stopped with unreleased outputs");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn renders_to_surface(&self) -> bool {
        self.pool.mode() == PoolMode::MetadataOnly
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    /// Outputs delivered and not yet released.
    pub fn sent(&self) -> usize {
        self.sent.len()
    }

    pub fn on_output_available(
        &mut self,
        slot: SlotId,
        info: SampleInfo,
        generation: u32,
        codec: &mut dyn PlatformCodec,
        events: &EventDispatcher,
    ) {
        if self.stopped {
            trace!(%slot, "output stopped, ignoring output");
            return;
        }
        if self.sent.iter().any(|sent| sent.slot == slot) {
            debug!(%slot, "ignoring duplicate output slot");
            return;
        }
        if info.flags.contains(SampleFlags::DECODE_ONLY) {
            trace!(%slot, timestamp_us = info.timestamp_us, "decode-only output, not delivered");
            if let Err(err) = codec.release_output(slot, false) {
                debug!(%slot, error = %err, "output slot already gone");
            }
            return;
        }
        let Some(platform) = codec.output_buffer(slot) else {
            debug!(%slot, "dropping stale output slot");
            return;
        };

        let sample = match self.pool.mode() {
            PoolMode::MetadataOnly => Ok(Sample::without_buffer(info)),
            PoolMode::Backed => {
                if !self.capacity_learned {
                    self.capacity_learned = true;
                    self.pool.set_default_size(platform.len());
                }
                copy_out(&mut self.pool, platform, info)
            }
        };

        match sample {
            Ok(sample) => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                let output = OutputDescriptor {
                    info: *sample.info(),
                    buffer: sample.buffer_id(),
                    generation,
                    sequence,
                };
                self.sent.push_back(SentOutput {
                    sequence,
                    slot,
                    sample,
                });
                trace!(%slot, sequence, timestamp_us = info.timestamp_us, "output delivered");
                events.enqueue(SessionEvent::Output { output });
            }
            Err(err) => {
                error!(%slot, error = %err, "cannot copy codec output, stopping output");
                if let Err(err) = codec.release_output(slot, false) {
                    debug!(%slot, error = %err, "output slot already gone");
                }
                self.stop(codec);
                events.enqueue(SessionEvent::Error { fatal: true });
            }
        }
    }

    pub fn on_format_changed(&mut self, format: MediaFormat, events: &EventDispatcher) {
        if self.stopped {
            trace!("output stopped, ignoring format change");
            return;
        }
        events.enqueue(SessionEvent::FormatChanged { format });
    }

    /// Release the oldest delivered output. Returns whether anything was released.
    ///
    /// Releases must name outputs in delivery order; an output that was already
    /// released (or belongs to an earlier generation) is a no-op.
    pub fn release(
        &mut self,
        release: OutputRelease,
        generation: u32,
        codec: &mut dyn PlatformCodec,
    ) -> Result<bool> {
        if release.generation != generation {
            debug!(sequence = release.sequence, "ignoring release from a previous generation");
            return Ok(false);
        }
        let Some(front) = self.sent.front() else {
            trace!(sequence = release.sequence, "output already released");
            return Ok(false);
        };
        if release.sequence < front.sequence {
            trace!(sequence = release.sequence, "output already released");
            return Ok(false);
        }
        if release.sequence > front.sequence {
            return Err(Error::invalid_state(format!(
                "output {} released before output {}",
                release.sequence, front.sequence
            )));
        }

        let Some(mut sent) = self.sent.pop_front() else {
            return Ok(false);
        };
        if let Err(err) = codec.release_output(sent.slot, release.render) {
            warn!(slot = %sent.slot, error = %err, "codec refused output release");
        }
        if let Some(buffer) = sent.sample.take_buffer() {
            self.pool.recycle(buffer);
        }
        Ok(true)
    }
}

fn copy_out(pool: &mut BufferPool, platform: &[u8], info: SampleInfo) -> Result<Sample> {
    let end = info
        .offset
        .checked_add(info.size)
        .filter(|&end| end <= platform.len())
        .ok_or_else(|| {
            Error::codec(format!(
                "output {}+{} exceeds platform buffer of {} bytes",
                info.offset,
                info.size,
                platform.len()
            ))
        })?;

    let buffer = pool.obtain(info.size)?;
    if let Err(err) = buffer.memory().write(0, &platform[info.offset..end]) {
        pool.recycle(buffer);
        return Err(err);
    }
    Ok(Sample::with_buffer(buffer, SampleInfo { offset: 0, ..info }))
}
